//! Hardware channel contract of the beamline.
//!
//! The monochromator and the buffered counter card are reached through scalar
//! channels (read/write) and five waveform channels that fill while capture mode is
//! on. Drivers implement [`BeamlineHardware`]; the rest of the crate only talks to
//! hardware through [`io::DeviceIo`], which bounds every call with a timeout.

pub mod io;
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

/// Scalar read/write channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarChannel {
    /// Monochromator theta setpoint/readback, degrees. Writing it starts a move.
    MotorPosition,
    /// Theta speed, degrees per second.
    MotorSpeed,
    /// Writing 1 stops motion.
    MotorStop,
    /// 1 when the axis is idle, 0 while moving.
    MotionDone,
    /// Encoder resolution, degrees per count.
    EncoderResolution,
    /// 1 while the counter card stores samples into the waveforms.
    CaptureMode,
    /// Encoder counts between two stored samples.
    CaptureStepSize,
    /// Writing 1 clears the waveforms and the sample index.
    CaptureReset,
    /// Counter preset; 0 counts until capture mode is switched off.
    CapturePreset,
    /// User offset of the theta axis, degrees. Energy calibration writes it.
    ThetaOffset,
}

impl ScalarChannel {
    /// Stable name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            ScalarChannel::MotorPosition => "MotorPosition",
            ScalarChannel::MotorSpeed => "MotorSpeed",
            ScalarChannel::MotorStop => "MotorStop",
            ScalarChannel::MotionDone => "MotionDone",
            ScalarChannel::EncoderResolution => "EncoderResolution",
            ScalarChannel::CaptureMode => "CaptureMode",
            ScalarChannel::CaptureStepSize => "CaptureStepSize",
            ScalarChannel::CaptureReset => "CaptureReset",
            ScalarChannel::CapturePreset => "CapturePreset",
            ScalarChannel::ThetaOffset => "ThetaOffset",
        }
    }
}

impl fmt::Display for ScalarChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Buffered waveform channels filled during capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaveformChannel {
    /// Encoder counts relative to the last capture reset.
    Encoder,
    /// Incident intensity counter.
    I0,
    /// Transmitted intensity counter.
    It,
    /// Fluorescence counter.
    If,
    /// Reference foil counter.
    Ir,
}

impl WaveformChannel {
    /// All channels in drain order.
    pub const ALL: [WaveformChannel; 5] = [
        WaveformChannel::Encoder,
        WaveformChannel::I0,
        WaveformChannel::It,
        WaveformChannel::If,
        WaveformChannel::Ir,
    ];

    /// Stable name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            WaveformChannel::Encoder => "Encoder",
            WaveformChannel::I0 => "I0",
            WaveformChannel::It => "It",
            WaveformChannel::If => "If",
            WaveformChannel::Ir => "Ir",
        }
    }
}

impl fmt::Display for WaveformChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Driver seam for the monochromator and counter card.
#[async_trait]
pub trait BeamlineHardware: Send + Sync {
    /// Read a scalar channel.
    async fn read(&self, channel: ScalarChannel) -> Result<f64>;

    /// Write a scalar channel. Writing [`ScalarChannel::MotorPosition`] returns as
    /// soon as the move is issued.
    async fn write(&self, channel: ScalarChannel, value: f64) -> Result<()>;

    /// Read a whole waveform. `None` means the channel had nothing to report.
    async fn read_waveform(&self, channel: WaveformChannel) -> Result<Option<Vec<f64>>>;
}
