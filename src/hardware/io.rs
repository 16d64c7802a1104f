//! Timeout- and retry-bounded access to [`BeamlineHardware`].

use super::{BeamlineHardware, ScalarChannel, WaveformChannel};
use crate::config::HardwareConfig;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_transient, RetryPolicy};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Shared operator abort request.
///
/// Checked before every trajectory step and before every device write issued
/// through [`DeviceIo::write`].
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// New, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns true only for the call that actually set it.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// True once an abort was requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Reset before the next scan.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(Aborted)` when the flag is set.
    pub fn check(&self) -> AppResult<()> {
        if self.is_set() {
            Err(DaqError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Bounded device access shared by the flyer, the orchestrator and the live pipeline.
#[derive(Clone)]
pub struct DeviceIo {
    hardware: Arc<dyn BeamlineHardware>,
    io_timeout: Duration,
    retry: RetryPolicy,
    abort: AbortFlag,
}

impl DeviceIo {
    /// Wrap a driver with the configured bounds.
    pub fn new(hardware: Arc<dyn BeamlineHardware>, config: &HardwareConfig, abort: AbortFlag) -> Self {
        Self {
            hardware,
            io_timeout: config.io_timeout(),
            retry: RetryPolicy::from(config),
            abort,
        }
    }

    /// The abort flag consulted before writes.
    pub fn abort_flag(&self) -> &AbortFlag {
        &self.abort
    }

    /// Read a scalar, retrying timeouts per the retry policy.
    pub async fn read(&self, channel: ScalarChannel) -> AppResult<f64> {
        let what = format!("read {channel}");
        retry_transient(&self.retry, &what, || {
            self.bounded(&what, self.hardware.read(channel))
        })
        .await
    }

    /// Read a scalar as a boolean flag (non-zero is true).
    pub async fn read_flag(&self, channel: ScalarChannel) -> AppResult<bool> {
        Ok(self.read(channel).await? != 0.0)
    }

    /// Write a scalar unless an abort was requested. Never retried.
    pub async fn write(&self, channel: ScalarChannel, value: f64) -> AppResult<()> {
        self.abort.check()?;
        self.force_write(channel, value).await
    }

    /// Write a scalar regardless of the abort flag; used by stop and cleanup.
    pub async fn force_write(&self, channel: ScalarChannel, value: f64) -> AppResult<()> {
        let what = format!("write {channel}");
        tracing::trace!(%channel, value, "device write");
        self.bounded(&what, self.hardware.write(channel, value)).await
    }

    /// Read a waveform, retrying timeouts per the retry policy.
    pub async fn read_waveform(&self, channel: WaveformChannel) -> AppResult<Option<Vec<f64>>> {
        let what = format!("read waveform {channel}");
        retry_transient(&self.retry, &what, || {
            self.bounded(&what, self.hardware.read_waveform(channel))
        })
        .await
    }

    /// Explicit motor stop, bypassing the abort flag.
    pub async fn stop_motion(&self) -> AppResult<()> {
        self.force_write(ScalarChannel::MotorStop, 1.0).await
    }

    /// Poll [`ScalarChannel::MotionDone`] until the axis is idle or `limit` elapses.
    pub async fn wait_motion_done(&self, poll: Duration, limit: Duration) -> AppResult<()> {
        let deadline = Instant::now() + limit;
        loop {
            if self.read_flag(ScalarChannel::MotionDone).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaqError::timeout("wait for motion done", 1));
            }
            sleep(poll).await;
        }
    }

    async fn bounded<T, F>(&self, what: &str, operation: F) -> AppResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match timeout(self.io_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DaqError::Device(format!("{what}: {err:#}"))),
            Err(_) => Err(DaqError::timeout(what, 1)),
        }
    }
}
