//! Event bus message schema.
//!
//! Every message travels as one UTF-8 line `"<Kind>:<payload>"` (payload-less kinds
//! omit the colon). The line is split on the first colon only, so payloads may
//! contain colons. Unknown kinds decode to `Ok(None)` so that newer peers can add
//! kinds without breaking older ones; a known kind with an unparsable payload is an
//! error the receiver logs and drops.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scan category selected by the controller tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScanCategory {
    /// Regular XAFS measurement.
    #[default]
    Measure,
    /// Energy calibration against a reference foil.
    Calibration,
    /// Monochromator alignment, plotted against sample index.
    Align,
}

impl ScanCategory {
    /// Tab index used on the wire.
    pub fn index(self) -> u8 {
        match self {
            ScanCategory::Measure => 0,
            ScanCategory::Calibration => 1,
            ScanCategory::Align => 2,
        }
    }

    /// Default x-axis label shown for this category.
    pub fn x_label(self) -> &'static str {
        match self {
            ScanCategory::Measure | ScanCategory::Calibration => "Energy [eV]",
            ScanCategory::Align => "index",
        }
    }

    /// Inverse of [`ScanCategory::index`].
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(ScanCategory::Measure),
            1 => Some(ScanCategory::Calibration),
            2 => Some(ScanCategory::Align),
            _ => None,
        }
    }
}

impl fmt::Display for ScanCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanCategory::Measure => "measure",
            ScanCategory::Calibration => "calibration",
            ScanCategory::Align => "align",
        })
    }
}

/// Plot axis addressed by a label update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    /// Horizontal axis.
    X,
    /// Vertical axis.
    Y,
}

/// State of the controller's plan engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EngineState {
    /// No scan running.
    #[default]
    Idle,
    /// Scan in progress.
    Running,
    /// Scan paused.
    Paused,
    /// Abort in progress.
    Aborting,
}

impl EngineState {
    fn as_wire(self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Aborting => "aborting",
        }
    }
}

/// Which alignment readback a [`EventMessage::DcmReadback`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DcmChannel {
    /// Last I0 value.
    I0,
    /// Last I0 value scaled by the alignment ratio.
    I0Scaled,
}

/// One event bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventMessage {
    // controller -> viewer
    /// Controller switched tabs.
    TabChanged(ScanCategory),
    /// New data may be available.
    UpdateViewer,
    /// Axis label text.
    SetAxisLabel {
        /// Axis to relabel.
        axis: Axis,
        /// New label.
        label: String,
    },
    /// Scan-in-progress indicator.
    SetBlink(bool),
    /// Plan engine state.
    EngineState(EngineState),
    /// Remove one named curve.
    RemoveCurve(String),
    /// Remove every curve.
    RemoveCurves,
    /// Unix time at which the current fly scan started.
    FlyStartTime(f64),
    /// `true` disables the viewer's abort button.
    DisableAbortButton(bool),

    // viewer -> controller
    /// Derivative peak energy, eV.
    PeakEnergyLabel(f64),
    /// Derivative peak minus E0, eV.
    EnergyDifferenceLabel(f64),
    /// Scan progress, percent.
    ProgressBar(u8),
    /// Operator pressed abort in the viewer.
    Abort,
    /// Viewer came up and wants the current tab and labels.
    ViewerInitialized,
    /// Alignment readback.
    DcmReadback {
        /// Readback slot.
        channel: DcmChannel,
        /// Value, 2 decimals.
        value: f64,
    },
}

impl EventMessage {
    /// Wire kind of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            EventMessage::TabChanged(_) => "tabChanged",
            EventMessage::UpdateViewer => "UpdateViewer",
            EventMessage::SetAxisLabel { axis: Axis::X, .. } => "XLabel",
            EventMessage::SetAxisLabel { axis: Axis::Y, .. } => "YLabel",
            EventMessage::SetBlink(_) => "Blink",
            EventMessage::EngineState(_) => "RunEngine",
            EventMessage::RemoveCurve(_) => "RemoveCurve",
            EventMessage::RemoveCurves => "RemoveCurves",
            EventMessage::FlyStartTime(_) => "FlyStartTime",
            EventMessage::DisableAbortButton(_) => "DisableAbortButton",
            EventMessage::PeakEnergyLabel(_) => "EcalPeakEnergyLabel",
            EventMessage::EnergyDifferenceLabel(_) => "EcalEnergyDifferenceLabel",
            EventMessage::ProgressBar(_) => "ProgressBar",
            EventMessage::Abort => "Abort",
            EventMessage::ViewerInitialized => "ViewerInitialized",
            EventMessage::DcmReadback {
                channel: DcmChannel::I0,
                ..
            } => "DCM_I0",
            EventMessage::DcmReadback {
                channel: DcmChannel::I0Scaled,
                ..
            } => "DCM_I0_2",
        }
    }

    /// Encode as one wire line (no trailing newline).
    pub fn to_wire(&self) -> String {
        let kind = self.kind();
        let payload = match self {
            EventMessage::TabChanged(category) => Some(category.index().to_string()),
            EventMessage::SetAxisLabel { label, .. } => Some(label.clone()),
            EventMessage::SetBlink(on) | EventMessage::DisableAbortButton(on) => {
                Some(on.to_string())
            }
            EventMessage::EngineState(state) => Some(state.as_wire().to_string()),
            EventMessage::RemoveCurve(name) => Some(name.clone()),
            EventMessage::FlyStartTime(value)
            | EventMessage::PeakEnergyLabel(value)
            | EventMessage::EnergyDifferenceLabel(value)
            | EventMessage::DcmReadback { value, .. } => Some(value.to_string()),
            EventMessage::ProgressBar(percent) => Some(percent.to_string()),
            EventMessage::UpdateViewer
            | EventMessage::RemoveCurves
            | EventMessage::Abort
            | EventMessage::ViewerInitialized => None,
        };
        match payload {
            Some(payload) => format!("{kind}:{}", payload.replace('\n', " ")),
            None => kind.to_string(),
        }
    }

    /// Decode one wire line.
    ///
    /// Returns `Ok(None)` for unknown kinds and [`DaqError::Bus`] for a known kind
    /// whose payload cannot be parsed.
    pub fn from_wire(line: &str) -> Result<Option<Self>, DaqError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (kind, payload) = match line.split_once(':') {
            Some((kind, payload)) => (kind, payload),
            None => (line, ""),
        };
        let bad = |what: &str| DaqError::Bus(format!("{kind}: cannot parse {what} from {payload:?}"));
        let number = || payload.trim().parse::<f64>().map_err(|_| bad("a number"));

        let message = match kind {
            "tabChanged" => {
                let index = payload.trim().parse::<u8>().map_err(|_| bad("a tab index"))?;
                EventMessage::TabChanged(ScanCategory::from_index(index).ok_or_else(|| bad("a tab index"))?)
            }
            "UpdateViewer" => EventMessage::UpdateViewer,
            "XLabel" => EventMessage::SetAxisLabel {
                axis: Axis::X,
                label: payload.to_string(),
            },
            "YLabel" => EventMessage::SetAxisLabel {
                axis: Axis::Y,
                label: payload.to_string(),
            },
            "Blink" => EventMessage::SetBlink(parse_bool(payload)),
            "RunEngine" => EventMessage::EngineState(match payload.trim().to_ascii_lowercase().as_str() {
                "idle" => EngineState::Idle,
                "running" => EngineState::Running,
                "paused" => EngineState::Paused,
                "aborting" => EngineState::Aborting,
                _ => return Err(bad("an engine state")),
            }),
            "RemoveCurve" => EventMessage::RemoveCurve(payload.to_string()),
            "RemoveCurves" => EventMessage::RemoveCurves,
            "FlyStartTime" => EventMessage::FlyStartTime(number()?),
            "DisableAbortButton" => EventMessage::DisableAbortButton(parse_bool(payload)),
            "EcalPeakEnergyLabel" => EventMessage::PeakEnergyLabel(number()?),
            "EcalEnergyDifferenceLabel" => EventMessage::EnergyDifferenceLabel(number()?),
            "ProgressBar" => {
                let percent = number()?;
                EventMessage::ProgressBar(percent.clamp(0.0, 100.0) as u8)
            }
            "Abort" => EventMessage::Abort,
            "ViewerInitialized" => EventMessage::ViewerInitialized,
            "DCM_I0" => EventMessage::DcmReadback {
                channel: DcmChannel::I0,
                value: number()?,
            },
            "DCM_I0_2" => EventMessage::DcmReadback {
                channel: DcmChannel::I0Scaled,
                value: number()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

impl fmt::Display for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// `true`/`1` in any case are true, everything else is false.
pub fn parse_bool(payload: &str) -> bool {
    let payload = payload.trim();
    payload.eq_ignore_ascii_case("true") || payload == "1"
}
