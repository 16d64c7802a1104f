//! Controller half: handler for viewer -> controller messages.

use crate::bus::{EventHandler, EventSender};
use crate::error::{AppResult, DaqError};
use crate::messages::{Axis, DcmChannel, EventMessage, ScanCategory};
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Values reported back by the viewer, shown on the controller panel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControllerStatus {
    /// Tab selected on the controller.
    pub category: ScanCategory,
    /// Scan progress, percent.
    pub progress: u8,
    /// Edge position found by the last calibration scan, eV.
    pub peak_energy: Option<f64>,
    /// Peak minus E0, eV.
    pub energy_difference: Option<f64>,
    /// Theta offset written by the last calibration, degrees.
    pub theta_offset: Option<f64>,
    /// Last I0 reading during alignment.
    pub dcm_i0: Option<f64>,
    /// Scaled I0 target during alignment.
    pub dcm_i0_scaled: Option<f64>,
    /// Times the viewer announced itself.
    pub viewer_announcements: u32,
}

/// Controller-side event handler.
pub struct ControllerInbox {
    orchestrator: Arc<Orchestrator>,
    to_viewer: EventSender,
    status: RwLock<ControllerStatus>,
}

impl ControllerInbox {
    /// Handler driving `orchestrator` and answering the viewer on `to_viewer`.
    pub fn new(orchestrator: Arc<Orchestrator>, to_viewer: EventSender) -> Self {
        Self {
            orchestrator,
            to_viewer,
            status: RwLock::new(ControllerStatus::default()),
        }
    }

    /// Snapshot of the status panel.
    pub async fn status(&self) -> ControllerStatus {
        *self.status.read().await
    }

    /// Operator switched tab on the controller.
    pub async fn set_tab(&self, category: ScanCategory) {
        {
            let mut status = self.status.write().await;
            if status.category != category {
                status.progress = 0;
            }
            status.category = category;
        }
        self.publish_tab(category);
    }

    /// Pause the running scan.
    pub fn pause(&self) -> bool {
        self.orchestrator.pause()
    }

    /// Resume a paused scan.
    pub fn resume(&self) -> bool {
        self.orchestrator.resume()
    }

    /// Compensate the energy offset found by the last calibration scan.
    ///
    /// Uses the peak and difference the viewer reported; E0 is their difference.
    pub async fn apply_calibration(&self) -> AppResult<f64> {
        let status = self.status().await;
        let (Some(peak), Some(difference)) = (status.peak_energy, status.energy_difference) else {
            return Err(DaqError::DataUnavailable(
                "no calibration peak reported yet".to_string(),
            ));
        };
        let e0 = peak - difference;
        info!(e0, difference, "compensating energy offset");
        let offset = match self.orchestrator.compensate_energy_offset(e0, difference).await {
            Ok(offset) => offset,
            Err(err) => {
                warn!(error = %err, "energy offset compensation failed");
                return Err(err);
            }
        };
        self.status.write().await.theta_offset = Some(offset);
        Ok(offset)
    }

    /// Apply an operator-entered energy offset from a zeroed theta offset.
    pub async fn set_energy_offset(&self, e0: f64, offset_energy: f64) -> AppResult<f64> {
        let offset = self.orchestrator.set_energy_offset(e0, offset_energy).await?;
        self.status.write().await.theta_offset = Some(offset);
        Ok(offset)
    }

    fn publish_tab(&self, category: ScanCategory) {
        self.to_viewer.send(&EventMessage::TabChanged(category));
        self.to_viewer.send(&EventMessage::SetAxisLabel {
            axis: Axis::X,
            label: category.x_label().to_string(),
        });
    }
}

#[async_trait]
impl EventHandler for ControllerInbox {
    async fn handle(&self, message: EventMessage) {
        match message {
            EventMessage::Abort => {
                self.orchestrator.abort().await;
            }
            EventMessage::ViewerInitialized => {
                let category = {
                    let mut status = self.status.write().await;
                    status.viewer_announcements += 1;
                    status.category
                };
                info!(%category, "viewer connected, resending tab");
                self.publish_tab(category);
            }
            EventMessage::ProgressBar(percent) => {
                self.status.write().await.progress = percent.min(100);
            }
            EventMessage::PeakEnergyLabel(energy) => {
                self.status.write().await.peak_energy = Some(energy);
            }
            EventMessage::EnergyDifferenceLabel(difference) => {
                self.status.write().await.energy_difference = Some(difference);
            }
            EventMessage::DcmReadback { channel, value } => {
                let mut status = self.status.write().await;
                match channel {
                    DcmChannel::I0 => status.dcm_i0 = Some(value),
                    DcmChannel::I0Scaled => status.dcm_i0_scaled = Some(value),
                }
            }
            other => debug!(message = %other, "controller ignores viewer-bound message"),
        }
    }
}
