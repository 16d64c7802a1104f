//! Monochromator and photoelectron conversions.
//!
//! The beamline uses a Si(111) double-crystal monochromator. Energies are in eV,
//! angles in degrees, wavenumbers in inverse Angstrom.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// hc in eV*Angstrom.
pub const HC: f64 = 12398.5;

/// Si(111) lattice plane spacing in Angstrom.
pub const SI_111_D: f64 = 5.4309 / 1.732_050_807_568_877_2;

/// Conversion factor between sqrt(E [eV]) and k [1/Angstrom].
pub const K_FACTOR: f64 = 0.512;

/// Bragg angle (degrees) to photon energy (eV).
pub fn angle_to_energy(theta_deg: f64) -> f64 {
    HC / (2.0 * SI_111_D * theta_deg.to_radians().sin())
}

/// Photon energy (eV) to Bragg angle (degrees).
///
/// Fails for energies below the Si(111) cut-off, where no reflection exists.
pub fn energy_to_angle(energy_ev: f64) -> AppResult<f64> {
    let sin_theta = HC / (2.0 * SI_111_D * energy_ev);
    if !sin_theta.is_finite() || !(0.0..=1.0).contains(&sin_theta) {
        return Err(DaqError::Configuration(format!(
            "energy {energy_ev} eV is not reachable with Si(111)"
        )));
    }
    Ok(sin_theta.asin().to_degrees())
}

/// Energy above the edge (eV) to photoelectron wavenumber.
pub fn energy_to_k(energy_ev: f64) -> f64 {
    K_FACTOR * energy_ev.sqrt()
}

/// Photoelectron wavenumber to energy above the edge (eV).
pub fn k_to_energy(k: f64) -> f64 {
    (k / K_FACTOR).powi(2)
}

/// Linear encoder calibration of the monochromator theta axis.
///
/// The encoder counts down while theta increases on the reference beamline, so
/// `sign` is usually negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderGeometry {
    /// Direction of the encoder relative to theta, +1 or -1.
    pub sign: f64,
    /// Degrees per encoder count.
    pub resolution: f64,
    /// Theta (degrees) at which the capture counters were reset.
    pub start_angle: f64,
}

impl EncoderGeometry {
    /// Encoder counts to theta in degrees.
    pub fn angle(&self, counts: f64) -> f64 {
        self.sign * counts * self.resolution + self.start_angle
    }

    /// Encoder counts to photon energy in eV.
    pub fn energy(&self, counts: f64) -> f64 {
        angle_to_energy(self.angle(counts))
    }

    /// Theta in degrees to (fractional) encoder counts.
    pub fn counts(&self, angle: f64) -> f64 {
        (angle - self.start_angle) / (self.sign * self.resolution)
    }
}
