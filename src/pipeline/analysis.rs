//! Per-run numeric processing: dark correction, derived quantities, derivative.

use crate::error::{AppResult, DaqError};
use crate::physics::EncoderGeometry;
use crate::store::{DarkRates, RunRecord, ScanMode};
use serde::{Deserialize, Serialize};

/// Quantity plotted on the y axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum YQuantity {
    /// `-ln(It / I0)`.
    #[default]
    Transmittance,
    /// `If / I0`.
    Fluorescence,
    /// `-ln(Ir / It)`.
    Reference,
    /// Raw I0.
    I0,
    /// Raw It.
    It,
    /// Raw If.
    If,
    /// Raw Ir.
    Ir,
}

impl YQuantity {
    /// Axis label.
    pub fn label(self) -> &'static str {
        match self {
            YQuantity::Transmittance => "Transmittance",
            YQuantity::Fluorescence => "Fluorescence",
            YQuantity::Reference => "Reference",
            YQuantity::I0 => "I0",
            YQuantity::It => "It",
            YQuantity::If => "If",
            YQuantity::Ir => "Ir",
        }
    }
}

/// Quantity plotted on the x axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum XAxis {
    /// `E - E0`.
    #[default]
    RelativeEnergy,
    /// Monochromator energy.
    AbsoluteEnergy,
    /// Sample index.
    Index,
}

/// Samples of one run, columns of equal length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSamples {
    /// Energy per sample, eV.
    pub energy: Vec<f64>,
    /// Counting time per sample, seconds; zero when unknown.
    pub dwell: Vec<f64>,
    /// Incident intensity.
    pub i0: Vec<f64>,
    /// Transmitted intensity.
    pub it: Vec<f64>,
    /// Fluorescence.
    pub i_f: Vec<f64>,
    /// Reference.
    pub ir: Vec<f64>,
}

impl RunSamples {
    /// Samples from a persisted run. Fly runs convert encoder counts to energy.
    pub fn from_record(run: &RunRecord) -> AppResult<Self> {
        let primary = &run.primary;
        let (energy, dwell) = match run.metadata.mode {
            ScanMode::Step => (primary.energy.clone(), primary.dwell.clone()),
            ScanMode::Fly => {
                let geometry = run.metadata.fly_geometry.ok_or_else(|| {
                    DaqError::DataUnavailable(format!(
                        "fly run {} has no geometry",
                        run.metadata.uid
                    ))
                })?;
                let encoder = geometry.encoder();
                let energy = primary.encoder.iter().map(|&c| encoder.energy(c)).collect::<Vec<_>>();
                let dwell = vec![0.0; energy.len()];
                (energy, dwell)
            }
        };
        Ok(Self::truncated(
            energy,
            dwell,
            primary.i0.clone(),
            primary.it.clone(),
            primary.i_f.clone(),
            primary.ir.clone(),
        ))
    }

    /// Samples from live waveforms `[encoder, I0, It, If, Ir]`.
    pub fn from_waveforms(columns: [Vec<f64>; 5], geometry: &EncoderGeometry) -> Self {
        let [encoder, i0, it, i_f, ir] = columns;
        let energy: Vec<f64> = encoder.iter().map(|&c| geometry.energy(c)).collect();
        let dwell = vec![0.0; energy.len()];
        Self::truncated(energy, dwell, i0, it, i_f, ir)
    }

    fn truncated(
        mut energy: Vec<f64>,
        mut dwell: Vec<f64>,
        mut i0: Vec<f64>,
        mut it: Vec<f64>,
        mut i_f: Vec<f64>,
        mut ir: Vec<f64>,
    ) -> Self {
        let n = [energy.len(), dwell.len(), i0.len(), it.len(), i_f.len(), ir.len()]
            .into_iter()
            .min()
            .unwrap_or(0);
        for column in [&mut energy, &mut dwell, &mut i0, &mut it, &mut i_f, &mut ir] {
            column.truncate(n);
        }
        Self {
            energy,
            dwell,
            i0,
            it,
            i_f,
            ir,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.energy.len()
    }

    /// True without samples.
    pub fn is_empty(&self) -> bool {
        self.energy.is_empty()
    }

    /// Subtract `rate * dwell` from every counter sample.
    pub fn dark_corrected(&self, dark: &DarkRates) -> Self {
        let correct = |column: &[f64], rate: f64| -> Vec<f64> {
            column
                .iter()
                .zip(&self.dwell)
                .map(|(&raw, &dwell)| dark_correct(raw, rate, dwell))
                .collect()
        };
        Self {
            energy: self.energy.clone(),
            dwell: self.dwell.clone(),
            i0: correct(&self.i0, dark.i0),
            it: correct(&self.it, dark.it),
            i_f: correct(&self.i_f, dark.i_f),
            ir: correct(&self.ir, dark.ir),
        }
    }
}

/// `raw - rate * dwell`.
pub fn dark_correct(raw: f64, rate: f64, dwell: f64) -> f64 {
    raw - rate * dwell
}

/// Compute `(x, y)` for a run, dropping pairs where either value is not finite.
///
/// An empty run gives empty vectors. A non-empty run whose every pair is
/// non-finite is [`DaqError::DataUnavailable`].
pub fn derive(samples: &RunSamples, y: YQuantity, x: XAxis, e0: f64) -> AppResult<(Vec<f64>, Vec<f64>)> {
    let ys: Vec<f64> = match y {
        YQuantity::Transmittance => zip_map(&samples.it, &samples.i0, |it, i0| -(it / i0).ln()),
        YQuantity::Fluorescence => zip_map(&samples.i_f, &samples.i0, |i_f, i0| i_f / i0),
        YQuantity::Reference => zip_map(&samples.ir, &samples.it, |ir, it| -(ir / it).ln()),
        YQuantity::I0 => samples.i0.clone(),
        YQuantity::It => samples.it.clone(),
        YQuantity::If => samples.i_f.clone(),
        YQuantity::Ir => samples.ir.clone(),
    };
    let xs: Vec<f64> = match x {
        XAxis::RelativeEnergy => samples.energy.iter().map(|e| e - e0).collect(),
        XAxis::AbsoluteEnergy => samples.energy.clone(),
        XAxis::Index => (0..samples.len()).map(|i| i as f64).collect(),
    };

    let (xs, ys): (Vec<f64>, Vec<f64>) = xs
        .into_iter()
        .zip(ys)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .unzip();

    if xs.is_empty() && !samples.is_empty() {
        return Err(DaqError::DataUnavailable(
            "no finite samples in window".to_string(),
        ));
    }
    Ok((xs, ys))
}

fn zip_map(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter().zip(b).map(|(&a, &b)| f(a, b)).collect()
}

/// One-sided backward difference; the first point uses points 0 and 1.
///
/// Non-finite results are skipped together with their x.
pub fn backward_derivative(x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = x.len().min(y.len());
    if n < 2 {
        return (Vec::new(), Vec::new());
    }
    (0..n)
        .map(|i| {
            let (a, b) = if i == 0 { (0, 1) } else { (i - 1, i) };
            (x[i], (y[b] - y[a]) / (x[b] - x[a]))
        })
        .filter(|(_, d)| d.is_finite())
        .unzip()
}

/// x of the largest derivative value.
pub fn derivative_peak(x: &[f64], d: &[f64]) -> Option<f64> {
    x.iter()
        .zip(d)
        .fold(None, |best: Option<(f64, f64)>, (&x, &d)| match best {
            Some((_, top)) if top >= d => best,
            _ => Some((x, d)),
        })
        .map(|(x, _)| x)
}

/// Round to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(i0: Vec<f64>, it: Vec<f64>) -> RunSamples {
        let n = i0.len();
        RunSamples {
            energy: (0..n).map(|i| 8970.0 + i as f64).collect(),
            dwell: vec![2.0; n],
            i_f: vec![1.0; n],
            ir: vec![1.0; n],
            i0,
            it,
        }
    }

    #[test]
    fn test_dark_correction() {
        assert_eq!(dark_correct(120.0, 10.0, 2.0), 100.0);

        let raw = samples(vec![120.0], vec![60.0]);
        let dark = DarkRates {
            i0: 10.0,
            it: 5.0,
            i_f: 0.0,
            ir: 0.0,
        };
        let corrected = raw.dark_corrected(&dark);
        assert_eq!(corrected.i0, vec![100.0]);
        assert_eq!(corrected.it, vec![50.0]);
        assert_eq!(corrected.i_f, vec![1.0]);
    }

    #[test]
    fn test_backward_derivative() {
        let (x, d) = backward_derivative(&[1.0, 2.0, 3.0], &[10.0, 12.0, 17.0]);
        assert_eq!(x, vec![1.0, 2.0, 3.0]);
        assert_eq!(d, vec![2.0, 2.0, 5.0]);
    }

    #[test]
    fn test_derivative_skips_non_finite() {
        let (x, d) = backward_derivative(&[1.0, 1.0, 2.0], &[0.0, 1.0, 3.0]);
        assert_eq!(x, vec![2.0]);
        assert_eq!(d, vec![2.0]);
        assert!(backward_derivative(&[1.0], &[1.0]).0.is_empty());
    }

    #[test]
    fn test_non_finite_pairs_dropped_in_lock_step() {
        let s = samples(vec![100.0, 0.0, 100.0], vec![50.0, 50.0, 25.0]);
        let (x, y) = derive(&s, YQuantity::Transmittance, XAxis::RelativeEnergy, 8970.0).unwrap();
        assert_eq!(x, vec![0.0, 2.0]);
        assert!((y[0] - 2f64.ln()).abs() < 1e-12);
        assert!((y[1] - 4f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_all_non_finite_is_data_unavailable() {
        let s = samples(vec![0.0, 0.0], vec![0.0, 0.0]);
        assert!(matches!(
            derive(&s, YQuantity::Fluorescence, XAxis::Index, 0.0),
            Err(DaqError::DataUnavailable(_))
        ));
        let empty = RunSamples::default();
        assert_eq!(
            derive(&empty, YQuantity::I0, XAxis::Index, 0.0).unwrap(),
            (vec![], vec![])
        );
    }

    #[test]
    fn test_x_axes() {
        let s = samples(vec![1.0, 1.0], vec![1.0, 1.0]);
        let (abs, _) = derive(&s, YQuantity::I0, XAxis::AbsoluteEnergy, 8970.0).unwrap();
        assert_eq!(abs, vec![8970.0, 8971.0]);
        let (index, _) = derive(&s, YQuantity::I0, XAxis::Index, 8970.0).unwrap();
        assert_eq!(index, vec![0.0, 1.0]);
    }

    #[test]
    fn test_peak_and_rounding() {
        assert_eq!(derivative_peak(&[1.0, 2.0, 3.0], &[0.5, 4.0, 1.0]), Some(2.0));
        assert_eq!(derivative_peak(&[], &[]), None);
        assert_eq!(round_to(8980.123456, 4), 8980.1235);
        assert_eq!(round_to(1234.5678, 2), 1234.57);
    }
}
