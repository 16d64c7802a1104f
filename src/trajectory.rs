//! Piecewise energy trajectory generation for step scans.
//!
//! A scan range is described by N boundary energies relative to the edge (E0) and
//! N-1 segments between them. Each segment is either linear in energy or linear in
//! photoelectron wavenumber k. Active segments chain: a segment continues from the
//! last point actually emitted by the previous active segment instead of restarting
//! at its own nominal boundary, so shared boundaries are never sampled twice.
//!
//! # Example
//!
//! ```
//! use xafs_daq::trajectory::{build, ScanSegmentSpec, SegmentMode};
//!
//! let spec = ScanSegmentSpec {
//!     boundaries: vec![-200.0, -50.0, 40.0],
//!     active: vec![true, true],
//!     modes: vec![SegmentMode::Energy, SegmentMode::Energy],
//!     step_sizes: vec![5.0, 1.0],
//!     dwell_times: vec![1.0, 2.0],
//! };
//! let sequence = build(&spec).unwrap();
//! assert_eq!(sequence.first(), Some(-200.0));
//! assert_eq!(sequence.last(), Some(40.0));
//! ```

use crate::error::{AppResult, DaqError};
use crate::physics::{energy_to_k, k_to_energy};
use serde::{Deserialize, Serialize};

/// Energies are emitted with 5 decimals.
const ROUNDING_SCALE: f64 = 1e5;

/// Relative tolerance used to snap the last point onto a boundary.
const BOUNDARY_RTOL: f64 = 1e-9;

/// Spacing rule of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentMode {
    /// Uniform steps in energy (eV).
    Energy,
    /// Uniform steps in wavenumber k (1/Angstrom).
    Momentum,
}

/// Operator-facing description of a piecewise scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSegmentSpec {
    /// N boundary energies in eV relative to E0, strictly increasing.
    pub boundaries: Vec<f64>,
    /// N-1 flags; inactive segments are skipped.
    pub active: Vec<bool>,
    /// N-1 spacing rules.
    pub modes: Vec<SegmentMode>,
    /// N-1 step sizes, eV for energy segments and 1/Angstrom for momentum segments.
    pub step_sizes: Vec<f64>,
    /// N-1 counter dwell times in seconds; only active segments use theirs.
    pub dwell_times: Vec<f64>,
}

impl ScanSegmentSpec {
    /// Number of segments described by the spec.
    pub fn segment_count(&self) -> usize {
        self.boundaries.len().saturating_sub(1)
    }

    /// Check array shapes and value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if self.boundaries.len() < 2 {
            return Err(DaqError::Configuration(format!(
                "a scan needs at least 2 boundaries, got {}",
                self.boundaries.len()
            )));
        }
        let segments = self.segment_count();
        for (name, len) in [
            ("active", self.active.len()),
            ("modes", self.modes.len()),
            ("step_sizes", self.step_sizes.len()),
            ("dwell_times", self.dwell_times.len()),
        ] {
            if len != segments {
                return Err(DaqError::Configuration(format!(
                    "'{name}' has {len} entries, expected {segments}"
                )));
            }
        }
        if self.boundaries.iter().any(|b| !b.is_finite()) {
            return Err(DaqError::Configuration(
                "boundaries must be finite".to_string(),
            ));
        }
        if let Some(pair) = self.boundaries.windows(2).find(|w| w[1] <= w[0]) {
            return Err(DaqError::Configuration(format!(
                "boundaries must be strictly increasing ({} then {})",
                pair[0], pair[1]
            )));
        }
        if let Some((i, step)) = self
            .step_sizes
            .iter()
            .enumerate()
            .find(|(_, s)| !(s.is_finite() && **s > 0.0))
        {
            return Err(DaqError::Configuration(format!(
                "step size of segment {i} must be > 0, got {step}"
            )));
        }
        for i in 0..segments {
            let dwell = self.dwell_times[i];
            if self.active[i] && !(dwell.is_finite() && dwell > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "dwell time of active segment {i} must be > 0, got {dwell}"
                )));
            }
        }
        Ok(())
    }
}

/// Generated step sequence, grouped per emitted segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyStepSequence {
    segments: Vec<Vec<f64>>,
    dwell_times: Vec<f64>,
}

impl EnergyStepSequence {
    /// Energies of each emitted segment.
    pub fn segments(&self) -> &[Vec<f64>] {
        &self.segments
    }

    /// Dwell time of each emitted segment, same length as [`Self::segments`].
    pub fn dwell_times(&self) -> &[f64] {
        &self.dwell_times
    }

    /// Total number of steps.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// True when the sequence holds no steps.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All energies in scan order.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.segments.iter().flatten().copied()
    }

    /// `(energy, dwell)` pairs in scan order.
    pub fn steps(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.segments
            .iter()
            .zip(&self.dwell_times)
            .flat_map(|(segment, &dwell)| segment.iter().map(move |&e| (e, dwell)))
    }

    /// First energy of the scan.
    pub fn first(&self) -> Option<f64> {
        self.iter().next()
    }

    /// Last energy of the scan.
    pub fn last(&self) -> Option<f64> {
        self.segments.last().and_then(|s| s.last().copied())
    }

    /// First point of every segment followed by the final point of the scan.
    pub fn segment_starts(&self) -> Vec<f64> {
        let mut starts: Vec<f64> = self.segments.iter().filter_map(|s| s.first().copied()).collect();
        starts.extend(self.last());
        starts
    }

    /// Shift every energy by the edge energy, giving absolute monochromator energies.
    pub fn to_absolute(&self, e0: f64) -> Self {
        Self {
            segments: self
                .segments
                .iter()
                .map(|s| s.iter().map(|e| round5(e + e0)).collect())
                .collect(),
            dwell_times: self.dwell_times.clone(),
        }
    }
}

/// Build the step sequence for a segment spec.
///
/// # Errors
///
/// Returns [`DaqError::Configuration`] when the segment spec is malformed, when a
/// momentum-mode segment has no preceding point at or above the edge, or when no
/// active segment produces a point.
pub fn build(spec: &ScanSegmentSpec) -> AppResult<EnergyStepSequence> {
    spec.validate()?;

    let mut segments: Vec<Vec<f64>> = Vec::new();
    let mut dwell_times = Vec::new();
    let mut last: Option<f64> = None;

    for i in 0..spec.segment_count() {
        if !spec.active[i] {
            continue;
        }
        let stop = spec.boundaries[i + 1];
        let step = spec.step_sizes[i];

        let raw = match spec.modes[i] {
            SegmentMode::Energy => {
                let start = match last {
                    Some(previous) => previous + step,
                    None => spec.boundaries[i],
                };
                energy_segment(start, stop, step)
            }
            SegmentMode::Momentum => {
                let from = last.ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "momentum-mode segment {i} has no preceding segment"
                    ))
                })?;
                momentum_segment(i, from, stop, step)?
            }
        };

        let mut points: Vec<f64> = Vec::with_capacity(raw.len());
        for energy in raw.into_iter().map(round5) {
            let floor = points.last().copied().or(last);
            if floor.map_or(true, |f| energy > f) {
                points.push(energy);
            }
        }

        if let Some(&end) = points.last() {
            last = Some(end);
            segments.push(points);
            dwell_times.push(spec.dwell_times[i]);
        }
    }

    if segments.is_empty() {
        return Err(DaqError::Configuration(
            "no active segment produced a scan point".to_string(),
        ));
    }

    tracing::debug!(
        segments = segments.len(),
        points = segments.iter().map(Vec::len).sum::<usize>(),
        "built energy trajectory"
    );

    Ok(EnergyStepSequence {
        segments,
        dwell_times,
    })
}

/// `arange(start, stop, step)` plus `stop` itself when the grid lands on it.
fn energy_segment(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let span = (stop - start) / step;
    // Guard against float noise adding a point that sits on the boundary.
    let count = if span > 0.0 {
        (span - BOUNDARY_RTOL).ceil() as usize
    } else {
        0
    };
    let mut points: Vec<f64> = (0..count).map(|n| start + n as f64 * step).collect();
    if is_close(start + count as f64 * step, stop) {
        points.push(stop);
    }
    points
}

/// Uniform k steps from `from_ev` (exclusive) up to `stop_ev` (inclusive only when on grid).
fn momentum_segment(index: usize, from_ev: f64, stop_ev: f64, dk: f64) -> AppResult<Vec<f64>> {
    if from_ev < 0.0 {
        return Err(DaqError::Configuration(format!(
            "momentum-mode segment {index} starts below the edge ({from_ev} eV)"
        )));
    }
    let k0 = energy_to_k(from_ev);
    let k_stop = energy_to_k(stop_ev.max(0.0));

    let mut points = Vec::new();
    for n in 1.. {
        let k = k0 + f64::from(n) * dk;
        if is_close(k, k_stop) {
            points.push(stop_ev);
            break;
        }
        if k > k_stop {
            break;
        }
        points.push(k_to_energy(k));
    }
    Ok(points)
}

fn round5(value: f64) -> f64 {
    (value * ROUNDING_SCALE).round() / ROUNDING_SCALE
}

fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= BOUNDARY_RTOL * a.abs().max(b.abs()).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(
        boundaries: &[f64],
        active: &[bool],
        modes: &[SegmentMode],
        steps: &[f64],
    ) -> ScanSegmentSpec {
        ScanSegmentSpec {
            boundaries: boundaries.to_vec(),
            active: active.to_vec(),
            modes: modes.to_vec(),
            step_sizes: steps.to_vec(),
            dwell_times: vec![1.0; steps.len()],
        }
    }

    use SegmentMode::{Energy, Momentum};

    #[test]
    fn test_pre_edge_then_edge_region() {
        let s = spec(&[-200.0, -50.0, 40.0], &[true, true], &[Energy, Energy], &[5.0, 1.0]);
        let seq = build(&s).unwrap();

        let pre_edge = &seq.segments()[0];
        assert_eq!(pre_edge.first(), Some(&-200.0));
        assert_eq!(pre_edge.last(), Some(&-50.0));
        assert_eq!(pre_edge.len(), 31);

        let edge = &seq.segments()[1];
        assert_eq!(edge.first(), Some(&-49.0));
        assert_eq!(edge.last(), Some(&40.0));
        assert_eq!(edge.len(), 90);

        assert_eq!(seq.iter().filter(|&e| e == -50.0).count(), 1);
        assert_eq!(seq.len(), 121);
    }

    #[test]
    fn test_off_grid_boundary_is_not_snapped() {
        let s = spec(&[0.0, 10.5], &[true], &[Energy], &[2.0]);
        let seq = build(&s).unwrap();
        assert_eq!(seq.segments()[0], vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_chaining_continues_after_overshoot() {
        // Segment 0 stops at 10.0, segment 1 resumes at 10.0 + 3.0 rather than at 10.5.
        let s = spec(&[0.0, 10.5, 20.0], &[true, true], &[Energy, Energy], &[2.0, 3.0]);
        let seq = build(&s).unwrap();
        assert_eq!(seq.segments()[1][0], 13.0);
    }

    #[test]
    fn test_inactive_segment_is_skipped_and_chain_resumes() {
        let s = spec(
            &[-20.0, 0.0, 10.0, 20.0],
            &[true, false, true],
            &[Energy, Energy, Energy],
            &[10.0, 1.0, 5.0],
        );
        let seq = build(&s).unwrap();
        assert_eq!(seq.segments().len(), 2);
        assert_eq!(seq.segments()[1], vec![5.0, 10.0, 15.0, 20.0]);
    }

    #[test]
    fn test_momentum_segment_is_uniform_in_k() {
        let s = spec(&[-10.0, 40.0, 400.0], &[true, true], &[Energy, Momentum], &[10.0, 0.05]);
        let seq = build(&s).unwrap();
        let k: Vec<f64> = seq.segments()[1].iter().map(|&e| energy_to_k(e)).collect();
        assert!((k[0] - (energy_to_k(40.0) + 0.05)).abs() < 1e-5);
        for pair in k.windows(2) {
            assert!((pair[1] - pair[0] - 0.05).abs() < 1e-5);
        }
        assert!(*seq.segments()[1].last().unwrap() <= 400.0);
    }

    #[test]
    fn test_energy_after_momentum_continues_from_last_point() {
        let s = spec(
            &[0.0, 50.0, 100.0, 110.0],
            &[true, true, true],
            &[Energy, Momentum, Energy],
            &[10.0, 0.5, 2.0],
        );
        let seq = build(&s).unwrap();
        let k_last = *seq.segments()[1].last().unwrap();
        assert_eq!(seq.segments()[2][0], round5(k_last + 2.0));
    }

    #[test]
    fn test_first_active_momentum_segment_is_rejected() {
        let s = spec(&[0.0, 10.0, 100.0], &[false, true], &[Energy, Momentum], &[1.0, 0.05]);
        assert!(matches!(build(&s), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_momentum_below_edge_is_rejected() {
        let s = spec(&[-100.0, -10.0, 100.0], &[true, true], &[Energy, Momentum], &[5.0, 0.05]);
        assert!(matches!(build(&s), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_invalid_shapes_and_steps_are_rejected() {
        let too_short = spec(&[0.0], &[], &[], &[]);
        assert!(matches!(build(&too_short), Err(DaqError::Configuration(_))));

        let zero_step = spec(&[0.0, 10.0], &[true], &[Energy], &[0.0]);
        assert!(matches!(build(&zero_step), Err(DaqError::Configuration(_))));

        let negative_step = spec(&[0.0, 10.0], &[true], &[Energy], &[-1.0]);
        assert!(matches!(build(&negative_step), Err(DaqError::Configuration(_))));

        let mut mismatched = spec(&[0.0, 10.0, 20.0], &[true, true], &[Energy, Energy], &[1.0, 1.0]);
        mismatched.active.pop();
        assert!(matches!(build(&mismatched), Err(DaqError::Configuration(_))));

        let decreasing = spec(&[0.0, -10.0], &[true], &[Energy], &[1.0]);
        assert!(matches!(build(&decreasing), Err(DaqError::Configuration(_))));

        let all_inactive = spec(&[0.0, 10.0], &[false], &[Energy], &[1.0]);
        assert!(matches!(build(&all_inactive), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_rounding_removes_float_noise() {
        let s = spec(&[0.0, 1.0], &[true], &[Energy], &[0.1]);
        let seq = build(&s).unwrap();
        assert_eq!(seq.len(), 11);
        assert_eq!(seq.segments()[0][3], 0.3);
        assert_eq!(seq.last(), Some(1.0));
    }

    #[test]
    fn test_dwell_times_follow_emitted_segments() {
        let mut s = spec(
            &[-20.0, 0.0, 10.0, 20.0],
            &[true, false, true],
            &[Energy, Energy, Energy],
            &[10.0, 1.0, 5.0],
        );
        s.dwell_times = vec![0.5, 0.0, 2.0];
        let seq = build(&s).unwrap();
        assert_eq!(seq.dwell_times(), &[0.5, 2.0]);
        let steps: Vec<(f64, f64)> = seq.steps().collect();
        assert_eq!(steps.first(), Some(&(-20.0, 0.5)));
        assert_eq!(steps.last(), Some(&(20.0, 2.0)));
    }

    #[test]
    fn test_absolute_and_segment_starts() {
        let s = spec(&[-10.0, 0.0, 10.0], &[true, true], &[Energy, Energy], &[5.0, 5.0]);
        let seq = build(&s).unwrap();
        assert_eq!(seq.segment_starts(), vec![-10.0, 5.0, 10.0]);
        let absolute = seq.to_absolute(8979.0);
        assert_eq!(absolute.first(), Some(8969.0));
        assert_eq!(absolute.last(), Some(8989.0));
    }
}
