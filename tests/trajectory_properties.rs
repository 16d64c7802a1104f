//! Property tests for the trajectory generator over randomly generated segment specs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xafs_daq::physics::energy_to_k;
use xafs_daq::trajectory::{build, ScanSegmentSpec, SegmentMode};

/// Random spec with every segment active.
///
/// Boundaries are whole eV, at least 20 eV apart, energy steps stay at or below 10 eV and a
/// momentum segment only follows a boundary at or above 30 eV, so every segment
/// emits points and every momentum segment starts above the edge.
fn random_spec(rng: &mut StdRng) -> ScanSegmentSpec {
    let segments = rng.gen_range(1..=5);
    let mut boundaries = vec![f64::from(rng.gen_range(-300..-100))];
    for _ in 0..segments {
        let last = *boundaries.last().unwrap_or(&0.0);
        boundaries.push(last + f64::from(rng.gen_range(20..200)));
    }

    let mut modes = Vec::new();
    let mut step_sizes = Vec::new();
    for i in 0..segments {
        let momentum = i > 0 && boundaries[i] >= 30.0 && rng.gen_bool(0.6);
        if momentum {
            modes.push(SegmentMode::Momentum);
            step_sizes.push(rng.gen_range(0.03..0.1));
        } else {
            modes.push(SegmentMode::Energy);
            step_sizes.push(rng.gen_range(0.5..10.0));
        }
    }

    ScanSegmentSpec {
        boundaries,
        active: vec![true; segments],
        modes,
        step_sizes,
        dwell_times: (0..segments).map(|_| rng.gen_range(0.1..3.0)).collect(),
    }
}

#[test]
fn test_random_specs_give_strictly_increasing_sequences() {
    let mut rng = StdRng::seed_from_u64(20240611);
    for _ in 0..500 {
        let spec = random_spec(&mut rng);
        let sequence = build(&spec).unwrap();
        let points: Vec<f64> = sequence.iter().collect();

        assert_eq!(points.len(), sequence.len());
        assert_eq!(
            sequence.len(),
            sequence.segments().iter().map(Vec::len).sum::<usize>()
        );
        assert_eq!(sequence.segments().len(), sequence.dwell_times().len());
        for pair in points.windows(2) {
            assert!(pair[1] > pair[0], "not increasing: {pair:?} in {spec:?}");
        }
        assert_eq!(points[0], spec.boundaries[0]);
        assert!(*points.last().unwrap() <= *spec.boundaries.last().unwrap() + 1e-9);
    }
}

#[test]
fn test_random_specs_chain_segments() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
        let spec = random_spec(&mut rng);
        let sequence = build(&spec).unwrap();
        assert_eq!(sequence.segments().len(), spec.segment_count());
        assert_eq!(sequence.dwell_times(), spec.dwell_times.as_slice());

        for i in 1..spec.segment_count() {
            let previous = *sequence.segments()[i - 1].last().unwrap();
            let segment = &sequence.segments()[i];
            let step = spec.step_sizes[i];
            match spec.modes[i] {
                SegmentMode::Energy => {
                    assert!(
                        (segment[0] - (previous + step)).abs() <= 5e-6 + 1e-9,
                        "segment {i} restarted at {} instead of {}",
                        segment[0],
                        previous + step
                    );
                }
                SegmentMode::Momentum => {
                    let mut k_prev = energy_to_k(previous);
                    for &energy in segment {
                        let k = energy_to_k(energy);
                        assert!(
                            (k - k_prev - step).abs() < 1e-5,
                            "k spacing {} != {step}",
                            k - k_prev
                        );
                        k_prev = k;
                    }
                }
            }
        }
    }
}

#[test]
fn test_pre_edge_scenario_has_no_duplicate_at_shared_boundary() {
    let spec = ScanSegmentSpec {
        boundaries: vec![-200.0, -50.0, 40.0],
        active: vec![true, true],
        modes: vec![SegmentMode::Energy, SegmentMode::Energy],
        step_sizes: vec![5.0, 1.0],
        dwell_times: vec![1.0, 2.0],
    };
    let sequence = build(&spec).unwrap();
    let first = &sequence.segments()[0];
    let second = &sequence.segments()[1];

    assert_eq!(first.len(), 31);
    assert_eq!(first[0], -200.0);
    assert_eq!(*first.last().unwrap(), -50.0);
    assert_eq!(second[0], -49.0);
    assert_eq!(*second.last().unwrap(), 40.0);
    assert_eq!(second.len(), 90);
    assert_eq!(sequence.iter().filter(|e| *e == -50.0).count(), 1);
}
