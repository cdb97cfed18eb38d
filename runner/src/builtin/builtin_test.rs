use super::{registry, Echo, Nap, RangeHistogram, ECHO, NAP, RANGE_HISTOGRAM};
use crate::{
    control::{class_hash, JobSpec, JobWorker},
    state::StateStore,
    wire::{DequeChannel, WireReadExt, WireWriteExt},
};

#[test]
pub fn histogram_of_small_squares_lands_in_first_bin() {
    let histogram = RangeHistogram::fill(0, 10, 10);
    assert_eq!(histogram, vec![10, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
pub fn histogram_matches_sequential_count() {
    let mut expected = vec![0u64; 10];
    for i in 0u64..5000 {
        let value = ((i * i) % 1000) as f64 * 0.01;
        expected[((value / 10.0 * 10.0) as usize).min(9)] += 1;
    }

    assert_eq!(RangeHistogram::fill(0, 5000, 10), expected);
    assert_eq!(RangeHistogram::fill(0, 5000, 10).iter().sum::<u64>(), 5000);
}

#[test]
pub fn split_histograms_add_up() {
    let whole = RangeHistogram::fill(0, 3000, 10);
    let first = RangeHistogram::fill(0, 1234, 10);
    let second = RangeHistogram::fill(1234, 3000, 10);

    let combined: Vec<u64> = first.iter().zip(&second).map(|(a, b)| a + b).collect();
    assert_eq!(combined, whole);
}

#[test]
pub fn histogram_worker_checkpoints_its_result() {
    let mut state = StateStore::default();
    let spec = JobSpec::new(class_hash(RANGE_HISTOGRAM), 1, 0, 100);

    let mut io = DequeChannel::new();
    io.send(&10u64).unwrap();
    RangeHistogram.run(&spec, &mut io, &mut state).unwrap();
    let histogram: Vec<u64> = io.receive().unwrap();

    assert_eq!(histogram, RangeHistogram::fill(0, 100, 10));
    assert_eq!(
        state.get_state::<Vec<u64>>("histogram_0_100_10").unwrap(),
        histogram
    );
}

#[test]
pub fn echo_and_nap() {
    let mut state = StateStore::default();
    let mut io = DequeChannel::new();

    io.send("hello").unwrap();
    Echo.run(&JobSpec::new(class_hash(ECHO), 3, 0, 0), &mut io, &mut state)
        .unwrap();
    assert_eq!(io.receive::<String>().unwrap(), "hello");

    io.send(&1u64).unwrap();
    Nap.run(&JobSpec::new(class_hash(NAP), 9, 0, 0), &mut io, &mut state)
        .unwrap();
    assert_eq!(io.receive::<i32>().unwrap(), 9);
}

#[test]
pub fn stock_registry() {
    let registry = registry().unwrap();
    assert_eq!(registry.names(), vec![ECHO, NAP, RANGE_HISTOGRAM]);
    assert!(registry.construct(class_hash(NAP)).is_ok());
}
