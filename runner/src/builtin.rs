use crate::{
    control::{ControlError, JobSpec, JobWorker, WorkerRegistry},
    state::StateStore,
    wire::{Channel, WireReadExt, WireWriteExt},
};
use rayon::prelude::*;
use std::{thread, time::Duration};
use tracing::trace;

#[cfg(test)]
mod builtin_test;

pub const ECHO: &str = "Echo";
pub const RANGE_HISTOGRAM: &str = "RangeHistogram";
pub const NAP: &str = "Nap";

/// Sends its string payload back
#[derive(Debug, Default)]
pub struct Echo;

impl JobWorker for Echo {
    fn run(
        &mut self,
        _spec: &JobSpec,
        io: &mut dyn Channel,
        _state: &mut StateStore,
    ) -> Result<(), ControlError> {
        let message: String = io.receive()?;
        io.send(&message)?;
        Ok(())
    }
}

/// Histogram of `((i * i) % 1000) * 0.01` over the job's range, the bin
/// count is the payload. Results are checkpointed per range.
#[derive(Debug, Default)]
pub struct RangeHistogram;

impl RangeHistogram {
    pub fn fill(n0: u64, n1: u64, bins: usize) -> Vec<u64> {
        let bins = bins.max(1);

        (n0..n1)
            .into_par_iter()
            .fold(
                || vec![0u64; bins],
                |mut histogram, i| {
                    let value = (i.wrapping_mul(i) % 1000) as f64 * 0.01;
                    let bin = ((value / 10.0 * bins as f64) as usize).min(bins - 1);
                    histogram[bin] += 1;
                    histogram
                },
            )
            .reduce(
                || vec![0u64; bins],
                |mut left, right| {
                    left.iter_mut().zip(right).for_each(|(l, r)| *l += r);
                    left
                },
            )
    }
}

impl JobWorker for RangeHistogram {
    fn run(
        &mut self,
        spec: &JobSpec,
        io: &mut dyn Channel,
        state: &mut StateStore,
    ) -> Result<(), ControlError> {
        let bins: u64 = io.receive()?;
        let key = format!("histogram_{}_{}_{}", spec.n0, spec.n1, bins);

        let histogram = if state.check_state(&key)? {
            trace!(key = %key, "Reusing checkpointed histogram");
            state.get_state::<Vec<u64>>(&key)?
        } else {
            let histogram = Self::fill(spec.n0, spec.n1, bins as usize);
            state.push_state(&key, &histogram)?;
            histogram
        };

        io.send(&histogram)?;
        Ok(())
    }
}

/// Sleeps for the requested milliseconds and answers with its uid
#[derive(Debug, Default)]
pub struct Nap;

impl JobWorker for Nap {
    fn run(
        &mut self,
        spec: &JobSpec,
        io: &mut dyn Channel,
        _state: &mut StateStore,
    ) -> Result<(), ControlError> {
        let millis: u64 = io.receive()?;
        thread::sleep(Duration::from_millis(millis));
        io.send(&spec.uid)?;
        Ok(())
    }
}

/// registry holding every stock worker class
pub fn registry() -> Result<WorkerRegistry, ControlError> {
    let mut registry = WorkerRegistry::new();
    registry.register(ECHO, || Box::new(Echo))?;
    registry.register(RANGE_HISTOGRAM, || Box::new(RangeHistogram))?;
    registry.register(NAP, || Box::new(Nap))?;

    Ok(registry)
}
