use super::{split_jobs, Backend, ControlError, JobComm, JobSpec, MultiJobControl, SharedComm};
use crate::wire::{Channel, Decode, Encode, WireReadExt, WireWriteExt};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, instrument};

/// Partial results that can be combined into a total
pub trait Accumulate: Encode + Decode + Send + 'static {
    fn accumulate(&mut self, other: Self);
}

macro_rules! accumulate_number {
    ($($t:ty),*) => {
        $(
            impl Accumulate for $t {
                fn accumulate(&mut self, other: Self) {
                    *self += other;
                }
            }
        )*
    };
}

accumulate_number!(i32, i64, u32, u64, usize, f32, f64);

impl<T: Accumulate> Accumulate for Vec<T> {
    /// element-wise, extending to the longer of both
    fn accumulate(&mut self, other: Self) {
        let mut other = other.into_iter();
        for (mine, theirs) in self.iter_mut().zip(other.by_ref()) {
            mine.accumulate(theirs);
        }
        self.extend(other);
    }
}

impl<K, V> Accumulate for BTreeMap<K, V>
where
    K: Encode + Decode + Ord + Send + 'static,
    V: Accumulate,
{
    fn accumulate(&mut self, other: Self) {
        for (key, value) in other {
            match self.get_mut(&key) {
                Some(mine) => mine.accumulate(value),
                None => {
                    self.insert(key, value);
                }
            }
        }
    }
}

/// Sends the same instructions to every job and sums up what comes back
#[derive(Debug)]
pub struct AccumulateComm<I, R> {
    instructions: I,
    total: Option<R>,
    started: usize,
    harvested: usize,
}

impl<I, R> AccumulateComm<I, R>
where
    I: Encode + Send + 'static,
    R: Accumulate,
{
    pub fn new(instructions: I) -> Self {
        Self {
            instructions,
            total: None,
            started: 0,
            harvested: 0,
        }
    }

    pub fn total(&self) -> Option<&R> {
        self.total.as_ref()
    }

    pub fn take_total(&mut self) -> Option<R> {
        self.total.take()
    }

    /// jobs started but not yet harvested
    pub fn outstanding(&self) -> usize {
        self.started - self.harvested
    }
}

impl<I, R> JobComm for AccumulateComm<I, R>
where
    I: Encode + Send + 'static,
    R: Accumulate,
{
    fn start_job(&mut self, _spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError> {
        io.send(&self.instructions)?;
        self.started += 1;
        Ok(())
    }

    fn end_job(&mut self, spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError> {
        if self.harvested >= self.started {
            return Err(ControlError::HarvestedTwice);
        }

        let partial: R = io.receive()?;
        self.harvested += 1;
        match self.total.as_mut() {
            Some(total) => total.accumulate(partial),
            None => self.total = Some(partial),
        }

        debug!(uid = spec.uid, outstanding = self.outstanding(), "Accumulated job result");
        Ok(())
    }
}

/// Split `0..n_items` over `n_chunk()` jobs of class `wclass`, wait for all
/// of them and return the combined result
#[instrument(skip(control, instructions), level = "debug")]
pub fn launch_accumulate<B, I, R>(
    control: &mut MultiJobControl<B>,
    wclass: u64,
    n_items: u64,
    instructions: I,
) -> Result<Option<R>, ControlError>
where
    B: Backend,
    I: Encode + Send + 'static,
    R: Accumulate,
{
    let comm = Arc::new(Mutex::new(AccumulateComm::<I, R>::new(instructions)));
    let shared: SharedComm = comm.clone();

    for spec in split_jobs(Some(shared), control.n_chunk(), n_items, wclass, 0) {
        control.submit_job(spec)?;
    }
    control.wait_complete()?;

    let total = comm.lock().take_total();
    Ok(total)
}
