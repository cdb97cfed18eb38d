use parking_lot::Mutex;
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};
use thiserror::Error;
use tracing::{trace, warn};

#[cfg(test)]
mod pool_test;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool exhausted: {outstanding} objects checked out (limit {limit})")]
    Exhausted { outstanding: usize, limit: usize },
}

/// Objects that can be wiped before going back into a pool
pub trait Reset {
    fn reset(&mut self);
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Reset for String {
    fn reset(&mut self) {
        self.clear();
    }
}

#[derive(Debug)]
struct PoolInner<T> {
    idle: Vec<T>,
    outstanding: usize,
    allocated: usize,
}

/// Pool of re-usable objects handed out as scoped checkouts
#[derive(Debug)]
pub struct Pool<T: Reset + Default> {
    inner: Arc<Mutex<PoolInner<T>>>,
    max_idle: usize,
    max_outstanding: usize,
}

impl<T: Reset + Default> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            max_idle: self.max_idle,
            max_outstanding: self.max_outstanding,
        }
    }
}

impl<T: Reset + Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new(4096, usize::MAX)
    }
}

impl<T: Reset + Default> Pool<T> {
    pub fn new(max_idle: usize, max_outstanding: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                idle: Vec::new(),
                outstanding: 0,
                allocated: 0,
            })),
            max_idle,
            max_outstanding,
        }
    }

    /// take an object out of the pool, allocating if none is idle
    pub fn checkout(&self) -> Result<Pooled<T>, PoolError> {
        let mut inner = self.inner.lock();

        if inner.outstanding >= self.max_outstanding {
            warn!(
                outstanding = inner.outstanding,
                "Refusing pool checkout, too many objects were never returned"
            );
            return Err(PoolError::Exhausted {
                outstanding: inner.outstanding,
                limit: self.max_outstanding,
            });
        }

        let item = match inner.idle.pop() {
            Some(item) => item,
            None => {
                inner.allocated += 1;
                trace!(allocated = inner.allocated, "Allocating new pool object");
                T::default()
            }
        };
        inner.outstanding += 1;

        Ok(Pooled {
            item: Some(item),
            inner: self.inner.clone(),
            max_idle: self.max_idle,
        })
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    pub fn idle(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// total number of objects ever allocated by this pool
    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }
}

/// Checked-out pool object, returned to its pool on drop
#[derive(Debug)]
pub struct Pooled<T: Reset> {
    item: Option<T>,
    inner: Arc<Mutex<PoolInner<T>>>,
    max_idle: usize,
}

impl<T: Reset> Pooled<T> {
    /// keep the object for good, releasing its pool slot
    pub fn detach(mut self) -> T {
        let item = self.item.take();
        self.inner.lock().outstanding -= 1;
        // item is always present until drop or detach
        item.unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut item) = self.item.take() {
            item.reset();

            let mut inner = self.inner.lock();
            inner.outstanding -= 1;
            if inner.idle.len() < self.max_idle {
                inner.idle.push(item);
            }
        }
    }
}
