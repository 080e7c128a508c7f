//! Bounded concurrency for registry and archive I/O
//!
//! [`Throttle`] is a counting gate: at most `capacity` units of work hold a
//! [`ThrottlePermit`] at any time. The permit releases its slot when dropped, so
//! a release without a matching acquire cannot be expressed.
//!
//! [`fan_out`] launches one future per item, gated by a throttle, waits for all of
//! them and reports the first error; [`settle_all`] does the same for futures that
//! manage their own gating. Siblings of a failed unit keep running to
//! completion; their results are discarded.

use crate::error::{RegistryError, Result};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of in-flight registry operations
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held slot of a [`Throttle`]; dropping it releases the slot
#[derive(Debug)]
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
}

impl Throttle {
    /// Create a gate admitting `capacity` concurrent holders (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait until a slot is free and take it
    pub async fn take(&self) -> Result<ThrottlePermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| RegistryError::Internal(format!("Concurrency gate closed: {}", e)))?;
        Ok(ThrottlePermit { _permit: permit })
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// Run `task` for every item with at most `throttle.capacity()` in flight.
///
/// Results are returned in input order. When any unit fails, every launched unit
/// is still awaited and the first error in input order is returned.
pub async fn fan_out<I, T, F, Fut>(throttle: &Throttle, items: I, task: F) -> Result<Vec<T>>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let futures = items.into_iter().map(|item| {
        let fut = task(item);
        async move {
            let _permit = throttle.take().await?;
            fut.await
        }
    });

    settle_all(futures).await
}

/// Await every future and return the first error in input order.
///
/// Unlike [`fan_out`] no slot is held while a unit runs; units that recurse into
/// further fan-outs gate their own registry calls instead.
pub async fn settle_all<I, T>(futures: I) -> Result<Vec<T>>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T>>,
{
    join_all(futures).await.into_iter().collect()
}
