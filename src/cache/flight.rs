//! Single-flight coordination for per-clip background work.
//!
//! A [`FlightSlot`] holds at most one in-progress [`Flight`]. Callers that
//! find a flight in the slot join it instead of starting their own, so every
//! concurrent caller observes the same result. The work runs on its own tokio
//! task, so it keeps going when the caller that started it disconnects.
//!
//! The slot lives inside per-key state guarded by a lock: check-and-start is
//! atomic because it happens under that lock, and the work clears the slot
//! (with [`FlightSlot::settle`]) under the same lock when it commits.

use crate::error::{ClipRelayError, Result};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result as seen by every waiter of a flight.
pub type FlightResult<T> = std::result::Result<T, Arc<ClipRelayError>>;

/// Identifies one flight so a late settle cannot clear a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlightId(u64);

static NEXT_FLIGHT_ID: AtomicU64 = AtomicU64::new(1);

/// Awaitable, cloneable handle to a spawned operation.
#[derive(Clone)]
pub struct Flight<T: Clone> {
    id: FlightId,
    inner: Shared<BoxFuture<'static, FlightResult<T>>>,
}

impl<T> Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn spawn<F>(id: FlightId, work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        let inner = async move {
            match handle.await {
                Ok(result) => result.map_err(Arc::new),
                Err(e) => Err(Arc::new(ClipRelayError::Internal(format!(
                    "background task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared();

        Self { id, inner }
    }

    pub fn id(&self) -> FlightId {
        self.id
    }

    /// Wait for the operation to finish.
    pub async fn wait(self) -> Result<T> {
        self.inner.await.map_err(ClipRelayError::from)
    }
}

impl<T: Clone> fmt::Debug for Flight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flight").field("id", &self.id).finish()
    }
}

/// Holder for the at-most-one in-flight operation of a key.
pub struct FlightSlot<T: Clone> {
    current: Option<Flight<T>>,
}

impl<T> FlightSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Join the in-flight operation, or spawn `start(id)` as a new one.
    ///
    /// Returns the flight and whether this call started it. The future built
    /// by `start` must call [`FlightSlot::settle`] with `id` when it commits.
    pub fn join_or_start<F, Fut>(&mut self, start: F) -> (Flight<T>, bool)
    where
        F: FnOnce(FlightId) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(flight) = &self.current {
            return (flight.clone(), false);
        }

        let id = FlightId(NEXT_FLIGHT_ID.fetch_add(1, Ordering::Relaxed));
        let flight = Flight::spawn(id, start(id));
        self.current = Some(flight.clone());
        (flight, true)
    }

    /// Clear the slot if it still holds flight `id`.
    pub fn settle(&mut self, id: FlightId) -> bool {
        match &self.current {
            Some(flight) if flight.id == id => {
                self.current = None;
                true
            }
            _ => false,
        }
    }
}

impl<T> Default for FlightSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> fmt::Debug for FlightSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightSlot")
            .field("current", &self.current)
            .finish()
    }
}
