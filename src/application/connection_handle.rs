//! Connection Handle
//!
//! Wraps one edge connection. Streams are admitted lazily: a handle never has
//! more streams in flight than the transport's multiplexing limit, and a
//! saturated handle waits for a slot before accepting the next one.

use crate::domain::entities::HandleState;
use crate::domain::ports::{EdgeConnection, EdgeConnector, InboundStream, TransportError};
use crate::domain::value_objects::ConnIndex;
use crate::infrastructure::{DrainGuard, DrainTracker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Per-handle tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSettings {
    /// Consecutive errors after which the handle marks itself failed
    pub error_threshold: u32,
    /// How long a graceful close waits for in-flight streams
    pub drain_timeout: Duration,
    /// Local cap on concurrent streams, below the transport's own limit
    pub max_streams: Option<usize>,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            drain_timeout: Duration::from_secs(30),
            max_streams: None,
        }
    }
}

/// Point-in-time view of a handle, for readiness and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub index: ConnIndex,
    pub state: HandleState,
    pub in_flight: usize,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub age: Duration,
    pub idle: Duration,
}

/// One supervised edge connection.
pub struct ConnectionHandle {
    index: ConnIndex,
    settings: HandleSettings,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    state: AtomicU8,
    total_errors: AtomicU64,
    consecutive_errors: AtomicU32,
    connection: OnceLock<Box<dyn EdgeConnection>>,
    slots: OnceLock<Arc<Semaphore>>,
    drain: DrainTracker,
    /// Flipped once to stop admitting streams
    stop_tx: watch::Sender<bool>,
    /// Flipped once to cancel in-flight streams
    cancel_tx: watch::Sender<bool>,
    released: AtomicBool,
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state.
    pub fn new(index: ConnIndex, settings: HandleSettings) -> Self {
        let now = Instant::now();
        let (stop_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            index,
            settings,
            created_at: now,
            last_activity: Mutex::new(now),
            state: AtomicU8::new(HandleState::Connecting.as_u8()),
            total_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            connection: OnceLock::new(),
            slots: OnceLock::new(),
            drain: DrainTracker::new(),
            stop_tx,
            cancel_tx,
            released: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> ConnIndex {
        self.index
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn in_flight(&self) -> usize {
        self.drain.active()
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Stream slots granted by the transport (after the local cap).
    pub fn capacity(&self) -> Option<usize> {
        self.connection.get().map(|conn| {
            let limit = conn.max_concurrent_streams();
            self.settings
                .max_streams
                .map_or(limit, |cap| cap.min(limit))
                .max(1)
        })
    }

    /// Whether new streams are still admitted.
    pub fn is_accepting(&self) -> bool {
        self.state() == HandleState::Active && !*self.stop_tx.borrow()
    }

    pub fn snapshot(&self) -> HandleSnapshot {
        let now = Instant::now();
        HandleSnapshot {
            index: self.index,
            state: self.state(),
            in_flight: self.in_flight(),
            total_errors: self.total_errors(),
            consecutive_errors: self.consecutive_errors(),
            age: now.saturating_duration_since(self.created_at),
            idle: now.saturating_duration_since(self.last_activity()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn transition(&self, from: &[HandleState], to: HandleState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if !from.contains(&HandleState::from_u8(current)) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn stop_accepting(&self) {
        self.stop_tx.send_replace(true);
    }

    fn cancel_in_flight(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Run the transport handshake, bounded by `timeout`.
    ///
    /// Returns the time it took. On failure the handle is `Failed`.
    pub async fn establish(
        &self,
        connector: &dyn EdgeConnector,
        timeout: Duration,
    ) -> Result<Duration, TransportError> {
        if self.state() != HandleState::Connecting {
            return Err(TransportError::ConnectFailed(format!(
                "handle {} is {}",
                self.index,
                self.state()
            )));
        }

        let started = Instant::now();
        let stopped = wait_until_set(self.stop_tx.subscribe());

        let result = tokio::select! {
            res = tokio::time::timeout(timeout, connector.connect(self.index)) => match res {
                Ok(res) => res,
                Err(_) => Err(TransportError::ConnectTimeout),
            },
            _ = stopped => Err(TransportError::ConnectFailed("connect aborted".to_string())),
        };

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                self.fail(&e.to_string());
                return Err(e);
            }
        };

        let limit = conn.max_concurrent_streams();
        let capacity = self
            .settings
            .max_streams
            .map_or(limit, |cap| cap.min(limit))
            .max(1);

        if self.connection.set(conn).is_err() {
            return Err(TransportError::ConnectFailed(format!(
                "handle {} already established",
                self.index
            )));
        }
        let _ = self.slots.set(Arc::new(Semaphore::new(capacity)));

        if !self.transition(&[HandleState::Connecting], HandleState::Active) {
            // Stopped while the handshake finished
            return Err(TransportError::ConnectFailed("connect aborted".to_string()));
        }

        self.touch();
        let elapsed = started.elapsed();
        tracing::info!(
            index = %self.index,
            capacity,
            elapsed_ms = elapsed.as_millis() as u64,
            "edge connection established"
        );
        Ok(elapsed)
    }

    /// Wait for the next inbound stream.
    ///
    /// Returns `None` once the handle stops accepting, the edge closes the
    /// connection, or the transport fails. A saturated handle waits for a
    /// free slot before pulling from the transport.
    pub async fn accept_next_stream(&self) -> Option<AdmittedStream> {
        let conn = self.connection.get()?;
        let slots = self.slots.get()?.clone();

        loop {
            if !self.is_accepting() {
                return None;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => permit.ok()?,
                _ = wait_until_set(self.stop_tx.subscribe()) => return None,
            };

            let accepted = tokio::select! {
                res = conn.accept_stream() => res,
                _ = wait_until_set(self.stop_tx.subscribe()) => return None,
            };

            match accepted {
                Ok(Some(stream)) => {
                    self.touch();
                    return Some(AdmittedStream {
                        stream,
                        cancel: Cancellation {
                            rx: self.cancel_tx.subscribe(),
                        },
                        admission: Admission {
                            _permit: permit,
                            _drain: self.drain.guard(),
                        },
                    });
                }
                Ok(None) => {
                    tracing::info!(index = %self.index, "edge closed connection");
                    self.begin_drain();
                    return None;
                }
                Err(e) if e.is_fatal() => {
                    self.fail(&e.to_string());
                    return None;
                }
                Err(e) => {
                    self.report_error(&e);
                }
            }
        }
    }

    /// Count an error against this handle.
    ///
    /// Fatal errors and a full consecutive streak mark the handle failed.
    /// Returns the state after the error.
    pub fn report_error(&self, err: &TransportError) -> HandleState {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        let streak = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;

        tracing::warn!(
            index = %self.index,
            streak,
            threshold = self.settings.error_threshold,
            "edge connection error: {}",
            err
        );

        if err.is_fatal() {
            self.fail(&err.to_string());
        } else if streak >= self.settings.error_threshold {
            self.fail(&format!("{} consecutive errors", streak));
        }

        self.state()
    }

    /// Reset the consecutive error streak after a relayed stream.
    pub fn report_success(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.touch();
    }

    /// Stop admitting streams and let the in-flight ones finish.
    ///
    /// Returns `false` when the handle was not `Active`.
    pub fn begin_drain(&self) -> bool {
        let drained = self.transition(&[HandleState::Active], HandleState::Draining);
        self.stop_accepting();
        if drained {
            tracing::info!(
                index = %self.index,
                in_flight = self.in_flight(),
                "draining edge connection"
            );
        }
        drained
    }

    /// Mark the handle failed, stop accepting and cancel in-flight streams.
    pub fn fail(&self, reason: &str) {
        let failed = self.transition(
            &[HandleState::Connecting, HandleState::Active],
            HandleState::Failed,
        );
        self.stop_accepting();
        self.cancel_in_flight();
        if failed {
            tracing::warn!(index = %self.index, "edge connection failed: {}", reason);
        }
    }

    /// Close the handle and release the transport.
    ///
    /// A graceful close waits up to the drain timeout for in-flight streams
    /// and cancels whatever remains. A forced close cancels immediately.
    pub async fn close(&self, graceful: bool) {
        if graceful {
            self.transition(&[HandleState::Active], HandleState::Draining);
        }
        self.stop_accepting();

        let mut clean = graceful && self.state() != HandleState::Failed;
        if clean {
            clean = self.drain.wait_for_drain(self.settings.drain_timeout).await;
        }
        if !clean {
            self.cancel_in_flight();
            // Cancelled relays exit on their next poll
            self.drain.wait_for_drain(self.settings.drain_timeout).await;
        }

        if !self.released.swap(true, Ordering::SeqCst) {
            if let Some(conn) = self.connection.get() {
                conn.close(clean).await;
            }
        }

        self.transition(
            &[HandleState::Connecting, HandleState::Active, HandleState::Draining],
            HandleState::Closed,
        );

        tracing::info!(
            index = %self.index,
            state = %self.state(),
            clean,
            "edge connection closed"
        );
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Resolve once the flag behind `rx` is set.
///
/// Never resolves if the sender is gone without setting it.
async fn wait_until_set(mut rx: watch::Receiver<bool>) {
    loop {
        let set = *rx.borrow_and_update();
        if set {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Cancellation signal for one admitted stream.
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// Resolve when the owning handle cancels its streams.
    pub async fn cancelled(&mut self) {
        wait_until_set(self.rx.clone()).await
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Slot and drain accounting for one admitted stream. Released on drop.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    _drain: DrainGuard,
}

/// A stream that holds one of its handle's slots.
pub struct AdmittedStream {
    stream: InboundStream,
    cancel: Cancellation,
    admission: Admission,
}

impl AdmittedStream {
    pub fn stream(&self) -> &InboundStream {
        &self.stream
    }

    pub fn into_parts(self) -> (InboundStream, Cancellation, Admission) {
        (self.stream, self.cancel, self.admission)
    }
}
