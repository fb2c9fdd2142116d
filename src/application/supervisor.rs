//! Connection Supervisor
//!
//! Owns the pool of edge connections. On every tick it reads the concurrency
//! gauges, moves the target connection count within its bounds, and opens or
//! drains handles to match. Connect failures and lost handles are retried
//! with exponential backoff; nothing here is fatal.

use super::connection_handle::{ConnectionHandle, HandleSettings};
use super::connection_pool::ConnectionPool;
use super::dispatcher::StreamDispatcher;
use crate::domain::entities::{HandleState, StreamKind};
use crate::domain::ports::{EdgeConnector, TransportError};
use crate::domain::services::{pick_drain_candidate, Autoscaler, ScalingDecision, ScalingPolicy};
use crate::domain::value_objects::ConnIndex;
use crate::infrastructure::{Backoff, BackoffConfig, ShutdownController, TunnelMetrics};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub policy: ScalingPolicy,
    pub tick_interval: Duration,
    /// Bound on one edge connect attempt
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    pub handle: HandleSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            policy: ScalingPolicy::default(),
            tick_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
            handle: HandleSettings::default(),
        }
    }
}

/// Lifecycle events sent from handle tasks back to the supervisor loop.
#[derive(Debug)]
pub enum HandleEvent {
    /// Handshake finished
    Connected { index: ConnIndex, latency: Duration },
    /// Handshake failed or timed out
    ConnectFailed {
        index: ConnIndex,
        error: TransportError,
    },
    /// Accept loop ended and the handle is closed
    Exited { index: ConnIndex, state: HandleState },
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn EdgeConnector>,
    dispatcher: Arc<StreamDispatcher>,
    metrics: Arc<TunnelMetrics>,
    pool: Arc<ConnectionPool>,
    settings: SupervisorSettings,
    shutdown: ShutdownController,
    autoscaler: Autoscaler,
    backoff: Backoff,
    target: usize,
    retry_at: Option<Instant>,
    /// Handles drained on purpose; their exit is not a loss
    retiring: HashSet<ConnIndex>,
    tasks: JoinSet<()>,
    event_tx: mpsc::UnboundedSender<HandleEvent>,
    event_rx: mpsc::UnboundedReceiver<HandleEvent>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn EdgeConnector>,
        dispatcher: Arc<StreamDispatcher>,
        metrics: Arc<TunnelMetrics>,
        pool: Arc<ConnectionPool>,
        settings: SupervisorSettings,
        shutdown: ShutdownController,
    ) -> Self {
        let autoscaler = Autoscaler::new(settings.policy.clone());
        let target = autoscaler.clamp(settings.policy.min_connections);
        let backoff = Backoff::new(settings.backoff.clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            connector,
            dispatcher,
            metrics,
            pool,
            settings,
            shutdown,
            autoscaler,
            backoff,
            target,
            retry_at: None,
            retiring: HashSet::new(),
            tasks: JoinSet::new(),
            event_tx,
            event_rx,
        }
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    /// Current target connection count.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Run until shutdown, then drain every handle.
    pub async fn run(mut self) {
        let policy = self.autoscaler.policy();
        tracing::info!(
            min = policy.min_connections,
            max = policy.max_connections,
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            backoff_base_ms = self.backoff.config().base.as_millis() as u64,
            backoff_max_ms = self.backoff.config().max.as_millis() as u64,
            "connection supervisor started"
        );

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        self.reconcile();

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.tick();
                    self.reconcile();
                }
                Some(event) = self.event_rx.recv() => {
                    self.on_event(event);
                    self.reconcile();
                }
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.reconcile();
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = res {
                        tracing::error!("edge connection task aborted: {}", e);
                    }
                }
            }
        }

        self.drain_all().await;
    }

    /// One scaling evaluation.
    fn tick(&mut self) {
        // Handles still handshaking would skew the average
        if self.pool.connecting_count() > 0 || self.retry_at.is_some() {
            return;
        }

        let load = self.metrics.read_approximate_concurrency(StreamKind::Http)
            + self.metrics.read_approximate_concurrency(StreamKind::WebSocket);
        let active = self.pool.active_count();

        match self.autoscaler.evaluate(load, active) {
            ScalingDecision::ScaleUp => {
                let next = self.autoscaler.clamp(self.target + 1);
                if next != self.target && self.pool.live_count() >= self.target {
                    tracing::info!(load, active, from = self.target, to = next, "scaling up");
                    self.target = next;
                }
            }
            ScalingDecision::ScaleDown => {
                let next = self.autoscaler.clamp(self.target.saturating_sub(1));
                if next != self.target {
                    tracing::info!(load, active, from = self.target, to = next, "scaling down");
                    self.target = next;
                }
            }
            ScalingDecision::Hold => {}
        }

        tracing::debug!(
            load,
            active,
            target = self.target,
            handles = ?self.pool.snapshot(),
            "supervisor tick"
        );
    }

    fn on_event(&mut self, event: HandleEvent) {
        match event {
            HandleEvent::Connected { index, latency } => {
                self.metrics.record_connect_latency(latency);
                self.backoff.reset();
                tracing::debug!(index = %index, "backoff reset");
            }
            HandleEvent::ConnectFailed { index, error } => {
                self.metrics.record_connect_failure();
                self.pool.remove(index);
                let delay = self.schedule_retry();
                tracing::warn!(
                    index = %index,
                    attempt = self.backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "edge connect failed: {}",
                    error
                );
            }
            HandleEvent::Exited { index, state } => {
                self.pool.remove(index);
                let retired = self.retiring.remove(&index);
                if retired || self.shutdown.is_shutdown() {
                    return;
                }
                // A replacement may already be live if the handle drained slowly
                if self.pool.live_count() >= self.target {
                    tracing::info!(index = %index, %state, "edge connection lost, already replaced");
                    return;
                }
                let delay = self.schedule_retry();
                tracing::warn!(
                    index = %index,
                    %state,
                    retry_in_ms = delay.as_millis() as u64,
                    "edge connection lost, replacing"
                );
            }
        }
    }

    fn schedule_retry(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        delay
    }

    /// Open or drain handles until the live count matches the target.
    ///
    /// At most one handshake runs at a time.
    fn reconcile(&mut self) {
        if self.shutdown.is_shutdown() {
            return;
        }

        let live = self.pool.live_count();

        if live > self.target {
            let candidates = self.pool.drain_candidates();
            if let Some(index) = pick_drain_candidate(&candidates) {
                if let Some(handle) = self.pool.get(index) {
                    if handle.begin_drain() {
                        self.retiring.insert(index);
                    }
                }
            }
            return;
        }

        if live < self.target && self.retry_at.is_none() && self.pool.connecting_count() == 0 {
            self.spawn_handle();
        }
    }

    fn spawn_handle(&mut self) {
        let Some(index) = self.pool.free_index() else {
            tracing::error!("no free connection index");
            return;
        };

        let handle = Arc::new(ConnectionHandle::new(index, self.settings.handle.clone()));
        self.pool.insert(handle.clone());
        tracing::debug!(index = %index, "connecting to edge");

        self.tasks.spawn(run_handle(
            handle,
            self.connector.clone(),
            self.dispatcher.clone(),
            self.settings.connect_timeout,
            self.event_tx.clone(),
        ));
    }

    async fn drain_all(&mut self) {
        tracing::info!(handles = self.pool.len(), "draining edge connections");

        for handle in self.pool.handles() {
            if handle.state() == HandleState::Connecting {
                handle.fail("shutting down");
            } else {
                handle.begin_drain();
            }
        }

        let bound = self.settings.handle.drain_timeout * 2 + self.settings.connect_timeout;
        let drained = tokio::time::timeout(bound, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("edge connections did not drain in time, aborting");
            self.tasks.abort_all();
        }

        while let Ok(event) = self.event_rx.try_recv() {
            if let HandleEvent::Exited { index, .. } | HandleEvent::ConnectFailed { index, .. } = event {
                self.pool.remove(index);
            }
        }
        tracing::info!("connection supervisor stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Lifecycle of one handle: handshake, accept loop, close.
async fn run_handle(
    handle: Arc<ConnectionHandle>,
    connector: Arc<dyn EdgeConnector>,
    dispatcher: Arc<StreamDispatcher>,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<HandleEvent>,
) {
    let index = handle.index();

    match handle.establish(connector.as_ref(), connect_timeout).await {
        Ok(latency) => {
            let _ = events.send(HandleEvent::Connected { index, latency });
        }
        Err(error) => {
            handle.close(false).await;
            let _ = events.send(HandleEvent::ConnectFailed { index, error });
            return;
        }
    }

    while let Some(admitted) = handle.accept_next_stream().await {
        let dispatcher = dispatcher.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&handle, admitted).await;
        });
    }

    let graceful = handle.state() != HandleState::Failed;
    handle.close(graceful).await;

    let _ = events.send(HandleEvent::Exited {
        index,
        state: handle.state(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_until_none_never_fires() {
        let res = tokio::time::timeout(Duration::from_millis(20), sleep_until_opt(None)).await;
        assert!(res.is_err());
    }

    #[test]
    fn test_default_settings() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.policy.min_connections, 1);
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
        assert!(settings.backoff.base <= settings.backoff.max);
    }
}
