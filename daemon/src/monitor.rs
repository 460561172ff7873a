/// The state-diffing monitor.
///
/// A [`Monitor`] owns the current [`Snapshot`] and a table of live
/// [`Subscription`]s. A single background poll task is the only writer of the
/// snapshot: every cycle it samples the [`StatusSource`], diffs the result
/// against the previous sample, swaps the shared `Arc<Snapshot>` and then
/// delivers the cycle's [`ChangeEvent`]s to every subscription.
///
/// Lifecycle: `Ready → Polling → Stopped`. A `Monitor` only exists once the
/// first sample succeeded, so readers always see a valid snapshot.
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::Principal;
use crate::client::Snapshot;
use crate::diff::diff;
use crate::error::{DeliveryError, MonitorError};
use crate::event::ChangeEvent;
use crate::sink::{render_event, EventSink};
use crate::source::StatusSource;
use crate::transport::ChatId;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Wait between successful samples.
    pub poll_interval: Duration,
    /// Wait after a failed sample. Always longer than `poll_interval`.
    pub retry_backoff: Duration,
    /// Keep polling while nobody is subscribed, so stats dumps stay fresh.
    pub idle_polling: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            idle_polling: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Initialized, no poll task running.
    Ready,
    /// The poll task is running.
    Polling,
    /// Shut down; no further subscriptions are accepted.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created,
    /// The principal already had a live subscription; it was kept as is.
    AlreadySubscribed,
}

/// The most recent failed sample, cleared by the next success.
#[derive(Debug, Clone)]
pub struct SampleFailure {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// One principal's registration for change events.
#[derive(Debug, Clone)]
pub struct Subscription {
    principal: Principal,
    chat: ChatId,
    cancelled: watch::Receiver<bool>,
}

impl Subscription {
    /// Creates a subscription and the handle that cancels it.
    pub fn new(principal: Principal, chat: ChatId) -> (Self, watch::Sender<bool>) {
        let (cancel_tx, cancelled) = watch::channel(false);
        (
            Self {
                principal,
                chat,
                cancelled,
            },
            cancel_tx,
        )
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn chat(&self) -> ChatId {
        self.chat
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

struct SubscriptionEntry {
    subscription: Subscription,
    cancel: watch::Sender<bool>,
}

/// A running poll task.
struct Poller {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Waits for the task to exit. Call [`Poller::signal`] first, while the
    /// registry lock is still held.
    async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("Poll task ended abnormally: {e}");
        }
    }

    fn signal(&self) {
        self.stop_tx.send_replace(true);
    }
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<Principal, SubscriptionEntry>,
    poller: Option<Poller>,
    stopped: bool,
}

struct Shared {
    source: Arc<dyn StatusSource>,
    sink: EventSink,
    config: MonitorConfig,
    current: RwLock<Arc<Snapshot>>,
    last_failure: RwLock<Option<SampleFailure>>,
    registry: Mutex<Registry>,
}

enum Cycle {
    Completed,
    Failed,
    Cancelled,
}

/// Handle to a monitor. Cloning is cheap; all clones share one state.
#[derive(Clone)]
pub struct Monitor {
    shared: Arc<Shared>,
}

impl Monitor {
    /// Takes the first sample and returns a ready monitor.
    ///
    /// Fails with [`MonitorError::InitializationFailed`] if that sample fails;
    /// there is no retry at this stage.
    pub async fn start(
        source: Arc<dyn StatusSource>,
        sink: EventSink,
        config: MonitorConfig,
    ) -> Result<Self, MonitorError> {
        let first = source
            .sample()
            .await
            .map_err(MonitorError::InitializationFailed)?;
        info!(
            source = source.location(),
            clients = first.len(),
            "Monitor initialized"
        );

        let monitor = Self {
            shared: Arc::new(Shared {
                source,
                sink,
                config,
                current: RwLock::new(Arc::new(first)),
                last_failure: RwLock::new(None),
                registry: Mutex::new(Registry::default()),
            }),
        };

        if monitor.shared.config.idle_polling {
            let mut registry = monitor.shared.registry.lock();
            monitor.ensure_polling(&mut registry);
        }
        Ok(monitor)
    }

    /// The last successfully sampled snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.shared.current.read())
    }

    pub fn last_failure(&self) -> Option<SampleFailure> {
        self.shared.last_failure.read().clone()
    }

    pub fn state(&self) -> MonitorState {
        let registry = self.shared.registry.lock();
        if registry.stopped {
            MonitorState::Stopped
        } else if registry.poller.is_some() {
            MonitorState::Polling
        } else {
            MonitorState::Ready
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry.lock().subscriptions.len()
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, principal: &Principal) -> bool {
        self.shared.registry.lock().subscriptions.contains_key(principal)
    }

    /// Registers `principal` for change events delivered to `chat`.
    ///
    /// A principal holds at most one subscription: repeating the call keeps
    /// the existing one and reports [`SubscribeOutcome::AlreadySubscribed`].
    pub fn subscribe(
        &self,
        principal: Principal,
        chat: ChatId,
    ) -> Result<SubscribeOutcome, MonitorError> {
        let mut registry = self.shared.registry.lock();
        if registry.stopped {
            return Err(MonitorError::Stopped);
        }
        if registry.subscriptions.contains_key(&principal) {
            debug!(%principal, "Subscription already active");
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let (subscription, cancel) = Subscription::new(principal.clone(), chat);
        registry.subscriptions.insert(
            principal.clone(),
            SubscriptionEntry {
                subscription,
                cancel,
            },
        );
        info!(%principal, %chat, "Subscription started");

        self.ensure_polling(&mut registry);
        Ok(SubscribeOutcome::Created)
    }

    /// Withdraws `principal`'s subscription. Returns `false` if there was none.
    ///
    /// Delivery to the subscription stops immediately, even mid-cycle. Without
    /// idle polling, removing the last subscription also stops the poll task.
    pub async fn unsubscribe(&self, principal: &Principal) -> bool {
        let idle_poller = {
            let mut registry = self.shared.registry.lock();
            let Some(entry) = registry.subscriptions.remove(principal) else {
                return false;
            };
            entry.cancel.send_replace(true);
            info!(%principal, "Subscription stopped");

            if registry.subscriptions.is_empty() && !self.shared.config.idle_polling {
                let poller = registry.poller.take();
                if let Some(p) = &poller {
                    p.signal();
                }
                poller
            } else {
                None
            }
        };

        if let Some(poller) = idle_poller {
            info!("No subscribers left; pausing the poll loop");
            poller.join().await;
        }
        true
    }

    /// Cancels every subscription and stops the poll task.
    pub async fn shutdown(&self) {
        let poller = {
            let mut registry = self.shared.registry.lock();
            registry.stopped = true;
            for (_, entry) in registry.subscriptions.drain() {
                entry.cancel.send_replace(true);
            }
            let poller = registry.poller.take();
            if let Some(p) = &poller {
                p.signal();
            }
            poller
        };

        if let Some(poller) = poller {
            poller.join().await;
        }
        info!("Monitor stopped");
    }

    fn ensure_polling(&self, registry: &mut Registry) {
        if registry.poller.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let baseline = self.snapshot();
        let handle = tokio::spawn(poll_loop(Arc::downgrade(&self.shared), baseline, stop_rx));
        registry.poller = Some(Poller { stop_tx, handle });
    }
}

/// Background poll loop. Holds only a weak reference while sleeping so that
/// dropping every [`Monitor`] handle also ends the task.
async fn poll_loop(
    shared: Weak<Shared>,
    mut previous: Arc<Snapshot>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let Some((poll_interval, retry_backoff)) = shared
        .upgrade()
        .map(|s| (s.config.poll_interval, s.config.retry_backoff))
    else {
        return;
    };
    info!(?poll_interval, ?retry_backoff, "Poll loop started");

    let mut wait = poll_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop_rx.changed() => break,
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        wait = match shared.poll_once(&mut previous, &stop_rx).await {
            Cycle::Completed => poll_interval,
            Cycle::Failed => retry_backoff,
            Cycle::Cancelled => break,
        };
    }

    debug!("Poll loop exited");
}

impl Shared {
    async fn poll_once(
        &self,
        previous: &mut Arc<Snapshot>,
        stop_rx: &watch::Receiver<bool>,
    ) -> Cycle {
        let current = match self.source.sample().await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!(
                    source = self.source.location(),
                    "Sample failed, keeping last good snapshot: {e}"
                );
                *self.last_failure.write() = Some(SampleFailure {
                    at: Utc::now(),
                    reason: e.to_string(),
                });
                return Cycle::Failed;
            }
        };

        let changes = diff(previous, &current);
        if !changes.is_empty() {
            debug!(
                connected = changes.connected.len(),
                disconnected = changes.disconnected.len(),
                clients = current.len(),
                "Status changed"
            );
        }

        // Checked and swapped under the registry lock: a replacement poller
        // spawned after the stop signal must start from this snapshot.
        let subscriptions: Vec<Subscription> = {
            let registry = self.registry.lock();
            if *stop_rx.borrow() {
                return Cycle::Cancelled;
            }
            *self.current.write() = Arc::clone(&current);
            registry
                .subscriptions
                .values()
                .map(|entry| entry.subscription.clone())
                .collect()
        };
        *self.last_failure.write() = None;

        let events = changes.into_events(previous);
        *previous = current;

        self.publish(&events, &subscriptions).await;
        Cycle::Completed
    }

    async fn publish(&self, events: &[ChangeEvent], subscriptions: &[Subscription]) {
        for event in events {
            info!(identity = %event.client().identity, "{}", render_event(event));
            for subscription in subscriptions {
                match self.sink.publish(event, subscription).await {
                    Ok(_) => {}
                    Err(DeliveryError::Cancelled) => {
                        debug!(principal = %subscription.principal(), "Skipping cancelled subscription");
                    }
                    Err(e) => warn!(
                        principal = %subscription.principal(),
                        chat = %subscription.chat(),
                        "Dropping notification: {e}"
                    ),
                }
            }
        }
    }
}
