//! Dispatch of coordination store notifications to cluster listeners
//!
//! ```text
//!  CoordinationClient::subscribe()
//!            │
//!            ▼
//!   ┌──────────────────┐   path prefix + filter   ┌──────────┐
//!   │    dispatcher    │ ───────────────────────▶ │ worker A │ ─▶ listener A
//!   │ (session aware)  │ ───────────────────────▶ │ worker B │ ─▶ listener B
//!   └──────────────────┘                          └──────────┘
//! ```
//!
//! Each listener gets its own worker task and queue, so a slow handler only
//! delays its own notifications. When the session is re-established, or the
//! subscription lagged and notifications were lost, the dispatcher takes a
//! fresh subscription and asks every listener to resync from a fresh read.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::coordination::paths;
use crate::coordination::{CoordinationClient, SessionState, StoreNotification, WatchEvent};
use crate::error::Result;

/// Listener registered on the event bus
#[async_trait]
pub trait ClusterListener: Send + Sync {
    /// Listener name used in logs
    fn name(&self) -> &str;

    /// Only notifications at or below this path are delivered
    fn listen_path(&self) -> String;

    /// Additional filter over notifications inside the listen path
    fn accepts(&self, _event: &WatchEvent) -> bool {
        true
    }

    /// Handle one notification
    async fn on_event(&self, event: WatchEvent) -> Result<()>;

    /// Local view may be stale; re-derive state from a fresh read
    async fn on_resync(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum ListenerMessage {
    Event(WatchEvent),
    Resync,
}

struct Route {
    listener: Arc<dyn ClusterListener>,
    prefix: String,
    tx: mpsc::UnboundedSender<ListenerMessage>,
}

impl Route {
    fn deliver(&self, message: ListenerMessage) {
        if self.tx.send(message).is_err() {
            tracing::warn!(listener = %self.listener.name(), "Listener worker is gone");
        }
    }
}

/// Routes store notifications to registered listeners
pub struct ClusterEventBus {
    client: Arc<dyn CoordinationClient>,
    listeners: Vec<Arc<dyn ClusterListener>>,
}

/// Running bus; join it after signalling shutdown
pub struct EventBusHandle {
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl EventBusHandle {
    /// Wait for the dispatcher and every listener worker to finish
    pub async fn join(self) {
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "Event bus dispatcher panicked");
        }
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Listener worker panicked");
            }
        }
    }
}

impl ClusterEventBus {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            client,
            listeners: Vec::new(),
        }
    }

    /// Register a listener. Listeners must be registered before `start`.
    pub fn register(&mut self, listener: Arc<dyn ClusterListener>) {
        tracing::debug!(listener = %listener.name(), path = %listener.listen_path(), "Listener registered");
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Start dispatching. Every listener receives an initial resync so state
    /// created before the subscription is picked up.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> EventBusHandle {
        // Subscribe before the initial resync so nothing falls in between
        let subscription = self.client.subscribe();

        let mut routes = Vec::with_capacity(self.listeners.len());
        let mut workers = Vec::with_capacity(self.listeners.len());

        for listener in self.listeners {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(tokio::spawn(run_worker(Arc::clone(&listener), rx)));
            let route = Route {
                prefix: listener.listen_path(),
                listener,
                tx,
            };
            route.deliver(ListenerMessage::Resync);
            routes.push(route);
        }

        let dispatcher = tokio::spawn(run_dispatcher(self.client, routes, subscription, shutdown));
        EventBusHandle {
            dispatcher,
            workers,
        }
    }
}

async fn run_worker(
    listener: Arc<dyn ClusterListener>,
    mut rx: mpsc::UnboundedReceiver<ListenerMessage>,
) {
    while let Some(message) = rx.recv().await {
        let result = match message {
            ListenerMessage::Event(event) => {
                let path = event.path.clone();
                listener.on_event(event).await.map_err(|e| (path, e))
            }
            ListenerMessage::Resync => listener
                .on_resync()
                .await
                .map_err(|e| ("<resync>".to_string(), e)),
        };

        if let Err((path, e)) = result {
            tracing::warn!(listener = %listener.name(), path = %path, error = %e, "Listener failed");
        }
    }
    tracing::debug!(listener = %listener.name(), "Listener worker stopped");
}

async fn run_dispatcher(
    client: Arc<dyn CoordinationClient>,
    routes: Vec<Route>,
    mut subscription: broadcast::Receiver<StoreNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = subscription.recv() => match received {
                Ok(StoreNotification::Changed(event)) => {
                    for route in &routes {
                        if paths::is_under(&event.path, &route.prefix)
                            && route.listener.accepts(&event)
                        {
                            route.deliver(ListenerMessage::Event(event.clone()));
                        }
                    }
                }
                Ok(StoreNotification::Session(SessionState::Disconnected)) => {
                    tracing::warn!("Coordination session disconnected");
                }
                Ok(StoreNotification::Session(state)) => {
                    tracing::info!(?state, "Coordination session recovered, resubscribing");
                    subscription = client.subscribe();
                    for route in &routes {
                        route.deliver(ListenerMessage::Resync);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Notification stream lagged, resyncing listeners");
                    for route in &routes {
                        route.deliver(ListenerMessage::Resync);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::warn!("Notification stream closed");
                    break;
                }
            }
        }
    }
    tracing::debug!("Event bus dispatcher stopped");
}
