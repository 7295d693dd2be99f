//! Notification dispatch engine.
//!
//! Turns the connection's single physical notification stream into
//! per-channel listener fan-out plus global "pipe" observers. One spawned
//! task runs the loop; callbacks are isolated from each other, and the
//! subscribed channels are released on every exit path.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::{HubError, HubResult};

/// A decoded notification payload.
///
/// Payloads are parsed as JSON when possible; anything else is delivered as
/// the raw text. Malformed payloads never surface an error to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
}

impl Payload {
    /// Parse raw payload text, falling back to the text itself.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(raw.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Json(_) => None,
        }
    }
}

type CallbackFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A per-channel notification callback.
pub type ListenerCallback = Arc<dyn Fn(Payload) -> CallbackFuture + Send + Sync>;

/// A global observer invoked for every channel with `(channel, payload)`.
pub type PipeCallback = Arc<dyn Fn(String, Payload) -> CallbackFuture + Send + Sync>;

/// Wrap an async closure as a [`ListenerCallback`].
pub fn listener<F, Fut>(callback: F) -> ListenerCallback
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(callback(payload)))
}

/// Wrap an async closure as a [`PipeCallback`].
pub fn pipe<F, Fut>(callback: F) -> PipeCallback
where
    F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |channel, payload| Box::pin(callback(channel, payload)))
}

/// The per-channel listener lists, the global pipe list, and any channels
/// subscribed without a listener of their own (observed through pipes only).
#[derive(Default, Clone)]
pub(crate) struct DispatchTable {
    listeners: HashMap<String, Vec<ListenerCallback>>,
    pipes: Vec<PipeCallback>,
    subscribed: BTreeSet<String>,
}

impl DispatchTable {
    fn add_listener(&mut self, channel: String, callback: ListenerCallback) {
        self.listeners.entry(channel).or_default().push(callback);
    }

    fn add_pipe(&mut self, callback: PipeCallback) {
        self.pipes.push(callback);
    }

    fn add_channel(&mut self, channel: String) {
        self.subscribed.insert(channel);
    }

    /// Every channel to subscribe: listener-bound and explicitly registered,
    /// sorted and deduplicated.
    fn channels(&self) -> Vec<String> {
        let mut channels: BTreeSet<String> = self.subscribed.clone();
        channels.extend(self.listeners.keys().cloned());
        channels.into_iter().collect()
    }

    /// Deliver one notification.
    ///
    /// Channel listeners run first in registration order, then every pipe.
    /// A failing callback is logged and skipped; it never blocks the
    /// remaining callbacks or subsequent events.
    pub(crate) async fn dispatch(&self, channel: &str, raw: &str) {
        tracing::info!(channel, "notification received");
        let payload = Payload::parse(raw);

        if let Some(callbacks) = self.listeners.get(channel) {
            for callback in callbacks {
                if let Err(error) = callback(payload.clone()).await {
                    tracing::warn!(channel, %error, "channel listener failed");
                }
            }
        }

        for pipe in &self.pipes {
            if let Err(error) = pipe(channel.to_string(), payload.clone()).await {
                tracing::warn!(channel, %error, "pipe listener failed");
            }
        }
    }
}

#[derive(Default)]
struct LoopHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Whether the loop task exists and has not yet run to completion.
    ///
    /// A task that exited on its own (the notification stream failed) leaves
    /// a stale handle behind; it must not block a later restart.
    fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Owns the subscribed-channel set and runs the notification loop.
#[derive(Default)]
pub struct Dispatcher {
    table: Mutex<DispatchTable>,
    running: AsyncMutex<LoopHandle>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_listener(&self, channel: String, callback: ListenerCallback) {
        self.table.lock().add_listener(channel, callback);
    }

    pub(crate) fn add_pipe(&self, callback: PipeCallback) {
        self.table.lock().add_pipe(callback);
    }

    /// Mark a channel for subscription even without a listener of its own.
    pub(crate) fn add_channel(&self, channel: String) {
        self.table.lock().add_channel(channel);
    }

    /// Channel names to subscribe, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.table.lock().channels()
    }

    /// Subscribe every bound channel and spawn the dispatch loop.
    ///
    /// The listener gets its own connection from `pool`. If any `LISTEN`
    /// fails, the channels subscribed so far are released before the error
    /// surfaces. The dispatch table is snapshotted here: listeners added
    /// after `start` are picked up on the next start. A loop that died with
    /// its notification stream is restarted, not treated as running.
    pub(crate) async fn start(&self, pool: &PgPool) -> HubResult<()> {
        let mut running = self.running.lock().await;
        if running.is_live() {
            return Ok(());
        }
        running.shutdown = None;
        running.task = None;

        let table = self.table.lock().clone();
        let channels = table.channels();
        if channels.is_empty() {
            tracing::debug!("no channels bound, notification loop not started");
            return Ok(());
        }

        let mut listener = PgListener::connect_with(pool).await?;
        for channel in &channels {
            if let Err(source) = listener.listen(channel).await {
                if let Err(error) = listener.unlisten_all().await {
                    tracing::warn!(%error, "failed to unsubscribe after partial setup");
                }
                return Err(HubError::Subscribe {
                    channel: channel.clone(),
                    source,
                });
            }
        }
        tracing::info!(channels = channels.len(), "listening for notifications");

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    notification = listener.recv() => match notification {
                        Ok(event) => table.dispatch(event.channel(), event.payload()).await,
                        Err(error) => {
                            tracing::warn!(%error, "notification stream closed");
                            break;
                        }
                    },
                }
            }
            // Guaranteed teardown, whatever ended the loop.
            if let Err(error) = listener.unlisten_all().await {
                tracing::warn!(%error, "failed to unsubscribe channels");
            }
        });

        running.shutdown = Some(shutdown);
        running.task = Some(task);
        Ok(())
    }

    /// Cancel the loop's wait and release every subscription.
    ///
    /// A notification received but not yet dispatched when the loop is
    /// cancelled is dropped: delivery is at-most-once.
    pub(crate) async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(shutdown) = running.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = running.task.take() {
            if let Err(error) = task.await {
                tracing::warn!(%error, "notification task ended abnormally");
            }
        }
    }
}
