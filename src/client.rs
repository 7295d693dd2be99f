//! Client composition root.
//!
//! Owns the connection gateway, the query registry, and the notification
//! dispatcher, and drives the fixed start-up and shut-down orders:
//! connect → prepare all → subscribe, and unsubscribe → deallocate → close.

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex as AsyncMutex;

use crate::dispatch::{
    listener as wrap_listener, pipe as wrap_pipe, Dispatcher, Payload, PipeCallback,
};
use crate::error::HubResult;
use crate::gateway::{ConnectParams, Gateway};
use crate::registry::QueryRegistry;
use crate::router::SqlRouter;
use crate::shape::QueryOutput;
use crate::statement::PreparedQuery;
use crate::value::Args;

pub(crate) struct ClientCore {
    pub(crate) gateway: Gateway,
    pub(crate) registry: QueryRegistry,
    pub(crate) dispatcher: Dispatcher,
    notify_pool: AsyncMutex<Option<PgPool>>,
}

impl ClientCore {
    pub(crate) async fn query(&self, name: &str, args: &Args) -> HubResult<QueryOutput> {
        let query = self.registry.lookup(name)?;
        query.execute(&self.gateway, args).await
    }
}

/// A database client: queries by name, notifications by channel.
///
/// Cheap to clone; clones share the same connection, registry, and
/// dispatcher.
///
/// # Example
///
/// ```rust,ignore
/// use sqlhub::prelude::*;
///
/// let client = SqlClient::new(ConnectParams::new("localhost", 5432, "app", "secret", "appdb"));
/// client.register_query("user_count", "SELECT count(*) FROM users WHERE org = {org}")?;
/// client.on_channel("orders", |payload| async move {
///     println!("order event: {payload:?}");
///     Ok(())
/// });
///
/// client.start().await?;
/// let count = client.query("user_count", &Args::new().set("org", 7)).await?;
/// client.stop().await?;
/// ```
#[derive(Clone)]
pub struct SqlClient {
    core: Arc<ClientCore>,
}

impl SqlClient {
    /// Build an unconnected client from connection parameters.
    pub fn new(params: ConnectParams) -> Self {
        Self {
            core: Arc::new(ClientCore {
                gateway: Gateway::new(params),
                registry: QueryRegistry::new(),
                dispatcher: Dispatcher::new(),
                notify_pool: AsyncMutex::new(None),
            }),
        }
    }

    /// Register a named query template.
    pub fn register_query(&self, name: impl Into<String>, raw: &str) -> HubResult<()> {
        self.core.registry.register(name, raw)
    }

    /// Register a batch of `(name, text)` pairs.
    pub fn register_queries<I, N, Q>(&self, pairs: I) -> HubResult<()>
    where
        I: IntoIterator<Item = (N, Q)>,
        N: Into<String>,
        Q: AsRef<str>,
    {
        self.core.registry.register_all(pairs)
    }

    /// Bind a callback to a notification channel.
    pub fn on_channel<F, Fut>(&self, channel: impl Into<String>, callback: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.core
            .dispatcher
            .add_listener(channel.into(), wrap_listener(callback));
    }

    /// Add a pipe observer, invoked with `(channel, payload)` for every
    /// event on every subscribed channel.
    pub fn pipe<F, Fut>(&self, callback: F)
    where
        F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.core.dispatcher.add_pipe(wrap_pipe(callback));
    }

    /// Add several pre-wrapped pipe observers (see [`crate::dispatch::pipe`]).
    pub fn pipes(&self, pipes: impl IntoIterator<Item = PipeCallback>) {
        for callback in pipes {
            self.core.dispatcher.add_pipe(callback);
        }
    }

    /// Subscribe a channel at `start` even without a listener of its own.
    ///
    /// Events on such a channel reach the pipes only.
    pub fn register_channel(&self, channel: impl Into<String>) {
        self.core.dispatcher.add_channel(channel.into());
    }

    /// Register several listener-less channels.
    pub fn register_channels<I, C>(&self, channels: I)
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        for channel in channels {
            self.register_channel(channel);
        }
    }

    /// Attach a router, folding its queries and listener bindings in.
    pub fn include_router(&self, router: &SqlRouter) -> HubResult<()> {
        router.attach(&self.core)
    }

    /// Attach several routers in order.
    pub fn include_routers<'a>(
        &self,
        routers: impl IntoIterator<Item = &'a SqlRouter>,
    ) -> HubResult<()> {
        for router in routers {
            self.include_router(router)?;
        }
        Ok(())
    }

    /// Look up a registered query by name.
    pub fn lookup(&self, name: &str) -> HubResult<Arc<PreparedQuery>> {
        self.core.registry.lookup(name)
    }

    /// Execute a registered query by name with named arguments.
    pub async fn query(&self, name: &str, args: &Args) -> HubResult<QueryOutput> {
        self.core.query(name, args).await
    }

    /// Channel names to subscribe at `start`, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.core.dispatcher.channels()
    }

    /// Connect, prepare every registered query, then subscribe and start
    /// the notification loop, in that order.
    ///
    /// If any step fails, everything that already succeeded is torn down
    /// (statements deallocated, connection closed) before the error
    /// surfaces.
    pub async fn start(&self) -> HubResult<()> {
        let core = &self.core;
        core.gateway.connect().await?;

        if let Err(error) = core.registry.prepare_all(&core.gateway).await {
            self.teardown_after_failed_start().await;
            return Err(error);
        }

        let pool = core.gateway.notify_pool();
        if let Err(error) = core.dispatcher.start(&pool).await {
            pool.close().await;
            self.teardown_after_failed_start().await;
            return Err(error);
        }
        *core.notify_pool.lock().await = Some(pool);

        tracing::info!("client started");
        Ok(())
    }

    async fn teardown_after_failed_start(&self) {
        let core = &self.core;
        if let Err(error) = core.registry.deallocate_all(&core.gateway).await {
            tracing::warn!(%error, "cleanup after failed start: deallocate failed");
        }
        if let Err(error) = core.gateway.close().await {
            tracing::warn!(%error, "cleanup after failed start: close failed");
        }
    }

    /// Unsubscribe every channel, deallocate every statement, and close
    /// the connection, in that order.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// reported.
    pub async fn stop(&self) -> HubResult<()> {
        let core = &self.core;
        core.dispatcher.stop().await;

        let mut result = Ok(());
        if let Err(error) = core.registry.deallocate_all(&core.gateway).await {
            result = Err(error);
        }
        if let Some(pool) = core.notify_pool.lock().await.take() {
            pool.close().await;
        }
        if let Err(error) = core.gateway.close().await {
            if result.is_ok() {
                result = Err(error);
            }
        }

        tracing::info!("client stopped");
        result
    }
}
