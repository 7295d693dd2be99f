//! Composable query and listener namespaces.
//!
//! Routers group query registrations and channel-listener bindings so that
//! application modules can declare their needs independently, then be merged
//! into one client. Inclusion is a snapshot: a child's bindings as of
//! `include_router` are folded upward. Listeners added to the child
//! afterwards are not seen by the parent, and query registration on an
//! included router is rejected outright. Query lookup, by contrast, is
//! live: each call walks the parent chain up to the bound client.

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::ClientCore;
use crate::dispatch::{listener, ListenerCallback, Payload};
use crate::error::{HubError, HubResult};
use crate::shape::QueryOutput;
use crate::statement::PreparedQuery;
use crate::value::Args;

#[derive(Default)]
struct RouterNode {
    parent: Option<Weak<Mutex<RouterNode>>>,
    client: Option<Weak<ClientCore>>,
    queries: Vec<(String, String)>,
    listeners: Vec<(String, ListenerCallback)>,
}

impl RouterNode {
    fn is_bound(&self) -> bool {
        self.parent.is_some() || self.client.is_some()
    }
}

/// A composable namespace for queries and channel listeners.
///
/// Cheap to clone; clones share the same node.
#[derive(Clone, Default)]
pub struct SqlRouter {
    inner: Arc<Mutex<RouterNode>>,
}

impl SqlRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a query registration on this router.
    ///
    /// Name collisions within this router fail here; collisions with other
    /// routers or the client surface when the tree is attached. Once the
    /// router has been included or attached its snapshot is already folded
    /// upward, so a late registration would be unreachable; it is rejected
    /// with [`HubError::AlreadyBound`] instead of being lost.
    pub fn register_query(
        &self,
        name: impl Into<String>,
        raw: impl Into<String>,
    ) -> HubResult<()> {
        let name = name.into();
        let mut node = self.inner.lock();
        if node.is_bound() {
            return Err(HubError::AlreadyBound);
        }
        if node.queries.iter().any(|(existing, _)| *existing == name) {
            return Err(HubError::DuplicateQuery(name));
        }
        node.queries.push((name, raw.into()));
        Ok(())
    }

    /// Bind a callback to a notification channel.
    pub fn on_channel<F, Fut>(&self, channel: impl Into<String>, callback: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .lock()
            .listeners
            .push((channel.into(), listener(callback)));
    }

    /// Merge a child router's bindings into this one (snapshot semantics).
    ///
    /// The child must still be unbound; including a router twice, or a
    /// router that is already attached to a client, fails with
    /// [`HubError::AlreadyBound`].
    pub fn include_router(&self, child: &SqlRouter) -> HubResult<()> {
        if Arc::ptr_eq(&self.inner, &child.inner) {
            return Err(HubError::AlreadyBound);
        }

        let (queries, listeners) = {
            let child_node = child.inner.lock();
            if child_node.is_bound() {
                return Err(HubError::AlreadyBound);
            }
            (child_node.queries.clone(), child_node.listeners.clone())
        };

        {
            let mut node = self.inner.lock();
            for (name, _) in &queries {
                if node.queries.iter().any(|(existing, _)| existing == name) {
                    return Err(HubError::DuplicateQuery(name.clone()));
                }
            }
            node.queries.extend(queries);
            node.listeners.extend(listeners);
        }

        child.inner.lock().parent = Some(Arc::downgrade(&self.inner));
        Ok(())
    }

    /// Merge several routers in order.
    pub fn include_routers<'a>(
        &self,
        routers: impl IntoIterator<Item = &'a SqlRouter>,
    ) -> HubResult<()> {
        for router in routers {
            self.include_router(router)?;
        }
        Ok(())
    }

    /// Bind this router (and everything merged into it) to a client.
    pub(crate) fn attach(&self, client: &Arc<ClientCore>) -> HubResult<()> {
        let mut node = self.inner.lock();
        if node.is_bound() {
            return Err(HubError::AlreadyBound);
        }

        for (name, raw) in &node.queries {
            client.registry.register(name.clone(), raw)?;
        }
        for (channel, callback) in &node.listeners {
            client
                .dispatcher
                .add_listener(channel.clone(), callback.clone());
        }

        node.client = Some(Arc::downgrade(client));
        Ok(())
    }

    /// Walk the parent chain to the bound client.
    fn resolve_client(&self) -> HubResult<Arc<ClientCore>> {
        let mut node = Arc::clone(&self.inner);
        loop {
            let next = {
                let guard = node.lock();
                if let Some(client) = &guard.client {
                    return client.upgrade().ok_or(HubError::UnboundRouter);
                }
                match &guard.parent {
                    Some(parent) => parent.upgrade().ok_or(HubError::UnboundRouter)?,
                    None => return Err(HubError::UnboundRouter),
                }
            };
            node = next;
        }
    }

    /// Look up a query by name through the chain to the bound client.
    pub fn lookup(&self, name: &str) -> HubResult<Arc<PreparedQuery>> {
        self.resolve_client()?.registry.lookup(name)
    }

    /// Execute a query by name through the chain to the bound client.
    pub async fn query(&self, name: &str, args: &Args) -> HubResult<QueryOutput> {
        let client = self.resolve_client()?;
        client.query(name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SqlClient;
    use crate::gateway::ConnectParams;

    fn offline_client() -> SqlClient {
        SqlClient::new(ConnectParams::new("localhost", 5432, "u", "p", "db"))
    }

    #[test]
    fn test_attached_router_resolves_client_queries() {
        let client = offline_client();
        client
            .register_query("root_count", "SELECT count(*) FROM t")
            .unwrap();

        let router = SqlRouter::new();
        client.include_router(&router).unwrap();

        // A name only the client's root registry holds still resolves.
        let query = router.lookup("root_count").unwrap();
        assert_eq!(query.name(), "root_count");
    }

    #[test]
    fn test_unbound_chain_fails_lookup() {
        let parent = SqlRouter::new();
        let child = SqlRouter::new();
        parent.include_router(&child).unwrap();

        assert!(matches!(
            child.lookup("anything"),
            Err(HubError::UnboundRouter)
        ));
    }

    #[test]
    fn test_nested_router_resolves_through_chain() {
        let client = offline_client();
        let parent = SqlRouter::new();
        let child = SqlRouter::new();
        child
            .register_query("child_q", "SELECT {x}")
            .unwrap();
        parent.include_router(&child).unwrap();
        client.include_router(&parent).unwrap();

        // The child's registration folded upward into the client registry,
        // and the child resolves it live through its parent chain.
        let query = child.lookup("child_q").unwrap();
        assert_eq!(query.sql(), "SELECT $1");
        assert_eq!(client.lookup("child_q").unwrap().name(), "child_q");
    }

    #[test]
    fn test_rebinding_fails() {
        let client = offline_client();
        let router = SqlRouter::new();
        client.include_router(&router).unwrap();
        assert!(matches!(
            client.include_router(&router),
            Err(HubError::AlreadyBound)
        ));

        let parent = SqlRouter::new();
        assert!(matches!(
            parent.include_router(&router),
            Err(HubError::AlreadyBound)
        ));
        assert!(matches!(
            parent.include_router(&parent),
            Err(HubError::AlreadyBound)
        ));
    }

    #[test]
    fn test_snapshot_merge_ignores_later_additions() {
        let client = offline_client();
        let parent = SqlRouter::new();
        let child = SqlRouter::new();
        parent.include_router(&child).unwrap();

        // Added after inclusion: invisible to the parent's snapshot.
        child.on_channel("late", |_| async { Ok(()) });

        client.include_router(&parent).unwrap();
        assert!(client.channels().is_empty());
    }

    #[test]
    fn test_listener_bindings_fold_into_client() {
        let client = offline_client();
        let parent = SqlRouter::new();
        let child = SqlRouter::new();
        child.on_channel("orders", |_| async { Ok(()) });
        parent.on_channel("payments", |_| async { Ok(()) });
        parent.include_router(&child).unwrap();
        client.include_router(&parent).unwrap();

        assert_eq!(
            client.channels(),
            vec!["orders".to_string(), "payments".to_string()]
        );
    }

    #[test]
    fn test_register_after_binding_is_rejected() {
        let client = offline_client();
        let parent = SqlRouter::new();
        let child = SqlRouter::new();
        child.register_query("early_q", "SELECT 1").unwrap();
        parent.include_router(&child).unwrap();
        client.include_router(&parent).unwrap();

        // The fold already happened; accepting this would lose the query.
        assert!(matches!(
            child.register_query("late_q", "SELECT 2"),
            Err(HubError::AlreadyBound)
        ));
        assert!(matches!(
            parent.register_query("late_q", "SELECT 2"),
            Err(HubError::AlreadyBound)
        ));
        assert!(matches!(
            child.lookup("late_q"),
            Err(HubError::UnknownQuery(_))
        ));
        assert_eq!(child.lookup("early_q").unwrap().name(), "early_q");
    }

    #[test]
    fn test_duplicate_query_across_routers() {
        let parent = SqlRouter::new();
        let child = SqlRouter::new();
        parent.register_query("q", "SELECT 1").unwrap();
        child.register_query("q", "SELECT 2").unwrap();
        assert!(matches!(
            parent.include_router(&child),
            Err(HubError::DuplicateQuery(name)) if name == "q"
        ));
    }
}
