//! Mapping from logical query names to prepared queries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{HubError, HubResult};
use crate::gateway::Gateway;
use crate::statement::PreparedQuery;

/// Registry of named queries, unique by name.
#[derive(Default)]
pub struct QueryRegistry {
    entries: RwLock<HashMap<String, Arc<PreparedQuery>>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and store a query template under `name`.
    ///
    /// A duplicate name fails with [`HubError::DuplicateQuery`] and leaves
    /// the first registration intact.
    pub fn register(&self, name: impl Into<String>, raw: &str) -> HubResult<()> {
        let name = name.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(HubError::DuplicateQuery(name));
        }
        let query = Arc::new(PreparedQuery::new(name.clone(), raw)?);
        entries.insert(name, query);
        Ok(())
    }

    /// Register a batch of `(name, text)` pairs, failing on the first error.
    pub fn register_all<I, N, Q>(&self, pairs: I) -> HubResult<()>
    where
        I: IntoIterator<Item = (N, Q)>,
        N: Into<String>,
        Q: AsRef<str>,
    {
        for (name, raw) in pairs {
            self.register(name, raw.as_ref())?;
        }
        Ok(())
    }

    /// Look up a query by name.
    pub fn lookup(&self, name: &str) -> HubResult<Arc<PreparedQuery>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::UnknownQuery(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// How many entries currently hold a live statement handle.
    pub fn prepared_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|q| q.is_prepared())
            .count()
    }

    fn snapshot(&self) -> Vec<Arc<PreparedQuery>> {
        self.entries.read().values().cloned().collect()
    }

    /// Prepare every registered query.
    ///
    /// Best-effort: every entry is attempted even after a failure, then the
    /// failures are reported in aggregate so startup diagnostics name every
    /// failing query.
    pub async fn prepare_all(&self, gateway: &Gateway) -> HubResult<()> {
        let queries = self.snapshot();
        let total = queries.len();
        let mut failures = Vec::new();

        for query in queries {
            if let Err(error) = query.prepare(gateway).await {
                tracing::warn!(query = %query.name(), %error, "query failed to prepare");
                failures.push((query.name().to_string(), error));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HubError::PrepareAll { total, failures })
        }
    }

    /// Return every handle to absent, then release the server-side set.
    pub async fn deallocate_all(&self, gateway: &Gateway) -> HubResult<()> {
        let queries = self.snapshot();
        for query in &queries {
            query.deallocate();
        }
        if let Err(error) = gateway.clear_statements().await {
            // Server-side state is unknown from here on.
            for query in &queries {
                query.mark_failed();
            }
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_name_rejected_first_intact() {
        let registry = QueryRegistry::new();
        registry.register("fetch", "SELECT a FROM t WHERE id = {id}").unwrap();

        let err = registry.register("fetch", "SELECT b FROM u").unwrap_err();
        assert!(matches!(err, HubError::DuplicateQuery(name) if name == "fetch"));

        let kept = registry.lookup("fetch").unwrap();
        assert_eq!(kept.sql(), "SELECT a FROM t WHERE id = $1");
    }

    #[test]
    fn test_unknown_lookup() {
        let registry = QueryRegistry::new();
        assert!(matches!(
            registry.lookup("nope"),
            Err(HubError::UnknownQuery(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_register_all() {
        let registry = QueryRegistry::new();
        registry
            .register_all([("a", "SELECT 1"), ("b", "SELECT {x}")])
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.prepared_count(), 0);
    }

    #[test]
    fn test_register_rejects_bad_template() {
        let registry = QueryRegistry::new();
        let err = registry.register("bad", "SELECT {").unwrap_err();
        assert!(matches!(err, HubError::Template(_)));
        assert!(registry.is_empty());
    }
}
