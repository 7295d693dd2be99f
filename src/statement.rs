//! Prepared query lifecycle.
//!
//! Wraps one compiled query and its server-side statement handle. The handle
//! moves `absent → prepared → absent`: `prepare` fills it, `deallocate`
//! empties it, and executing while it is absent is a programmer error
//! surfaced as [`HubError::NotPrepared`] rather than silently re-preparing.

use std::fmt;

use parking_lot::Mutex;
use sqlx::postgres::PgStatement;
use sqlx::{Column, Statement};

use crate::error::{HubError, HubResult};
use crate::gateway::Gateway;
use crate::shape::QueryOutput;
use crate::template::{compile, CompiledQuery};
use crate::value::Args;

enum StatementState {
    Unprepared,
    Prepared(PgStatement<'static>),
    /// Terminal: the driver failed while releasing the statement, so the
    /// server-side state is unknown.
    Failed,
}

/// A named query with its compiled text and statement handle.
pub struct PreparedQuery {
    name: String,
    compiled: CompiledQuery,
    state: Mutex<StatementState>,
}

impl fmt::Debug for PreparedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedQuery")
            .field("name", &self.name)
            .field("sql", &self.compiled.sql())
            .field("prepared", &self.is_prepared())
            .finish()
    }
}

impl PreparedQuery {
    /// Compile `raw` and store it unprepared under `name`.
    pub(crate) fn new(name: impl Into<String>, raw: &str) -> HubResult<Self> {
        let name = name.into();
        let compiled = compile(raw).map_err(|error| match error {
            HubError::Template(message) => {
                HubError::Template(format!("in query \"{name}\": {message}"))
            }
            other => other,
        })?;
        Ok(Self {
            name,
            compiled,
            state: Mutex::new(StatementState::Unprepared),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The rewritten query text sent to the driver.
    pub fn sql(&self) -> &str {
        self.compiled.sql()
    }

    /// Declared parameter names in binding order.
    pub fn parameters(&self) -> &[String] {
        self.compiled.parameters()
    }

    pub fn is_prepared(&self) -> bool {
        matches!(*self.state.lock(), StatementState::Prepared(_))
    }

    /// Result column names reported by the server, once prepared.
    pub fn result_columns(&self) -> Option<Vec<String>> {
        match &*self.state.lock() {
            StatementState::Prepared(statement) => Some(
                statement
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Register the query server-side and store the returned handle.
    ///
    /// No-op when already prepared. On driver refusal the handle stays
    /// absent and the error surfaces as [`HubError::Prepare`].
    pub(crate) async fn prepare(&self, gateway: &Gateway) -> HubResult<()> {
        {
            let state = self.state.lock();
            match &*state {
                StatementState::Prepared(_) => return Ok(()),
                StatementState::Failed => {
                    return Err(HubError::Prepare {
                        name: self.name.clone(),
                        source: sqlx::Error::Protocol(
                            "statement is in a failed state".into(),
                        ),
                    });
                }
                StatementState::Unprepared => {}
            }
        }

        tracing::debug!(query = %self.name, "preparing query for later use");
        let statement = gateway
            .prepare(self.compiled.sql())
            .await
            .map_err(|error| match error {
                HubError::Driver(source) => HubError::Prepare {
                    name: self.name.clone(),
                    source,
                },
                other => other,
            })?;

        *self.state.lock() = StatementState::Prepared(statement);
        Ok(())
    }

    /// Bind the named arguments and run the statement through the gateway.
    pub(crate) async fn execute(&self, gateway: &Gateway, args: &Args) -> HubResult<QueryOutput> {
        if !self.is_prepared() {
            return Err(HubError::NotPrepared(self.name.clone()));
        }

        let positional = self.compiled.positional(args);
        tracing::debug!(query = %self.name, "executing query");
        gateway.execute(self.compiled.sql(), &positional).await
    }

    /// Return the handle to absent. Idempotent when already absent.
    pub(crate) fn deallocate(&self) {
        let mut state = self.state.lock();
        if matches!(*state, StatementState::Prepared(_)) {
            *state = StatementState::Unprepared;
        }
    }

    pub(crate) fn mark_failed(&self) {
        *self.state.lock() = StatementState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ConnectParams;

    fn offline_gateway() -> Gateway {
        Gateway::new(ConnectParams::new("localhost", 5432, "u", "p", "db"))
    }

    #[test]
    fn test_new_compiles_template() {
        let query = PreparedQuery::new("by_id", "SELECT * FROM t WHERE id = {id}").unwrap();
        assert_eq!(query.name(), "by_id");
        assert_eq!(query.sql(), "SELECT * FROM t WHERE id = $1");
        assert_eq!(query.parameters(), &["id"]);
        assert!(!query.is_prepared());
        assert!(query.result_columns().is_none());
    }

    #[test]
    fn test_debug_shows_name_and_state() {
        let query = PreparedQuery::new("by_id", "SELECT * FROM t WHERE id = {id}").unwrap();
        let debug = format!("{query:?}");
        assert!(debug.contains("by_id"));
        assert!(debug.contains("prepared: false"));
    }

    #[test]
    fn test_new_rejects_malformed_template() {
        let err = PreparedQuery::new("broken", "SELECT {").unwrap_err();
        assert!(matches!(err, HubError::Template(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_execute_unprepared_fails_fast() {
        let query = PreparedQuery::new("q", "SELECT 1").unwrap();
        let err = query
            .execute(&offline_gateway(), &Args::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotPrepared(name) if name == "q"));
    }

    #[tokio::test]
    async fn test_failed_state_is_terminal_for_prepare() {
        let query = PreparedQuery::new("q", "SELECT 1").unwrap();
        query.mark_failed();
        let err = query.prepare(&offline_gateway()).await.unwrap_err();
        assert!(matches!(err, HubError::Prepare { .. }));
    }

    #[test]
    fn test_deallocate_is_idempotent_from_absent() {
        let query = PreparedQuery::new("q", "SELECT 1").unwrap();
        query.deallocate();
        query.deallocate();
        assert!(!query.is_prepared());
    }
}
