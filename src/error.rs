//! Error types for sqlhub.

use thiserror::Error;

/// The main error type for sqlhub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed placeholder syntax in a query template.
    #[error("Template error: {0}")]
    Template(String),

    /// A query was registered twice under the same name.
    #[error("Duplicate query: a query named \"{0}\" is already registered")]
    DuplicateQuery(String),

    /// Lookup of a query name that was never registered.
    #[error("Unknown query: \"{0}\" could not be found")]
    UnknownQuery(String),

    /// Execute was called before prepare (or after deallocate).
    #[error("Query \"{0}\" is not prepared")]
    NotPrepared(String),

    /// The driver rejected statement preparation.
    #[error("Failed to prepare query \"{name}\": {source}")]
    Prepare {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// The driver rejected statement release.
    #[error("Failed to deallocate prepared statements: {0}")]
    Deallocate(#[source] sqlx::Error),

    /// One or more queries failed to prepare during startup.
    #[error("{} of {total} queries failed to prepare", failures.len())]
    PrepareAll {
        total: usize,
        failures: Vec<(String, HubError)>,
    },

    /// The driver rejected a channel subscription.
    #[error("Failed to subscribe to channel \"{channel}\": {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: sqlx::Error,
    },

    /// A router was bound to a second parent or client.
    #[error("Router is already bound to a parent or client")]
    AlreadyBound,

    /// A router is not directly or indirectly connected to a client.
    #[error("Router is not directly or indirectly connected to a client")]
    UnboundRouter,

    /// An operation that needs a live connection ran before `start`.
    #[error("Client is not connected")]
    NotConnected,

    /// Any other database driver error.
    #[error("Driver error: {0}")]
    Driver(#[from] sqlx::Error),
}

impl HubError {
    /// Create a template error with positional context.
    pub fn template_at(offset: usize, message: impl Into<String>) -> Self {
        Self::Template(format!("{} (at offset {offset})", message.into()))
    }
}

/// Result type alias for sqlhub operations.
pub type HubResult<T> = Result<T, HubError>;
