//! # sqlhub — named SQL queries and notification routing for PostgreSQL
//!
//! sqlhub sits between application code and a PostgreSQL connection. You
//! register named queries with `{name}`-style placeholders and bind
//! callbacks to LISTEN/NOTIFY channels; sqlhub compiles the placeholders
//! into positional markers, manages the prepared-statement lifecycle, shapes
//! raw result sets into the value a caller expects, and fans notifications
//! out to per-channel listeners and global pipes.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use sqlhub::prelude::*;
//!
//! let client = SqlClient::new(ConnectParams::new("localhost", 5432, "app", "secret", "appdb"));
//!
//! client.register_query("user_count", "SELECT count(*) FROM users WHERE org = {org}")?;
//! client.on_channel("orders", |payload| async move {
//!     println!("order event: {payload:?}");
//!     Ok(())
//! });
//!
//! client.start().await?;
//!
//! // A COUNT comes back as a scalar, a SELECT * as rows.
//! let count = client.query("user_count", &Args::new().set("org", 7)).await?;
//!
//! client.stop().await?;
//! ```
//!
//! ## Result shapes
//!
//! | rows | columns | result                      |
//! |------|---------|-----------------------------|
//! | 0    | any     | `QueryOutput::None`         |
//! | 1    | 1       | `QueryOutput::Scalar`       |
//! | 1    | >1      | `QueryOutput::Row`          |
//! | >1   | 1       | `QueryOutput::Column`       |
//! | >1   | >1      | `QueryOutput::Rows`         |

pub mod client;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod router;
pub mod shape;
pub mod statement;
pub mod template;
pub mod value;

pub use client::SqlClient;
pub use dispatch::{listener, pipe, Payload};
pub use error::{HubError, HubResult};
pub use gateway::ConnectParams;
pub use router::SqlRouter;
pub use shape::QueryOutput;
pub use template::CompiledQuery;
pub use value::{Args, SqlValue};

pub mod prelude {
    pub use crate::client::SqlClient;
    pub use crate::dispatch::{listener, pipe, Payload};
    pub use crate::error::{HubError, HubResult};
    pub use crate::gateway::ConnectParams;
    pub use crate::router::SqlRouter;
    pub use crate::shape::QueryOutput;
    pub use crate::value::{Args, SqlValue};
}

/// Compile a query template into its driver-executable form.
///
/// # Example
///
/// ```
/// let compiled = sqlhub::compile("SELECT * FROM t WHERE id = {id}").unwrap();
/// assert_eq!(compiled.sql(), "SELECT * FROM t WHERE id = $1");
/// assert_eq!(compiled.parameters(), &["id"]);
/// ```
pub fn compile(raw: &str) -> HubResult<CompiledQuery> {
    template::compile(raw)
}
