//! # studio-store
//!
//! `SQLite` persistence for the studio backend: connection pooling,
//! migrations, repositories, and the [`StudioStore`] facade used by the
//! runtime and the HTTP layer.

pub mod connection;
pub mod errors;
pub mod migrations;
pub mod repositories;
pub mod row_types;

mod store;

pub use connection::{new_file, new_in_memory, ConnectionConfig, ConnectionPool};
pub use errors::{Result, StoreError};
pub use migrations::run_migrations;
pub use store::StudioStore;
