//! Local persistence: JSON settings/status files and the libsql application database.

pub mod json_store;
pub mod libsql_state;

pub use json_store::JsonStore;
pub use libsql_state::{LibsqlAppState, MigrationGuard};
