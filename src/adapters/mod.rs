//! Infrastructure adapters. Implement outbound ports.
//!
//! Application database, JSON settings/status files, Google Drive, terminal UI.
//! Map errors to DomainError.

pub mod persistence;
pub mod remote;
pub mod ui;
