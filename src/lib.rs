//! cloud-backup: Scheduled cloud backup and guarded restore of a libsql application database,
//! built with Hexagonal Architecture.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
