//! Remote object store transports.
//!
//! Google Drive over REST for real use; in-memory for tests and offline runs.

pub mod google_drive;
pub mod memory;
pub mod oauth;

pub use google_drive::GoogleDriveTransport;
pub use memory::{InMemoryTransport, TransportOp};
pub use oauth::{OAuthClient, TokenStore, Tokens};
