//! Cross-cutting helpers shared by adapters and the binary.

pub mod config;
