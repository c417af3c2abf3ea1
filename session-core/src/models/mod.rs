//! Data models for the NoChat session layer
//!
//! These types are used for network bodies, the sync feed and the
//! conversation view-model.

mod types;

pub use types::*;
