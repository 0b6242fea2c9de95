//! # Ensoul
//!
//! Fragment lifecycle engine for collaboratively built personality profiles
//! ("souls"). Contributors submit batches of observations, an external judge
//! curates them, accepted fragments are periodically condensed into a new
//! profile version and system prompt, and a background reconciler backfills
//! on-chain agent identifiers.

pub mod chain;
pub mod condensation;
pub mod config;
pub mod curation;
pub mod errors;
pub mod identity;
pub mod lifecycle;
pub mod quota;
pub mod server;
pub mod service;
pub mod store;
pub mod types;
pub mod validator;

pub use errors::{EnsoulError, Result};
pub use service::{AcceptedBatch, Ensoul, EnsoulConfig};
pub use types::{Dimension, Fragment, FragmentStatus, Soul, Stage};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
