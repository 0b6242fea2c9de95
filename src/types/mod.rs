//! Domain records shared by every component.
//!
//! The store persists these types as-is; the HTTP layer exposes them through
//! the DTOs in [`crate::server::dto`].

pub mod condensation;
pub mod contributor;
pub mod dimension;
pub mod fragment;
pub mod session;
pub mod soul;

pub use condensation::CondensationEvent;
pub use contributor::{Contributor, ContributorStatus};
pub use dimension::{Dimension, DimensionEntry, Profile};
pub use fragment::{Fragment, FragmentStatus};
pub use session::{Session, WalletBinding};
pub use soul::{Soul, Stage};

/// Generate a fresh record identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
