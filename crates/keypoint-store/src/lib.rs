//! Keypoint credential storage and scope resolution.
//!
//! This crate holds the data side of the keypoint authorization core:
//!
//! - [`keypoint`]: the [`Keypoint`] credential record and partial updates.
//! - [`scope`]: the [`ScopeRegistry`] with its cycle-safe inheritance graph.
//! - [`index`]: records plus secret/name/scope indexes kept in lockstep.
//! - [`store`]: the async [`KeypointStore`] contract and the in-memory backend.
//! - [`file`]: a write-through JSON file backend.
//! - [`ip`]: literal / CIDR / range IP matching.
//! - [`error`]: [`StoreError`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use keypoint_store::{FileKeypointStore, Keypoint, KeypointStore, ScopeRegistry};
//!
//! # async fn example() -> keypoint_store::Result<()> {
//! let store = FileKeypointStore::open("data/keypoints.json").await?;
//! store
//!     .set(Keypoint::new("ci-runner", "s3cret").with_scopes(["admin"]))
//!     .await?;
//!
//! let registry = ScopeRegistry::with_defaults();
//! let kp = store.get("ci-runner").await?.expect("just stored");
//! assert!(registry.has_scope(&kp.scopes, "write"));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod file;
pub mod index;
pub mod ip;
pub mod keypoint;
pub mod scope;
pub mod store;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{Result, StoreError};
pub use file::FileKeypointStore;
pub use index::{KeypointFilter, KeypointIndex};
pub use keypoint::{Keypoint, KeypointPatch, RateLimit};
pub use scope::{ScopeDefinition, ScopeRegistry};
pub use store::{KeypointStore, MemoryKeypointStore};
