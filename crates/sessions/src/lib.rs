//! Conversation-handle persistence and identity normalization for turnwise.
//!
//! The core keeps one opaque backend handle per canonical user.  This crate
//! owns the `ThreadStore` seam, a JSON-file reference store, and the
//! resolver that maps raw transport IDs onto canonical users.

pub mod identity;
pub mod store;

pub use identity::IdentityResolver;
pub use store::{JsonThreadStore, ThreadEntry, ThreadStore};
