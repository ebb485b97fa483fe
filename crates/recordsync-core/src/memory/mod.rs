//! In-memory collaborators.
//!
//! Reference implementations of the local and remote stores, used by tests
//! and by hosts that want to exercise the change manager without a backend.

mod local;
mod remote;

pub use local::MemoryLocalStore;
pub use remote::MemoryRemoteStore;
