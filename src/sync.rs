//! Shared-state primitives used for component links.
//!
//! `parking_lot` locks are poison-free, so guard access reads the same at
//! every call site. The simulator driver owns the strong `Arc` handles;
//! levels refer to their neighbors (in both directions) through `Weak`
//! links, keeping the bipartite level graph free of reference cycles.

pub use parking_lot::{Mutex, MutexGuard, RwLock};
pub use std::sync::{Arc, Weak};
