//! Object header synchronization for a managed runtime.
//!
//! Every object starts with a [`MarkWord`](oops::MarkWord) that holds its lock
//! state and identity hash, or a forwarding pointer while a collector moves
//! it. The [`runtime`] module implements the locking protocols on top of that
//! word (biased locking, stack locking and monitors), and the [`gc`] module
//! implements forwarding and the preserved-marks undo log.

pub mod config;
pub mod gc;
pub mod oops;
pub mod runtime;
pub mod utils;

pub use config::SyncConfig;
pub use oops::{Klass, MarkKind, MarkWord, ObjectHeader, ObjectRef};
pub use runtime::{LockResult, ObjectLocker, ObjectSynchronizer, Thread, ThreadId, UnlockResult};
