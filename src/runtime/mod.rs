//! Object locking: biased locks, stack locks, monitors and the runtime
//! services they rely on.

pub mod biased_locking;
pub mod counters;
pub mod lock_record;
pub mod mutex;
pub mod object_monitor;
pub mod safepoint;
pub mod stack_lock;
pub mod synchronizer;
pub mod thread;

pub use lock_record::LockRecord;
pub use synchronizer::{LockResult, ObjectLocker, ObjectSynchronizer, UnlockResult};
pub use thread::{Thread, ThreadId};
