//! # Kernel synchronization primitives
//!
//! Two tiers, matching how the kernel actually excludes:
//!
//! * [`SpinLock`] — a plain CAS spinlock for short critical sections over
//!   the shared tables (frame bitmap, range lists). On a single CPU these
//!   sections additionally run with interrupts disabled ([`IrqGuard`]).
//! * [`ProcessMutex`] — the long-section lock: reentrant, owned by a
//!   process rather than a call site, and polite under contention — while
//!   the lock is held elsewhere it yields to the scheduler through a
//!   [`LockWorld`] instead of burning the only CPU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod once_cell;
mod process_mutex;
mod spin_lock;

pub use irq::IrqGuard;
pub use once_cell::SyncOnceCell;
pub use process_mutex::{HolderId, LockWorld, ProcessMutex};
pub use spin_lock::{SpinLock, SpinLockGuard};
