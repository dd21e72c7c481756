//! # Scheduler and Process State Machine
//!
//! Strict-FIFO cooperative scheduling for a single CPU: a process-id
//! ordered global table, a ready queue, and predicate-based blocking.
//!
//! ```text
//!            register            yield(true)
//! RUNNABLE ───────────▶ RUNNING ────────────▶ RUNNABLE (requeued)
//!     ▲                 │     │
//!     │ predicate true  │     │ exit
//!     │ or signal       ▼     ▼
//!     └─────────── BLOCKED   DYING ──▶ DEAD (reaped by the parent)
//! ```
//!
//! The crate deliberately splits **policy** from **dispatch**: everything
//! here — queue selection, the blocked-process scan, state transitions —
//! is ordinary safe code driven through [`Scheduler::prepare_switch`],
//! which returns *which* process to run next. The non-returning part
//! (saving registers, switching the address-translation root, restoring
//! the next context) lives in the integration crate's x86 dispatch layer
//! on top of [`context::switch_context`]. Tests drive the policy directly,
//! simulating a machine by calling `prepare_switch` in a loop.
//!
//! Callers of the policy API run it with interrupts disabled; blocking
//! predicates are only ever evaluated inside that window, and never while
//! their process is running elsewhere.
//!
//! Invariant violations (the idle process blocking, consulting `current`
//! before anything was dispatched) are kernel bugs and panic — a scheduler
//! has no one to report errors to.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod context;
mod process;
mod scheduler;

pub use context::{CpuContext, FpuState};
pub use process::{
    BlockPredicate, Process, ProcessId, ProcessSpace, ProcessState, StackRange, WakeReason,
};
pub use scheduler::{BlockOutcome, BlockStart, Dispatch, Scheduler};
