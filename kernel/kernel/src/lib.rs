//! # Kernel core integration
//!
//! Ties the memory crates and the scheduler together into the two handles
//! the rest of the kernel consumes:
//!
//! * [`MemoryContext`] — the single explicit bundle of frame table, table
//!   windows, kernel address space, kernel range allocator, and heap.
//!   Everything the filesystem, drivers, and syscall layers need for
//!   memory (`kmalloc`/`kfree`, range windows, address-space lifecycle)
//!   hangs off it; there is no ambient global state in the library.
//! * [`kernel_sched::Scheduler`] — scheduling policy, driven by the
//!   x86-only [`dispatch`] layer that performs the actual context switch.
//!
//! Boot code (out of scope here) parses the memory map, carves out the
//! frame-table storage, constructs the `MemoryContext` with the real
//! [`Quickmap`](kernel_paging::Quickmap) windows, installs it as the
//! global allocator backend, and starts the scheduler.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

#[cfg(target_arch = "x86")]
pub mod dispatch;
#[cfg(target_arch = "x86")]
mod global_alloc;
pub mod logger;
mod memory;

pub use memory::{InitError, MemoryContext, SpacePager, backing_frame};

#[cfg(target_arch = "x86")]
pub use global_alloc::{install_kernel_memory, kernel_memory};
