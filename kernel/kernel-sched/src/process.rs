use crate::context::{CpuContext, FpuState};
use kernel_addresses::VirtualAddress;
use kernel_paging::AddressSpace;

/// Process identifier. Id 0 is conventionally the reserved idle process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Life cycle of a process; see the crate docs for the transition graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Runnable,
    Running,
    Blocked,
    Dying,
    Dead,
}

/// A side-effect-free wake condition, evaluated by the scheduler with
/// interrupts disabled. The `usize` is the opaque argument registered
/// alongside it — typically a pointer the waiting subsystem owns.
pub type BlockPredicate = fn(usize) -> bool;

/// Why a blocked process was promoted back to runnable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// Its predicate evaluated true.
    Predicate,
    /// A pending signal cancelled the wait.
    Signal,
}

/// The address space a process runs in.
///
/// Kernel processes (the idle process, kernel worker loops) run in the
/// kernel's own space and own nothing; user processes exclusively own
/// their [`AddressSpace`], which is destroyed when the process is reaped.
#[derive(Debug)]
pub enum ProcessSpace {
    Kernel,
    User(AddressSpace),
}

/// A process's kernel stack region.
#[derive(Copy, Clone, Debug)]
pub struct StackRange {
    pub base: VirtualAddress,
    pub size: u32,
}

impl StackRange {
    /// Initial stack pointer: stacks grow down from the top.
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u32() + self.size)
    }
}

pub(crate) struct BlockWait {
    pub predicate: BlockPredicate,
    pub data: usize,
}

/// One schedulable unit: identity, saved execution state, owned address
/// space and stack, and the blocking/signal bookkeeping the scheduler
/// needs.
pub struct Process {
    id: ProcessId,
    parent: ProcessId,
    group: ProcessId,
    pub(crate) state: ProcessState,
    pub context: CpuContext,
    pub fpu: FpuState,
    space: ProcessSpace,
    kernel_stack: StackRange,
    pub(crate) pending_signals: u32,
    pub(crate) block: Option<BlockWait>,
    pub(crate) wake: Option<WakeReason>,
    pub kernel_ticks: u64,
    pub user_ticks: u64,
}

impl Process {
    /// A fresh `Runnable` process. The caller registers it with the
    /// scheduler and, for user processes, has already built its address
    /// space and kernel stack.
    #[must_use]
    pub fn new(
        id: ProcessId,
        parent: ProcessId,
        group: ProcessId,
        space: ProcessSpace,
        kernel_stack: StackRange,
    ) -> Self {
        Self {
            id,
            parent,
            group,
            state: ProcessState::Runnable,
            context: CpuContext::default(),
            fpu: FpuState::default(),
            space,
            kernel_stack,
            pending_signals: 0,
            block: None,
            wake: None,
            kernel_ticks: 0,
            user_ticks: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    #[must_use]
    pub const fn parent(&self) -> ProcessId {
        self.parent
    }

    #[must_use]
    pub const fn group(&self) -> ProcessId {
        self.group
    }

    #[must_use]
    pub const fn state(&self) -> ProcessState {
        self.state
    }

    #[must_use]
    pub const fn space(&self) -> &ProcessSpace {
        &self.space
    }

    /// Take the address space out of a reaped process for destruction.
    #[must_use]
    pub fn take_space(&mut self) -> ProcessSpace {
        core::mem::replace(&mut self.space, ProcessSpace::Kernel)
    }

    #[must_use]
    pub const fn kernel_stack(&self) -> StackRange {
        self.kernel_stack
    }

    /// Mark `signal` pending. Signals are a bitmap of 32 slots; delivery
    /// itself happens in the dispatch path, but a pending bit already
    /// cancels blocking.
    pub fn deliver_signal(&mut self, signal: u8) {
        assert!(signal < 32, "signal {signal} out of range");
        self.pending_signals |= 1 << signal;
    }

    #[must_use]
    pub const fn has_pending_signals(&self) -> bool {
        self.pending_signals != 0
    }

    /// Drain the pending-signal bitmap, e.g. at delivery time.
    pub const fn take_pending_signals(&mut self) -> u32 {
        let signals = self.pending_signals;
        self.pending_signals = 0;
        signals
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
