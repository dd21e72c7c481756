use crate::process::{BlockWait, Process, ProcessId, ProcessState, WakeReason};
use crate::BlockPredicate;
use alloc::collections::{BTreeMap, VecDeque};
use log::trace;

/// What the dispatch layer must do after a scheduling decision: save
/// `previous` (unless it is the idle process, which is always restarted
/// fresh), then switch address space and resume `next`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub previous: Option<ProcessId>,
    pub next: ProcessId,
}

/// How a completed block ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use = "a blocking caller must check for interruption"]
pub enum BlockOutcome {
    /// The predicate came true.
    Completed,
    /// A pending signal cancelled the wait; the caller typically
    /// propagates an EINTR-style error.
    Interrupted,
}

/// What [`Scheduler::block_current`] decided.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use = "only the Blocked case may yield"]
pub enum BlockStart {
    /// The predicate already holds; do not yield.
    Ready,
    /// A signal is already pending; do not yield, the wait counts as
    /// interrupted.
    Interrupted,
    /// The process is now blocked: yield without requeueing, then consult
    /// [`Scheduler::finish_block`] once resumed.
    Blocked,
}

/// The ready queue and the global process table.
///
/// Pure policy: every method runs to completion in ordinary safe code and
/// must be called with interrupts disabled. The actual context switch is
/// the dispatch layer's job, driven by the [`Dispatch`] value returned
/// from [`prepare_switch`](Self::prepare_switch).
pub struct Scheduler {
    /// All live processes, ordered by id — the blocked-process scan
    /// depends on this order for its wake-order guarantee.
    table: BTreeMap<ProcessId, Process>,
    /// Strict FIFO; never contains the idle process.
    ready: VecDeque<ProcessId>,
    current: Option<ProcessId>,
    idle: ProcessId,
    next_pid: u32,
}

impl Scheduler {
    /// Build the scheduler around the reserved idle process, which lives
    /// in the table but never in the ready queue: it runs only when the
    /// queue is empty.
    #[must_use]
    pub fn new(idle: Process) -> Self {
        assert!(
            idle.state() == ProcessState::Runnable,
            "idle process must start runnable",
        );
        let idle_id = idle.id();
        let mut table = BTreeMap::new();
        table.insert(idle_id, idle);
        Self {
            table,
            ready: VecDeque::new(),
            current: None,
            idle: idle_id,
            next_pid: idle_id.0 + 1,
        }
    }

    /// Hand out the next unused process id.
    pub const fn allocate_pid(&mut self) -> ProcessId {
        let id = ProcessId(self.next_pid);
        self.next_pid += 1;
        id
    }

    /// Insert a newly created process into the global table and the ready
    /// queue. Only legal for a `Runnable` process with an unused id.
    pub fn register(&mut self, process: Process) {
        assert!(
            process.state() == ProcessState::Runnable,
            "registering {} in state {:?}",
            process.id(),
            process.state(),
        );
        let id = process.id();
        assert!(
            self.table.insert(id, process).is_none(),
            "{id} registered twice",
        );
        self.ready.push_back(id);
        trace!("registered {id}");
    }

    /// Append a runnable process to the tail of the ready queue.
    pub fn enqueue(&mut self, id: ProcessId) {
        assert!(id != self.idle, "the idle process is never queued");
        let process = self.table.get(&id).expect("enqueue of unknown process");
        assert!(
            process.state() == ProcessState::Runnable,
            "enqueue of {id} in state {:?}",
            process.state(),
        );
        self.ready.push_back(id);
    }

    /// The scheduling core: called for every cooperative or preemptive
    /// yield, with interrupts disabled.
    ///
    /// Promotes every blocked process whose predicate now holds or which
    /// has a pending signal (scanned in id order — the wake-order
    /// guarantee), retires or requeues the outgoing process, and picks the
    /// head of the ready queue — or the idle process when the queue is
    /// empty. The returned [`Dispatch`] tells the dispatch layer what to
    /// save and what to resume.
    pub fn prepare_switch(&mut self, requeue_current: bool) -> Dispatch {
        self.wake_eligible();

        let previous = self.current.take();
        if let Some(prev) = previous {
            let process = self.table.get_mut(&prev).expect("current process vanished");
            match process.state {
                ProcessState::Running => {
                    process.state = ProcessState::Runnable;
                    if requeue_current && prev != self.idle {
                        self.ready.push_back(prev);
                    }
                }
                // set by block_current before the yield
                ProcessState::Blocked => {}
                // blocked, then promoted by this very yield's scan (a
                // signal or the predicate raced ahead); already queued
                ProcessState::Runnable => {}
                ProcessState::Dying => {
                    // only now is its stack no longer in use
                    process.state = ProcessState::Dead;
                    trace!("{prev} is dead, awaiting reaping");
                }
                ProcessState::Dead => {
                    panic!("{prev} was current but already dead");
                }
            }
        }

        let next = self.ready.pop_front().unwrap_or(self.idle);
        let process = self.table.get_mut(&next).expect("queued process vanished");
        assert!(
            process.state == ProcessState::Runnable,
            "{next} queued in state {:?}",
            process.state,
        );
        process.state = ProcessState::Running;
        self.current = Some(next);

        trace!("dispatch {previous:?} -> {next}");
        Dispatch { previous, next }
    }

    /// Promote blocked processes in id order; a true predicate and a
    /// pending signal are equally valid wake reasons.
    fn wake_eligible(&mut self) {
        for (id, process) in &mut self.table {
            if process.state != ProcessState::Blocked {
                continue;
            }
            let wait = process
                .block
                .as_ref()
                .expect("blocked process without a predicate");
            let reason = if process.pending_signals != 0 {
                Some(WakeReason::Signal)
            } else if (wait.predicate)(wait.data) {
                Some(WakeReason::Predicate)
            } else {
                None
            };
            if let Some(reason) = reason {
                process.state = ProcessState::Runnable;
                process.block = None;
                process.wake = Some(reason);
                self.ready.push_back(*id);
                trace!("woke {id} ({reason:?})");
            }
        }
    }

    /// First half of blocking. A predicate that already holds or a signal
    /// that is already pending means no suspension happens at all;
    /// otherwise the current process moves to `Blocked` and the caller
    /// yields without requeueing, consulting
    /// [`finish_block`](Self::finish_block) once resumed.
    pub fn block_current(&mut self, predicate: BlockPredicate, data: usize) -> BlockStart {
        let current = self.current.expect("blocking with no current process");
        assert!(current != self.idle, "the idle process must never block");
        if predicate(data) {
            return BlockStart::Ready;
        }
        let process = self.table.get_mut(&current).expect("current process vanished");
        if process.pending_signals != 0 {
            return BlockStart::Interrupted;
        }
        debug_assert!(process.state == ProcessState::Running);
        process.state = ProcessState::Blocked;
        process.block = Some(BlockWait { predicate, data });
        process.wake = None;
        trace!("{current} blocked");
        BlockStart::Blocked
    }

    /// Second half of blocking, called by the process after it resumes:
    /// whether the wake was the predicate or a cancelling signal.
    pub fn finish_block(&mut self) -> BlockOutcome {
        let current = self.current.expect("no current process");
        let process = self.table.get_mut(&current).expect("current process vanished");
        match process.wake.take() {
            Some(WakeReason::Signal) => BlockOutcome::Interrupted,
            _ => BlockOutcome::Completed,
        }
    }

    /// Timer-interrupt accounting: one tick of CPU time for the current
    /// process. The interrupt handler follows up with a preemptive
    /// `prepare_switch(true)`.
    pub fn account_tick(&mut self, was_in_kernel: bool) {
        if let Some(current) = self.current {
            let process = self.table.get_mut(&current).expect("current process vanished");
            if was_in_kernel {
                process.kernel_ticks += 1;
            } else {
                process.user_ticks += 1;
            }
        }
    }

    /// Move the current process to `Dying`; it becomes `Dead` once the
    /// next switch has moved off its stack. The caller yields without
    /// requeueing.
    pub fn exit_current(&mut self) {
        let current = self.current.expect("exiting with no current process");
        assert!(current != self.idle, "the idle process cannot exit");
        let process = self.table.get_mut(&current).expect("current process vanished");
        process.state = ProcessState::Dying;
        trace!("{current} exiting");
    }

    /// Mark `signal` pending on a process. Returns whether the process
    /// exists; waking it up is the next `prepare_switch`'s job.
    pub fn deliver_signal(&mut self, id: ProcessId, signal: u8) -> bool {
        match self.table.get_mut(&id) {
            Some(process) => {
                process.deliver_signal(signal);
                true
            }
            None => false,
        }
    }

    /// Remove a `Dead` process from the table, handing it to the reaper so
    /// its address space and stack can be destroyed. Returns `None` if the
    /// process is missing or not dead yet.
    pub fn reap(&mut self, id: ProcessId) -> Option<Process> {
        if self.table.get(&id)?.state != ProcessState::Dead {
            return None;
        }
        trace!("reaped {id}");
        self.table.remove(&id)
    }

    /// Id of the running process.
    ///
    /// # Panics
    /// Panics before the first dispatch — by then a kernel always has a
    /// current process, so its absence is a bug.
    #[must_use]
    pub fn current(&self) -> ProcessId {
        self.current.expect("no current process")
    }

    #[must_use]
    pub fn current_process(&self) -> &Process {
        &self.table[&self.current()]
    }

    pub fn current_process_mut(&mut self) -> &mut Process {
        let current = self.current();
        self.table.get_mut(&current).expect("current process vanished")
    }

    #[must_use]
    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.table.get(&id)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.table.get_mut(&id)
    }

    #[must_use]
    pub const fn idle(&self) -> ProcessId {
        self.idle
    }

    #[must_use]
    pub fn live_processes(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }
}
