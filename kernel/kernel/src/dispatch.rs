//! The non-returning half of scheduling: wires a [`Dispatch`] decision to
//! the hardware — FPU save/restore, the CR3 switch, the interrupt stack
//! update, and the register switch itself. x86 only; the policy half in
//! `kernel-sched` is portable and tested on the host.
//!
//! Everything here runs with interrupts disabled. The scheduler lock is
//! released before the context switch: on a single CPU the interrupt
//! guard is the real mutual exclusion, and the resumed process must be
//! able to take the lock again immediately.

use crate::MemoryContext;
use kernel_addresses::VirtualAddress;
use kernel_paging::TableWindows;
use kernel_sched::context::{restore_fpu, save_fpu, switch_context};
use kernel_sched::{BlockOutcome, BlockPredicate, BlockStart, CpuContext, ProcessSpace, Scheduler};
use kernel_sync::{IrqGuard, SpinLock};

/// Hook for the interrupt layer: called with the next process's kernel
/// stack top so ring transitions land on the right stack.
pub type SetInterruptStack = fn(VirtualAddress);

/// The cooperative yield. Saves the calling process's state, picks the
/// next runnable process (idle when none), switches address space, and
/// resumes it. Returns when the caller is next scheduled.
///
/// # Safety
/// CPL 0, valid kernel stacks for every runnable process, and `ctx`
/// matching the active machine configuration.
pub unsafe fn yield_now<W: TableWindows>(
    ctx: &MemoryContext<W>,
    sched: &SpinLock<Scheduler>,
    requeue_current: bool,
    set_interrupt_stack: SetInterruptStack,
) {
    let irq = IrqGuard::new();

    static mut SCRATCH: CpuContext = CpuContext {
        ebx: 0,
        esi: 0,
        edi: 0,
        ebp: 0,
        esp: 0,
        eip: 0,
    };
    let save: *mut CpuContext;
    let restore: *const CpuContext;

    {
        let mut s = sched.lock();
        let decision = s.prepare_switch(requeue_current);

        if let Some(previous) = decision.previous
            && previous != s.idle()
        {
            let p = s.process_mut(previous).expect("previous process vanished");
            unsafe { save_fpu(&mut p.fpu) };
            save = &mut p.context;
        } else {
            // the idle process is always restarted fresh; its state goes
            // to a scratch slot nothing ever restores
            save = unsafe { &raw mut SCRATCH };
        }

        let next = s.process_mut(decision.next).expect("next process vanished");
        set_interrupt_stack(next.kernel_stack().top());
        unsafe { restore_fpu(&next.fpu) };
        match next.space() {
            ProcessSpace::Kernel => unsafe { ctx.kernel_space().activate() },
            ProcessSpace::User(space) => unsafe { space.activate() },
        }
        restore = &next.context;
        // Process records live in the heap-backed table and stay put once
        // inserted; the raw pointers remain valid after the guard drops.
    }

    // Interrupts stay off across the switch; the resumed side's IrqGuard
    // (this same frame, restored) re-enables on drop.
    unsafe { switch_context(save, restore) };
    drop(irq);
}

/// Timer-interrupt entry: account one tick to the current process, then
/// preempt it with a requeueing yield.
///
/// # Safety
/// As [`yield_now`].
pub unsafe fn tick<W: TableWindows>(
    ctx: &MemoryContext<W>,
    sched: &SpinLock<Scheduler>,
    was_in_kernel: bool,
    set_interrupt_stack: SetInterruptStack,
) {
    {
        let _irq = IrqGuard::new();
        sched.lock().account_tick(was_in_kernel);
    }
    unsafe { yield_now(ctx, sched, true, set_interrupt_stack) };
}

/// Block until `predicate(data)` holds or a signal arrives. Returns
/// immediately when the predicate is already true.
///
/// # Safety
/// As [`yield_now`]; additionally `predicate` must be side-effect-free.
pub unsafe fn block<W: TableWindows>(
    ctx: &MemoryContext<W>,
    sched: &SpinLock<Scheduler>,
    predicate: BlockPredicate,
    data: usize,
    set_interrupt_stack: SetInterruptStack,
) -> BlockOutcome {
    {
        let _irq = IrqGuard::new();
        match sched.lock().block_current(predicate, data) {
            BlockStart::Ready => return BlockOutcome::Completed,
            BlockStart::Interrupted => return BlockOutcome::Interrupted,
            BlockStart::Blocked => {}
        }
    }
    unsafe { yield_now(ctx, sched, false, set_interrupt_stack) };
    let _irq = IrqGuard::new();
    sched.lock().finish_block()
}
