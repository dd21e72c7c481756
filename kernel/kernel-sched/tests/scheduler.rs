//! Policy-level scheduler tests: a simulated machine drives
//! `prepare_switch` the way the dispatch layer would, with plain function
//! predicates standing in for blocked I/O.

use kernel_addresses::VirtualAddress;
use kernel_sched::{
    BlockOutcome, BlockStart, Process, ProcessId, ProcessSpace, ProcessState, Scheduler,
    StackRange,
};
use std::sync::atomic::{AtomicBool, Ordering};

fn stack() -> StackRange {
    StackRange {
        base: VirtualAddress::new(0xc900_0000),
        size: 32 * 1024,
    }
}

fn kernel_process(id: u32) -> Process {
    Process::new(
        ProcessId(id),
        ProcessId(0),
        ProcessId(0),
        ProcessSpace::Kernel,
        stack(),
    )
}

fn scheduler_with(ids: &[u32]) -> Scheduler {
    let mut sched = Scheduler::new(kernel_process(0));
    for &id in ids {
        sched.register(kernel_process(id));
    }
    sched
}

fn flag_is_set(data: usize) -> bool {
    unsafe { &*(data as *const AtomicBool) }.load(Ordering::Relaxed)
}

fn never(_: usize) -> bool {
    false
}

/// Drive switches until `id` is the current process.
fn run_until_current(sched: &mut Scheduler, id: ProcessId) {
    for _ in 0..64 {
        if sched.prepare_switch(true).next == id {
            return;
        }
    }
    panic!("{id} never became current");
}

#[test]
fn fifo_dispatch_cycles_in_registration_order() {
    let mut sched = scheduler_with(&[1, 2, 3]);

    let mut order = Vec::new();
    for _ in 0..9 {
        order.push(sched.prepare_switch(true).next.0);
    }
    assert_eq!(order, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
}

#[test]
fn empty_queue_falls_back_to_the_idle_process() {
    let mut sched = scheduler_with(&[]);

    let d = sched.prepare_switch(true);
    assert_eq!(d.next, sched.idle());
    // idle is never requeued, so it stays current by default
    let d = sched.prepare_switch(true);
    assert_eq!(d.previous, Some(sched.idle()));
    assert_eq!(d.next, sched.idle());
    assert_eq!(sched.ready_len(), 0);
}

#[test]
fn yield_without_requeue_parks_the_process() {
    let mut sched = scheduler_with(&[1, 2]);

    assert_eq!(sched.prepare_switch(true).next, ProcessId(1));
    // process 1 yields itself out of the queue
    assert_eq!(sched.prepare_switch(false).next, ProcessId(2));
    // only process 2 cycles now
    assert_eq!(sched.prepare_switch(true).next, ProcessId(2));
    assert_eq!(
        sched.process(ProcessId(1)).unwrap().state(),
        ProcessState::Runnable,
    );

    // an external enqueue brings it back
    sched.enqueue(ProcessId(1));
    assert_eq!(sched.prepare_switch(true).next, ProcessId(1));
}

#[test]
fn blocking_suspends_until_the_predicate_holds() {
    let mut sched = scheduler_with(&[1, 2]);
    let flag = AtomicBool::new(false);
    let data = &raw const flag as usize;

    run_until_current(&mut sched, ProcessId(1));
    assert_eq!(sched.block_current(flag_is_set, data), BlockStart::Blocked);
    assert_eq!(sched.prepare_switch(false).next, ProcessId(2));

    // while the flag is down, only process 2 runs
    for _ in 0..3 {
        assert_eq!(sched.prepare_switch(true).next, ProcessId(2));
        assert_eq!(
            sched.process(ProcessId(1)).unwrap().state(),
            ProcessState::Blocked,
        );
    }

    // external actor raises the flag; the next yield promotes process 1
    flag.store(true, Ordering::Relaxed);
    run_until_current(&mut sched, ProcessId(1));
    assert_eq!(sched.finish_block(), BlockOutcome::Completed);
}

#[test]
fn already_true_predicate_never_blocks() {
    let mut sched = scheduler_with(&[1]);
    let flag = AtomicBool::new(true);

    run_until_current(&mut sched, ProcessId(1));
    assert_eq!(
        sched.block_current(flag_is_set, &raw const flag as usize),
        BlockStart::Ready,
    );
    assert_eq!(
        sched.current_process().state(),
        ProcessState::Running,
        "caller keeps running without yielding",
    );
}

#[test]
fn pending_signal_preempts_the_block_entirely() {
    let mut sched = scheduler_with(&[1]);

    run_until_current(&mut sched, ProcessId(1));
    sched.deliver_signal(ProcessId(1), 15);
    assert_eq!(
        sched.block_current(never, 0),
        BlockStart::Interrupted,
        "a signal pending at block time means no suspension at all",
    );
    assert_eq!(sched.current_process().state(), ProcessState::Running);
}

#[test]
fn signal_racing_the_yield_wakes_the_blocker_in_place() {
    // The signal lands after the process marks itself blocked but before
    // its yield runs; the yield's own wake scan promotes it again.
    let mut sched = scheduler_with(&[1]);

    run_until_current(&mut sched, ProcessId(1));
    assert_eq!(sched.block_current(never, 0), BlockStart::Blocked);
    sched.deliver_signal(ProcessId(1), 9);

    let d = sched.prepare_switch(false);
    assert_eq!(d.previous, Some(ProcessId(1)));
    assert_eq!(d.next, ProcessId(1), "woken during its own yield");
    assert_eq!(sched.finish_block(), BlockOutcome::Interrupted);
}

#[test]
fn pending_signal_interrupts_a_block() {
    let mut sched = scheduler_with(&[1, 2]);

    run_until_current(&mut sched, ProcessId(1));
    assert_eq!(sched.block_current(never, 0), BlockStart::Blocked);
    assert_eq!(sched.prepare_switch(false).next, ProcessId(2));

    assert!(sched.deliver_signal(ProcessId(1), 2));
    run_until_current(&mut sched, ProcessId(1));
    assert_eq!(
        sched.finish_block(),
        BlockOutcome::Interrupted,
        "a signal wake must report interruption even though the predicate never held",
    );
    assert!(sched.current_process().has_pending_signals());
}

#[test]
fn simultaneous_wakes_promote_in_id_order() {
    let mut sched = scheduler_with(&[1, 2, 3]);
    let flag = AtomicBool::new(false);
    let data = &raw const flag as usize;

    // block 2 first, then 1 — wake order must still be 1 before 2
    run_until_current(&mut sched, ProcessId(2));
    assert_eq!(sched.block_current(flag_is_set, data), BlockStart::Blocked);
    sched.prepare_switch(false);
    run_until_current(&mut sched, ProcessId(1));
    assert_eq!(sched.block_current(flag_is_set, data), BlockStart::Blocked);
    sched.prepare_switch(false);

    flag.store(true, Ordering::Relaxed);
    // process 3 is current; both sleepers are promoted during the next
    // yield's blocked scan, and 1 must enter the queue before 2 even
    // though 2 blocked first
    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(sched.prepare_switch(true).next.0);
    }
    assert_eq!(order, vec![1, 2, 3], "id order among simultaneous wakes");
}

#[test]
fn exit_reaps_through_dying_and_dead() {
    let mut sched = scheduler_with(&[1, 2]);

    run_until_current(&mut sched, ProcessId(1));
    sched.exit_current();
    assert_eq!(
        sched.process(ProcessId(1)).unwrap().state(),
        ProcessState::Dying,
    );
    assert!(
        sched.reap(ProcessId(1)).is_none(),
        "cannot reap before the switch leaves its stack",
    );

    let d = sched.prepare_switch(false);
    assert_eq!(d.next, ProcessId(2));
    assert_eq!(
        sched.process(ProcessId(1)).unwrap().state(),
        ProcessState::Dead,
    );

    let corpse = sched.reap(ProcessId(1)).expect("dead process is reapable");
    assert_eq!(corpse.id(), ProcessId(1));
    assert!(sched.process(ProcessId(1)).is_none());
    assert_eq!(sched.live_processes(), 2); // idle + process 2
}

#[test]
fn tick_accounting_attributes_time_to_the_current_process() {
    let mut sched = scheduler_with(&[1]);

    run_until_current(&mut sched, ProcessId(1));
    sched.account_tick(true);
    sched.account_tick(true);
    sched.account_tick(false);

    let p = sched.current_process();
    assert_eq!(p.kernel_ticks, 2);
    assert_eq!(p.user_ticks, 1);
}

#[test]
fn pid_allocation_is_monotonic() {
    let mut sched = scheduler_with(&[]);
    let a = sched.allocate_pid();
    let b = sched.allocate_pid();
    assert!(b > a);
    assert!(a > sched.idle());
}

#[test]
#[should_panic(expected = "registered twice")]
fn duplicate_registration_is_fatal() {
    let mut sched = scheduler_with(&[1]);
    sched.register(kernel_process(1));
}

#[test]
#[should_panic(expected = "idle process must never block")]
fn blocking_the_idle_process_is_fatal() {
    let mut sched = scheduler_with(&[]);
    sched.prepare_switch(true); // idle becomes current
    let _ = sched.block_current(never, 0);
}

#[test]
#[should_panic(expected = "no current process")]
fn current_before_first_dispatch_is_fatal() {
    let sched = scheduler_with(&[1]);
    let _ = sched.current();
}
