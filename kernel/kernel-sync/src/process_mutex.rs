use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Identity of a lock holder — a process id in the kernel, a thread id in
/// host tests.
pub type HolderId = u32;

/// The mutex's view of the world around it: who is asking, and how to give
/// the CPU away while waiting.
///
/// In the kernel this is backed by the scheduler (`current` process id and
/// cooperative yield); tests back it with OS threads.
pub trait LockWorld {
    /// Identity of the caller.
    fn current_holder(&self) -> HolderId;

    /// Give up the CPU so the current holder can make progress.
    fn relinquish(&self);
}

struct Owner {
    holder: Option<HolderId>,
    depth: u32,
}

/// A reentrant mutex for long critical sections.
///
/// A single lock bit guards the holder/depth bookkeeping; the bit is only
/// ever held for a few instructions. When the mutex itself is contended the
/// loser does not spin — on one CPU that would deadlock against the very
/// holder it is waiting for — it yields through [`LockWorld::relinquish`]
/// and retries.
///
/// At most one process is holder at any instant, and `depth > 0` exactly
/// when a holder is recorded. The same process may re-acquire; release
/// requires as many unlocks as locks.
pub struct ProcessMutex {
    bit: AtomicBool,
    owner: UnsafeCell<Owner>,
}

// Safety: `owner` is only touched while `bit` is held.
unsafe impl Sync for ProcessMutex {}
unsafe impl Send for ProcessMutex {}

impl ProcessMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bit: AtomicBool::new(false),
            owner: UnsafeCell::new(Owner {
                holder: None,
                depth: 0,
            }),
        }
    }

    /// Acquire, yielding to the scheduler while another process holds the
    /// mutex. Reentrant: a repeated acquire by the holder increments the
    /// recursion depth.
    pub fn lock(&self, world: &impl LockWorld) {
        let me = world.current_holder();
        loop {
            self.grab_bit(world);
            let owner = unsafe { &mut *self.owner.get() };
            match owner.holder {
                None => {
                    owner.holder = Some(me);
                    owner.depth = 1;
                    self.drop_bit();
                    return;
                }
                Some(holder) if holder == me => {
                    owner.depth += 1;
                    self.drop_bit();
                    return;
                }
                Some(_) => {
                    self.drop_bit();
                    world.relinquish();
                }
            }
        }
    }

    /// Release one level of recursion.
    ///
    /// # Panics
    /// Panics if the caller is not the holder or the depth is already zero.
    pub fn unlock(&self, world: &impl LockWorld) {
        let me = world.current_holder();
        self.grab_bit(world);
        let owner = unsafe { &mut *self.owner.get() };
        assert!(owner.depth > 0, "unlocking a mutex that is not locked");
        assert!(
            owner.holder == Some(me),
            "unlock by {me}, but mutex is held by {:?}",
            owner.holder,
        );
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.holder = None;
        }
        self.drop_bit();
    }

    /// Release one level if — and only if — the caller holds the mutex.
    ///
    /// For error and early-return paths that may or may not have taken the
    /// lock. Returns whether anything was released.
    pub fn unlock_if_locked(&self, world: &impl LockWorld) -> bool {
        let me = world.current_holder();
        self.grab_bit(world);
        let owner = unsafe { &mut *self.owner.get() };
        let released = if owner.holder == Some(me) && owner.depth > 0 {
            owner.depth -= 1;
            if owner.depth == 0 {
                owner.holder = None;
            }
            true
        } else {
            false
        };
        self.drop_bit();
        released
    }

    /// Whether some process currently holds the mutex. Racy by nature;
    /// diagnostic use only.
    #[must_use]
    pub fn is_locked(&self, world: &impl LockWorld) -> bool {
        self.grab_bit(world);
        let held = unsafe { &*self.owner.get() }.depth > 0;
        self.drop_bit();
        held
    }

    fn grab_bit(&self, world: &impl LockWorld) {
        while self
            .bit
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            world.relinquish();
        }
    }

    fn drop_bit(&self) {
        self.bit.store(false, Ordering::Release);
    }
}

impl Default for ProcessMutex {
    fn default() -> Self {
        Self::new()
    }
}
