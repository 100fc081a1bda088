//! Condition variables
use core::fmt;

use crate::{
    error::{TimedWaitCondvarError, WaitCondvarError, WaitError, WaitTimeoutError},
    klock, mutex, sched,
    timeout::Duration,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelObject, KernelTraits,
};

/// A condition variable, always used together with a [`mutex::Mutex`]
/// held by the calling thread.
pub struct Condvar<Traits: KernelTraits> {
    name: &'static str,
    /// Threads blocked in `wait`, in arrival order.
    wait_queue: WaitQueue<Traits>,
}

// Safety: All mutable state is behind `CpuLockCell`s.
unsafe impl<Traits: KernelTraits> Send for Condvar<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Condvar<Traits> {}

impl<Traits: KernelTraits> KernelObject for Condvar<Traits> {
    fn name(&self) -> &'static str {
        self.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for Condvar<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Condvar<Traits> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            // First come, first served: `notify_one` wakes the
            // longest-waiting thread.
            wait_queue: WaitQueue::new(QueueOrder::Fifo),
        }
    }

    /// Atomically release `mutex` and block until notified, then
    /// re-acquire `mutex` before returning.
    ///
    /// Spurious wakeups are possible; callers re-check their predicate in
    /// a loop.
    pub fn wait(&'static self, mutex: &'static mutex::Mutex<Traits>) -> Result<(), WaitCondvarError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_waitable_context::<Traits>(&mut lock)?;

        // Release the mutex and enqueue under one critical section; a
        // notification cannot slip between the two.
        mutex
            .unlock_locked(&mut lock)
            .map_err(|_| WaitCondvarError::PermissionDenied)?;

        let result = match self.wait_queue.wait(&mut lock, WaitPayload::Condvar) {
            Ok(_) => Ok(()),
            Err(WaitError::Interrupted) => Err(WaitCondvarError::Interrupted),
        };

        drop(lock);

        // The contract is to return with the mutex held, whatever the wait
        // itself returned.
        match mutex.lock() {
            Ok(()) => result,
            Err(_) => result.and(Err(WaitCondvarError::PermissionDenied)),
        }
    }

    /// [`Condvar::wait`] with a timeout, measured against the mutex's
    /// configured clock.
    pub fn timed_wait(
        &'static self,
        mutex: &'static mutex::Mutex<Traits>,
        duration: Duration,
    ) -> Result<(), TimedWaitCondvarError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_waitable_context::<Traits>(&mut lock)?;

        mutex
            .unlock_locked(&mut lock)
            .map_err(|_| TimedWaitCondvarError::PermissionDenied)?;

        let result = match self.wait_queue.wait_timeout(
            &mut lock,
            WaitPayload::Condvar,
            mutex.clock(),
            duration,
        ) {
            Ok(_) => Ok(()),
            Err(WaitTimeoutError::TimedOut) => Err(TimedWaitCondvarError::TimedOut),
            Err(WaitTimeoutError::Interrupted) => Err(TimedWaitCondvarError::Interrupted),
        };

        drop(lock);

        match mutex.lock() {
            Ok(()) => result,
            Err(_) => result.and(Err(TimedWaitCondvarError::PermissionDenied)),
        }
    }

    /// Wake one waiter.
    pub fn notify_one(&'static self) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        if self.wait_queue.wake_up_one(&mut lock) {
            sched::unlock_cpu_and_check_preemption(lock);
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&'static self) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        self.wait_queue.wake_up_all(&mut lock);
        sched::unlock_cpu_and_check_preemption(lock);
    }
}
