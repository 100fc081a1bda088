//! Counting semaphores
use core::fmt;

use crate::{
    error::{
        PostSemaphoreError, TimedWaitSemaphoreError, TryWaitSemaphoreError, WaitError,
        WaitSemaphoreError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard},
    sched,
    timeout::{Clock, Duration},
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelObject, KernelTraits,
};

/// The construction-time attributes of a semaphore.
pub struct Attributes<Traits: KernelTraits> {
    name: &'static str,
    initial: u32,
    max: u32,
    clock: Option<&'static Clock<Traits>>,
}

impl<Traits: KernelTraits> Attributes<Traits> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            initial: 0,
            max: u32::MAX,
            clock: None,
        }
    }

    pub const fn initial(mut self, initial: u32) -> Self {
        self.initial = initial;
        self
    }

    pub const fn max(mut self, max: u32) -> Self {
        self.max = max;
        self
    }

    /// The clock timed waits on this semaphore run against. Defaults to
    /// the systick clock.
    pub const fn clock(mut self, clock: &'static Clock<Traits>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// A counting semaphore.
///
/// [`Semaphore::post`] is interrupt-safe, making this the primitive of
/// choice for signalling thread-level consumers from interrupt handlers.
pub struct Semaphore<Traits: KernelTraits> {
    name: &'static str,
    max: u32,
    count: CpuLockCell<Traits, u32>,
    /// Threads blocked in `wait`, in priority order.
    wait_queue: WaitQueue<Traits>,
    clock: Option<&'static Clock<Traits>>,
}

// Safety: All mutable state is behind `CpuLockCell`s.
unsafe impl<Traits: KernelTraits> Send for Semaphore<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Semaphore<Traits> {}

impl<Traits: KernelTraits> KernelObject for Semaphore<Traits> {
    fn name(&self) -> &'static str {
        self.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    pub const fn new(attr: Attributes<Traits>) -> Self {
        Self {
            name: attr.name,
            max: attr.max,
            count: CpuLockCell::new(attr.initial),
            wait_queue: WaitQueue::new(QueueOrder::ThreadPriority),
            clock: attr.clock,
        }
    }

    /// The current token count.
    pub fn value(&'static self) -> u32 {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.count.get(&*lock)
    }

    /// Release one token, waking the highest-priority waiter if any.
    /// Interrupt-safe.
    pub fn post(&'static self) -> Result<(), PostSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        let count = self.count.get(&*lock);
        if count >= self.max {
            return Err(PostSemaphoreError::Again);
        }
        self.count.replace(&mut *lock, count + 1);

        // The woken thread retries `try_wait_core`; it does not receive
        // the token directly.
        if self.wait_queue.wake_up_one(&mut lock) {
            sched::unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    fn try_wait_core(&'static self, lock: &mut CpuLockGuard<Traits>) -> bool {
        let count = self.count.get(&**lock);
        if count > 0 {
            self.count.replace(&mut **lock, count - 1);
            true
        } else {
            false
        }
    }

    /// Take one token, blocking until one is available.
    pub fn wait(&'static self) -> Result<(), WaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_waitable_context::<Traits>(&mut lock)?;

        loop {
            if self.try_wait_core(&mut lock) {
                return Ok(());
            }

            match self.wait_queue.wait(&mut lock, WaitPayload::Semaphore) {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(WaitSemaphoreError::Interrupted),
            }
        }
    }

    /// Take one token if one is available now.
    pub fn try_wait(&'static self) -> Result<(), TryWaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_thread_context::<Traits>()?;

        if self.try_wait_core(&mut lock) {
            Ok(())
        } else {
            Err(TryWaitSemaphoreError::WouldBlock)
        }
    }

    /// Take one token, giving up after `duration` ticks.
    pub fn timed_wait(&'static self, duration: Duration) -> Result<(), TimedWaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_waitable_context::<Traits>(&mut lock)?;

        let clock = self.clock.unwrap_or(&Traits::state().sysclock);
        let deadline = clock.now_locked(&mut lock) + duration as crate::Tick;

        loop {
            if self.try_wait_core(&mut lock) {
                return Ok(());
            }

            let now = clock.now_locked(&mut lock);
            if now >= deadline {
                return Err(TimedWaitSemaphoreError::TimedOut);
            }
            let remaining = (deadline - now) as Duration;

            match self.wait_queue.wait_timeout(
                &mut lock,
                WaitPayload::Semaphore,
                clock,
                remaining,
            ) {
                Ok(_) => {}
                Err(WaitTimeoutError::TimedOut) => {
                    return Err(TimedWaitSemaphoreError::TimedOut)
                }
                Err(WaitTimeoutError::Interrupted) => {
                    return Err(TimedWaitSemaphoreError::Interrupted)
                }
            }
        }
    }
}
