//! Mutexes
//!
//! A synchronisation object used to allow multiple threads to serialise
//! their access to shared data. The thread that has locked a mutex becomes
//! its owner and remains the owner until that same thread unlocks it.
//!
//! The behaviour on relock and on unlock-when-not-owner depends on the
//! mutex type:
//!
//! | Type         | Relock           | Unlock when not owner |
//! | ------------ | ---------------- | --------------------- |
//! | `Normal`     | deadlock         | `NotRecoverable`      |
//! | `Errorcheck` | `Deadlock` error | `PermissionDenied`    |
//! | `Recursive`  | recursion count  | `PermissionDenied`    |
//!
//! The locking protocol controls how ownership interacts with scheduling:
//! `Inherit` boosts the owner to the highest priority among the waiters
//! (transitively, along chains of inherit-protocol mutexes), `Protect`
//! raises the owner to the mutex's priority ceiling for as long as it
//! holds the lock.
//!
//! A `Robust` mutex survives the termination of its owner: the next
//! acquirer is told about the abandonment through the `OwnerDead` result
//! and can repair the protected state and call [`Mutex::consistent`]. If
//! it unlocks without doing so, the mutex becomes permanently unusable and
//! every subsequent operation fails with `NotRecoverable`.
use core::fmt;

use crate::{
    error::{
        ConsistentMutexError, LockCoreError, LockMutexError, ResetMutexError,
        SetPrioCeilingError, TimedLockMutexError, TryLockMutexError, UnlockMutexError,
        WaitError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard},
    sched,
    thread::{self, priority, ThreadRef, ThreadSt},
    timeout::{Clock, Duration},
    utils::intrusive_list::Ref,
    wait::{self, QueueOrder, WaitPayload, WaitQueue},
    KernelObject, KernelTraits,
};

/// A reference to a [`Mutex`]. The pointee is valid because the blocking
/// operations require `&'static self`.
pub(crate) type MutexRef<Traits> = Ref<Mutex<Traits>>;

/// The behaviour of relock and unlock-when-not-owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// No relock detection: relocking deadlocks the caller.
    Normal,
    /// Relock and foreign unlock are reported as errors.
    Errorcheck,
    /// Relock increments a recursion count, up to the configured maximum.
    Recursive,
    /// The implementation-chosen default; behaves as [`MutexType::Normal`].
    Default,
}

/// The scheduling protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Ownership does not affect the owner's priority.
    None,
    /// Priority inheritance: a contended owner runs at the highest
    /// priority among the waiters.
    Inherit,
    /// Priority ceiling: the owner runs at least at the mutex's ceiling
    /// for as long as it holds the lock.
    Protect,
}

/// The behaviour when the owning thread terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Robustness {
    /// No notification; the mutex becomes permanently unusable when its
    /// owner dies holding it.
    Stalled,
    /// The next acquirer observes `OwnerDead` and may mark the state
    /// consistent again.
    Robust,
}

/// The construction-time attributes of a mutex.
pub struct Attributes<Traits: KernelTraits> {
    name: &'static str,
    type_: MutexType,
    protocol: Protocol,
    robustness: Robustness,
    max_count: u16,
    priority_ceiling: u8,
    clock: Option<&'static Clock<Traits>>,
}

impl<Traits: KernelTraits> Attributes<Traits> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            type_: MutexType::Normal,
            protocol: Protocol::None,
            robustness: Robustness::Stalled,
            max_count: u16::MAX,
            priority_ceiling: priority::HIGHEST,
            clock: None,
        }
    }

    pub const fn type_(mut self, type_: MutexType) -> Self {
        self.type_ = type_;
        self
    }

    pub const fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub const fn robustness(mut self, robustness: Robustness) -> Self {
        self.robustness = robustness;
        self
    }

    /// The upper limit of recursion for a [`MutexType::Recursive`] mutex.
    /// Further attempts to lock the mutex fail with `Again`.
    pub const fn max_count(mut self, max_count: u16) -> Self {
        self.max_count = max_count;
        self
    }

    /// The minimum priority level at which the critical section guarded by
    /// a [`Protocol::Protect`] mutex executes.
    pub const fn priority_ceiling(mut self, ceiling: u8) -> Self {
        self.priority_ceiling = ceiling;
        self
    }

    /// The clock timed locks on this mutex run against. Defaults to the
    /// systick clock.
    pub const fn clock(mut self, clock: &'static Clock<Traits>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// A mutual-exclusion lock with optional recursion, priority
/// inheritance/ceiling, and robustness.
pub struct Mutex<Traits: KernelTraits> {
    name: &'static str,
    type_: MutexType,
    protocol: Protocol,
    robustness: Robustness,
    max_count: u16,

    ceiling: CpuLockCell<Traits, u8>,

    /// The thread that currently owns the mutex lock.
    owner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// The recursion count; `owner == None ⇔ count == 0`.
    count: CpuLockCell<Traits, u16>,

    /// The owner's priority at acquisition time, recorded for the
    /// protocol bookkeeping.
    owner_prio: CpuLockCell<Traits, u8>,

    /// The boost this mutex currently applies to its owner, or
    /// [`priority::NONE`] when no boost is in effect.
    boosted_prio: CpuLockCell<Traits, u8>,

    /// Cleared when a robust owner terminates while holding the lock; set
    /// back by [`Mutex::consistent`].
    consistent: CpuLockCell<Traits, bool>,

    /// Cleared when an inconsistent mutex is unlocked without a
    /// [`Mutex::consistent`] call; all later operations fail with
    /// `NotRecoverable`.
    recoverable: CpuLockCell<Traits, bool>,

    /// Threads blocked in `lock`, in priority order.
    wait_queue: WaitQueue<Traits>,

    /// The next element in the singly linked list headed by
    /// `ThreadCb::last_mutex_held`, containing all mutexes currently held
    /// by the owning thread.
    prev_mutex_held: CpuLockCell<Traits, Option<MutexRef<Traits>>>,

    clock: Option<&'static Clock<Traits>>,
}

// Safety: All mutable state is behind `CpuLockCell`s.
unsafe impl<Traits: KernelTraits> Send for Mutex<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for Mutex<Traits> {}

impl<Traits: KernelTraits> KernelObject for Mutex<Traits> {
    fn name(&self) -> &'static str {
        self.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("type_", &self.type_)
            .field("protocol", &self.protocol)
            .field("robustness", &self.robustness)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    pub const fn new(attr: Attributes<Traits>) -> Self {
        Self {
            name: attr.name,
            type_: attr.type_,
            protocol: attr.protocol,
            robustness: attr.robustness,
            max_count: if matches!(attr.type_, MutexType::Recursive) {
                attr.max_count
            } else {
                1
            },
            ceiling: CpuLockCell::new(attr.priority_ceiling),
            owner: CpuLockCell::new(None),
            count: CpuLockCell::new(0),
            owner_prio: CpuLockCell::new(priority::NONE),
            boosted_prio: CpuLockCell::new(priority::NONE),
            consistent: CpuLockCell::new(true),
            recoverable: CpuLockCell::new(true),
            wait_queue: WaitQueue::new(QueueOrder::ThreadPriority),
            prev_mutex_held: CpuLockCell::new(None),
            clock: attr.clock,
        }
    }

    fn self_ref(&'static self) -> MutexRef<Traits> {
        Ref::new(self)
    }

    /// Whether the mutex is currently owned by some thread.
    pub fn is_locked(&'static self) -> bool {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.owner.get(&*lock).is_some()
    }

    /// The current priority ceiling.
    pub fn prio_ceiling(&'static self) -> u8 {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.ceiling.get(&*lock)
    }

    /// Lock the mutex, changing the priority ceiling.
    ///
    /// On acquiring the mutex this changes the ceiling, then releases the
    /// mutex again. The previous ceiling is returned. Fails with `Invalid`
    /// if the calling thread's priority exceeds the new ceiling while the
    /// lock is held.
    pub fn set_prio_ceiling(&'static self, ceiling: u8) -> Result<u8, SetPrioCeilingError> {
        if ceiling == priority::NONE || ceiling >= priority::ERROR {
            return Err(SetPrioCeilingError::Invalid);
        }

        match self.lock() {
            Ok(()) => {}
            Err(e @ LockMutexError::OwnerDead) => {
                // Acquired, but the protected state is inconsistent; this
                // operation is not the place to repair it.
                let _ = self.unlock();
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        {
            let mut lock = klock::lock_cpu::<Traits>().unwrap();
            let current = Traits::state().running_thread.get(&*lock).unwrap();
            // Safety: `current` is registry-held
            let current_priority =
                unsafe { current.0.as_ref() }.effective_priority.get(&*lock);
            if current_priority > ceiling {
                drop(lock);
                self.unlock().unwrap();
                return Err(SetPrioCeilingError::Invalid);
            }
            let old = self.ceiling.replace(&mut *lock, ceiling);
            drop(lock);
            self.unlock().unwrap();
            Ok(old)
        }
    }

    /// The core locking algorithm, run under the CPU Lock.
    ///
    /// `Ok(...)` reports whether ownership was obtained; `Err(_)` is a
    /// definitive failure. On `WouldBlock` with the inherit protocol, the
    /// owner has been boosted to the caller's priority.
    fn try_lock_core(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        current: ThreadRef<Traits>,
    ) -> Result<TryLockCore, LockCoreError> {
        if !self.recoverable.get(&**lock) {
            return Err(LockCoreError::NotRecoverable);
        }

        // Safety: `current` is registry-held
        let current_cb = unsafe { current.0.as_ref() };

        let saved_owner = self.owner.get(&**lock);

        // First lock.
        if saved_owner.is_none() {
            if self.protocol == Protocol::Protect
                && current_cb.effective_priority.get(&**lock) > self.ceiling.get(&**lock)
            {
                return Err(LockCoreError::Invalid);
            }

            // If the mutex has no owner, own it.
            self.owner.replace(&mut **lock, Some(current));
            self.count.replace(&mut **lock, 1);

            // Count the number of mutexes acquired by the thread and push
            // this one onto its held list.
            current_cb
                .acquired_mutexes
                .replace_with(&mut **lock, |n| *n += 1);
            let prev = current_cb
                .last_mutex_held
                .replace(&mut **lock, Some(self.self_ref()));
            self.prev_mutex_held.replace(&mut **lock, prev);

            match self.protocol {
                Protocol::None => {}
                Protocol::Inherit => {
                    // Save the owner priority, in case a temporary boost
                    // will be applied later.
                    self.owner_prio
                        .replace(&mut **lock, current_cb.assigned_priority.get(&**lock));
                }
                Protocol::Protect => {
                    // Save the owner priority and boost to the ceiling.
                    let owner_prio = current_cb.effective_priority.get(&**lock);
                    self.owner_prio.replace(&mut **lock, owner_prio);
                    let ceiling = self.ceiling.get(&**lock);
                    if ceiling > owner_prio {
                        self.boosted_prio.replace(&mut **lock, ceiling);
                        thread::set_effective_priority_and_reposition(lock, current, ceiling);
                    }
                }
            }

            return if self.robustness == Robustness::Robust && !self.consistent.get(&**lock) {
                Ok(TryLockCore::AcquiredOwnerDead)
            } else {
                Ok(TryLockCore::Acquired)
            };
        }

        // Relock.
        if saved_owner == Some(current) {
            return match self.type_ {
                MutexType::Recursive => {
                    let count = self.count.get(&**lock);
                    if count >= self.max_count {
                        // The recursive mutex reached its limit.
                        Err(LockCoreError::Again)
                    } else {
                        self.count.replace(&mut **lock, count + 1);
                        Ok(TryLockCore::Acquired)
                    }
                }
                // Recursive locks do not block, but return an error.
                MutexType::Errorcheck => Err(LockCoreError::Deadlock),
                // The caller will deadlock on itself by waiting.
                MutexType::Normal | MutexType::Default => Ok(TryLockCore::WouldBlock),
            };
        }

        // Try to lock when not owner.
        if self.protocol == Protocol::Inherit {
            let priority = current_cb.effective_priority.get(&**lock);
            let owner = saved_owner.unwrap();
            // Safety: the owner is registry-held
            if priority > unsafe { owner.0.as_ref() }.effective_priority.get(&**lock) {
                self.boosted_prio.replace(&mut **lock, priority);
                boost_owner_chain(lock, owner, priority);
            }
        }

        Ok(TryLockCore::WouldBlock)
    }

    /// If the mutex is free, lock it. Otherwise block until it becomes
    /// available.
    ///
    /// `Err(OwnerDead)` still grants ownership: the previous owner of this
    /// robust mutex terminated while holding it, and the caller should
    /// repair the protected state and call [`Mutex::consistent`].
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_waitable_context::<Traits>(&mut lock)?;

        let current = Traits::state().running_thread.get(&*lock).unwrap();

        loop {
            match self.try_lock_core(&mut lock, current)? {
                TryLockCore::Acquired => return Ok(()),
                TryLockCore::AcquiredOwnerDead => return Err(LockMutexError::OwnerDead),
                TryLockCore::WouldBlock => {}
            }

            // The mutex is unavailable; wait until the owner releases it,
            // then retry from the top. The wake-upper does not transfer
            // ownership.
            match self
                .wait_queue
                .wait(&mut lock, WaitPayload::Mutex(self.self_ref()))
            {
                Ok(_) => {}
                Err(WaitError::Interrupted) => return Err(LockMutexError::Interrupted),
            }
        }
    }

    /// Try to lock the mutex as [`Mutex::lock`], returning immediately
    /// with `WouldBlock` if it is currently locked by any thread
    /// (including the caller of a non-recursive mutex).
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_thread_context::<Traits>()?;

        let current = Traits::state().running_thread.get(&*lock).unwrap();

        match self.try_lock_core(&mut lock, current)? {
            TryLockCore::Acquired => Ok(()),
            TryLockCore::AcquiredOwnerDead => Err(TryLockMutexError::OwnerDead),
            TryLockCore::WouldBlock => Err(TryLockMutexError::WouldBlock),
        }
    }

    /// Lock the mutex as [`Mutex::lock`], except that the wait is
    /// terminated with `TimedOut` when the timeout expires.
    ///
    /// The duration is measured against the clock given in the attributes.
    /// As a consequence of the priority inheritance rules, when a timed
    /// wait is terminated by its timeout the boost applied to the owner is
    /// recomputed to reflect that the caller is no longer waiting.
    pub fn timed_lock(&'static self, duration: Duration) -> Result<(), TimedLockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_waitable_context::<Traits>(&mut lock)?;

        let current = Traits::state().running_thread.get(&*lock).unwrap();

        let clock = self.clock();
        let deadline = clock.now_locked(&mut lock) + duration as crate::Tick;

        loop {
            match self.try_lock_core(&mut lock, current)? {
                TryLockCore::Acquired => return Ok(()),
                TryLockCore::AcquiredOwnerDead => return Err(TimedLockMutexError::OwnerDead),
                TryLockCore::WouldBlock => {}
            }

            // The deadline is absolute: a wait that is woken and retried
            // does not start over.
            let now = clock.now_locked(&mut lock);
            if now >= deadline {
                self.recompute_boost_after_waiter_left(&mut lock);
                return Err(TimedLockMutexError::TimedOut);
            }
            let remaining = (deadline - now) as Duration;

            match self.wait_queue.wait_timeout(
                &mut lock,
                WaitPayload::Mutex(self.self_ref()),
                clock,
                remaining,
            ) {
                Ok(_) => {}
                Err(e) => {
                    // This thread is no longer among the waiters; a boost
                    // it contributed must not outlive its wait.
                    self.recompute_boost_after_waiter_left(&mut lock);
                    return Err(match e {
                        WaitTimeoutError::Interrupted => TimedLockMutexError::Interrupted,
                        WaitTimeoutError::TimedOut => TimedLockMutexError::TimedOut,
                    });
                }
            }
        }
    }

    /// Unlock the mutex.
    ///
    /// For a recursive mutex the lock is released when the recursion count
    /// returns to zero. If threads are blocked on the mutex, the
    /// highest-priority waiter (FIFO among equals) is woken and competes
    /// for the ownership.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_thread_context::<Traits>()?;

        let current = Traits::state().running_thread.get(&*lock).unwrap();

        if self.owner.get(&*lock) != Some(current) {
            // Not owner, or not locked.
            return if self.type_ == MutexType::Errorcheck
                || self.type_ == MutexType::Recursive
                || self.robustness == Robustness::Robust
            {
                Err(UnlockMutexError::PermissionDenied)
            } else {
                // Normal non-robust mutexes owned by other threads have
                // undefined behaviour; report the strongest error we have.
                Err(UnlockMutexError::NotRecoverable)
            };
        }

        let count = self.count.get(&*lock);
        if self.type_ == MutexType::Recursive && count > 1 {
            self.count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        self.finish_release(&mut lock, current);

        // The woken waiter may preempt us, and dropping a boost may lower
        // us below another ready thread.
        sched::unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Release the lock under an existing critical section, without the
    /// recursive-decrement path and without the preemption check. Used by
    /// the condition variable, which must release the mutex and enqueue
    /// itself atomically.
    pub(crate) fn unlock_locked(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
    ) -> Result<(), UnlockMutexError> {
        let current = Traits::state()
            .running_thread
            .get(&**lock)
            .ok_or(UnlockMutexError::PermissionDenied)?;

        if self.owner.get(&**lock) != Some(current) {
            return Err(UnlockMutexError::PermissionDenied);
        }

        if self.type_ == MutexType::Recursive && self.count.get(&**lock) > 1 {
            // Waiting on a condition variable with outstanding recursion
            // levels would block with the mutex still held.
            return Err(UnlockMutexError::PermissionDenied);
        }

        self.finish_release(lock, current);
        Ok(())
    }

    /// Full release: drop the ownership record, then wake the next waiter
    /// (or, for a still-inconsistent robust mutex, brick the mutex and
    /// wake everyone).
    fn finish_release(&'static self, lock: &mut CpuLockGuard<Traits>, owner: ThreadRef<Traits>) {
        self.release_ownership(lock, owner);

        // An inconsistent robust mutex released without a `consistent`
        // call becomes permanently unusable.
        if self.robustness == Robustness::Robust && !self.consistent.get(&**lock) {
            self.recoverable.replace(&mut **lock, false);
            // Wake everyone so they observe `NotRecoverable`.
            self.wait_queue.wake_up_all(lock);
        } else {
            self.wait_queue.wake_up_one(lock);
        }
    }

    /// Remove the ownership record: held list, acquisition count, boost.
    fn release_ownership(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        owner: ThreadRef<Traits>,
    ) {
        // Safety: `owner` is registry-held
        let owner_cb = unsafe { owner.0.as_ref() };

        remove_from_held_list(lock, owner, self.self_ref());
        owner_cb
            .acquired_mutexes
            .replace_with(&mut **lock, |n| *n -= 1);

        self.owner.replace(&mut **lock, None);
        self.count.replace(&mut **lock, 0);

        if self.boosted_prio.replace(&mut **lock, priority::NONE) != priority::NONE {
            // Lower the owner back to what the remaining held mutexes
            // dictate.
            let assigned = owner_cb.assigned_priority.get(&**lock);
            let effective = evaluate_thread_effective_priority(lock, owner, assigned);
            thread::set_effective_priority_and_reposition(lock, owner, effective);
        }
    }

    /// Recompute `boosted_prio` from the remaining waiters after one
    /// waiter left the queue without acquiring the mutex. Only meaningful
    /// for the inherit protocol, where the boost is derived from the
    /// waiters.
    fn recompute_boost_after_waiter_left(&'static self, lock: &mut CpuLockGuard<Traits>) {
        if self.protocol != Protocol::Inherit
            || self.boosted_prio.get(&**lock) == priority::NONE
        {
            return;
        }

        let max_waiter = self.wait_queue.max_waiter_priority(lock);
        self.boosted_prio
            .replace(&mut **lock, max_waiter.unwrap_or(priority::NONE));

        if let Some(owner) = self.owner.get(&**lock) {
            // Safety: the owner is registry-held
            let assigned = unsafe { owner.0.as_ref() }.assigned_priority.get(&**lock);
            let effective = evaluate_thread_effective_priority(lock, owner, assigned);
            thread::set_effective_priority_and_reposition(lock, owner, effective);
        }
    }

    /// Mark the state protected by a robust mutex as consistent again.
    ///
    /// Valid only on a robust mutex whose current holder acquired it with
    /// the `OwnerDead` result.
    pub fn consistent(&'static self) -> Result<(), ConsistentMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.robustness != Robustness::Robust || self.consistent.get(&*lock) {
            return Err(ConsistentMutexError::Invalid);
        }

        let current = Traits::state().running_thread.get(&*lock);
        if self.owner.get(&*lock) != current || current.is_none() {
            return Err(ConsistentMutexError::Invalid);
        }

        self.consistent.replace(&mut *lock, true);
        Ok(())
    }

    /// Return the mutex to the initial unlocked state, waking every
    /// waiter.
    pub fn reset(&'static self) -> Result<(), ResetMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if let Some(owner) = self.owner.get(&*lock) {
            self.release_ownership(&mut lock, owner);
        }

        self.consistent.replace(&mut *lock, true);
        self.recoverable.replace(&mut *lock, true);

        self.wait_queue.wake_up_all(&mut lock);

        sched::unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    pub(crate) fn clock(&'static self) -> &'static Clock<Traits> {
        self.clock.unwrap_or(&Traits::state().sysclock)
    }
}

/// The outcome of [`Mutex::try_lock_core`].
enum TryLockCore {
    Acquired,
    AcquiredOwnerDead,
    WouldBlock,
}

/// Boost `thread` (a mutex owner) to `priority`, propagating along the
/// chain of inherit-protocol mutexes if the owner is itself blocked on
/// one.
fn boost_owner_chain<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
    priority: u8,
) {
    let mut thread = thread;

    loop {
        // Safety: `thread` is registry-held
        let cb = unsafe { thread.0.as_ref() };

        if cb.effective_priority.get(&**lock) >= priority {
            break;
        }

        thread::set_effective_priority_and_reposition(lock, thread, priority);

        if cb.st.get(&**lock) != ThreadSt::Waiting {
            break;
        }

        // If the boosted owner is itself waiting on an inherit-protocol
        // mutex, the boost carries over to that mutex's owner.
        let next = wait::with_current_wait_payload(lock, cb, |payload| {
            if let Some(&WaitPayload::Mutex(mref)) = payload {
                // Safety: blocking operations take `&'static Mutex`
                let m = unsafe { &*mref.0.as_ptr() };
                if m.protocol == Protocol::Inherit {
                    return Some(mref);
                }
            }
            None
        });

        let mref = if let Some(m) = next {
            m
        } else {
            break;
        };

        // Safety: blocking operations take `&'static Mutex`
        let m = unsafe { &*mref.0.as_ptr() };
        if m.boosted_prio.get(&**lock) < priority {
            m.boosted_prio.replace(&mut **lock, priority);
        }
        let owner = if let Some(o) = m.owner.get(&**lock) {
            o
        } else {
            break;
        };

        thread = owner;
    }
}

/// Reevaluate a thread's effective priority from its assigned priority and
/// the boosts of every mutex it holds.
pub(crate) fn evaluate_thread_effective_priority<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
    assigned: u8,
) -> u8 {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    let mut effective = assigned;
    let mut maybe_mutex = cb.last_mutex_held.get(&**lock);

    while let Some(mref) = maybe_mutex {
        // Safety: held mutexes are `&'static`
        let m = unsafe { &*mref.0.as_ptr() };
        let boosted = m.boosted_prio.get(&**lock);
        if boosted != priority::NONE && boosted > effective {
            effective = boosted;
        }
        maybe_mutex = m.prev_mutex_held.get(&**lock);
    }

    effective
}

/// Unlink `target` from `thread`'s held-mutex list.
fn remove_from_held_list<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
    target: MutexRef<Traits>,
) {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    // Safety: `target` is `&'static`
    let target_mutex = unsafe { &*target.0.as_ptr() };

    let head = cb.last_mutex_held.get(&**lock);
    if head == Some(target) {
        let next = target_mutex.prev_mutex_held.replace(&mut **lock, None);
        cb.last_mutex_held.replace(&mut **lock, next);
        return;
    }

    let mut cursor = head;
    while let Some(mref) = cursor {
        // Safety: held mutexes are `&'static`
        let m = unsafe { &*mref.0.as_ptr() };
        let next = m.prev_mutex_held.get(&**lock);
        if next == Some(target) {
            let after = target_mutex.prev_mutex_held.replace(&mut **lock, None);
            m.prev_mutex_held.replace(&mut **lock, after);
            return;
        }
        cursor = next;
    }

    unreachable!("mutex is not in the owner's held list");
}

/// Abandon all mutexes held by a terminating thread.
///
/// Robust mutexes are released in the inconsistent state so their next
/// owner observes `OwnerDead`; stalled mutexes become permanently
/// unusable, and their waiters are woken to observe `NotRecoverable`.
///
/// This function may make threads Ready, but doesn't yield the processor.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
) {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    let mut maybe_mutex = cb.last_mutex_held.replace(&mut **lock, None);
    while let Some(mref) = maybe_mutex {
        // Safety: held mutexes are `&'static`
        let m = unsafe { &*mref.0.as_ptr() };
        maybe_mutex = m.prev_mutex_held.replace(&mut **lock, None);

        m.owner.replace(&mut **lock, None);
        m.count.replace(&mut **lock, 0);
        m.boosted_prio.replace(&mut **lock, priority::NONE);

        match m.robustness {
            Robustness::Robust => {
                m.consistent.replace(&mut **lock, false);
                m.wait_queue.wake_up_one(lock);
            }
            Robustness::Stalled => {
                m.recoverable.replace(&mut **lock, false);
                m.wait_queue.wake_up_all(lock);
            }
        }
    }

    cb.acquired_mutexes.replace(&mut **lock, 0);
}
