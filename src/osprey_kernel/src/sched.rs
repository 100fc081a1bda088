//! Scheduler core: dispatcher, critical sections, idle thread.
//!
//! The ready queue itself lives in [`KernelState`]; this module owns the
//! scheduling decisions and the two critical-section disciplines:
//!
//!  - the **interrupt-mask critical section** ([`crate::klock`]), wrapping
//!    every mutation of scheduler-visible state, and
//!  - the **scheduler lock**, a re-entrant preemption disable that keeps
//!    interrupts enabled. Blocking primitives are rejected while it is
//!    held. [`UncriticalSection`] temporarily re-enables preemption inside
//!    a locked region.
use core::marker::PhantomData;

use crate::{
    error::BadContextError,
    klock::{self, CpuLockGuard},
    thread::{self, ThreadCb, ThreadRef, ThreadSt},
    KernelTraits,
};

/// If the current context is not a thread context, return
/// `Err(PermissionDenied)`.
#[inline]
pub(crate) fn expect_thread_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_thread_context() {
        Err(BadContextError::PermissionDenied)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable (thread context, scheduler
/// unlocked), return `Err(PermissionDenied)`.
#[inline]
pub(crate) fn expect_waitable_context<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
) -> Result<(), BadContextError> {
    if !Traits::is_thread_context() || Traits::state().sched_lock_depth.get(&**lock) != 0 {
        Err(BadContextError::PermissionDenied)
    } else {
        Ok(())
    }
}

/// Transition `thread` into the Ready state and link it into the ready
/// queue, behind any thread of equal effective priority.
///
/// This function doesn't do any proper cleanup for a previous state.
pub(crate) fn make_ready<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
) {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };
    cb.st.replace(&mut **lock, ThreadSt::Ready);
    Traits::state().ready_queue.push_back_thread(lock, thread);
}

/// Elect the thread to run next.
///
/// The head of the ready queue takes over if its effective priority is
/// *strictly* higher than the running thread's (equal priorities continue
/// the current thread; `yield` requeues explicitly to get round-robin).
/// If the running thread is no longer in the Running state, the head takes
/// over unconditionally.
pub(crate) fn choose_next_running_thread<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
) {
    let state = Traits::state();

    let prev = state.running_thread.get(&**lock);
    let prev_runnable = prev.filter(|t| {
        // Safety: `t` is registry-held
        unsafe { t.0.as_ref() }.st.get(&**lock) == ThreadSt::Running
    });

    // While the scheduler is locked, a thread in the Running state keeps
    // the processor no matter what is in the ready queue.
    if state.sched_lock_depth.get(&**lock) != 0 && prev_runnable.is_some() {
        return;
    }

    if let Some(p) = prev_runnable {
        // Safety: `p` is registry-held
        let prev_priority = unsafe { p.0.as_ref() }.effective_priority.get(&**lock);
        match state.ready_queue.front_priority(lock) {
            Some(front_priority) if front_priority > prev_priority => {}
            _ => return,
        }
    }

    let next = state.ready_queue.pop_front_thread(lock);

    if let Some(n) = next {
        // Safety: `n` is registry-held
        unsafe { n.0.as_ref() }.st.replace(&mut **lock, ThreadSt::Running);

        if prev == next {
            // The thread re-elected itself (a yield with no competitor
            // left); skip the remaining steps.
            return;
        }
    }

    // `prev` loses the control of the processor.
    if let Some(p) = prev {
        // Safety: `p` is registry-held
        let cb = unsafe { p.0.as_ref() };

        // A blown canary at this point means the outgoing thread has
        // already trashed memory below its stack.
        cb.stack().check_bottom_canary();

        match cb.st.get(&**lock) {
            ThreadSt::Running => {
                // Preempted; go back behind any ready thread of equal
                // priority.
                make_ready(lock, p);
            }
            ThreadSt::Waiting | ThreadSt::Ready | ThreadSt::Terminated => {}
            st => unreachable!("running thread in state {:?}", st),
        }
    }

    state.running_thread.replace(&mut **lock, next);
}

/// Relinquish the CPU Lock. After that, if there's a higher-priority ready
/// thread than the running one, ask the port to reschedule.
///
/// Kernel services that transition a thread into the Ready state call this
/// before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let state = Traits::state();

    // While the scheduler is locked, the check is deferred to the final
    // `unlock`.
    if state.sched_lock_depth.get(&*lock) != 0 {
        return;
    }

    let prev_priority = state
        .running_thread
        .get(&*lock)
        .filter(|t| {
            // Safety: `t` is registry-held
            unsafe { t.0.as_ref() }.st.get(&*lock) == ThreadSt::Running
        })
        .map(|t| {
            // Safety: `t` is registry-held
            unsafe { t.0.as_ref() }.effective_priority.get(&*lock)
        });

    let has_preempting_thread = match (prev_priority, state.ready_queue.front_priority(&mut lock))
    {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(prev), Some(front)) => front > prev,
    };

    // Relinquish the CPU Lock
    drop(lock);

    if has_preempting_thread {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Examine the ready queue and dispatch if a different thread should run.
///
/// Must be called with interrupts enabled and with no scheduler critical
/// section held.
pub fn reschedule<Traits: KernelTraits>() {
    if let Ok(lock) = klock::lock_cpu::<Traits>() {
        unlock_cpu_and_check_preemption(lock);
    }
}

/// Transition from the boot context into the first ready thread.
///
/// Must be called exactly once, with interrupts enabled, after
/// [`PortToKernel::boot`](crate::PortToKernel::boot). Never returns.
pub fn start<Traits: KernelTraits>() -> ! {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    choose_next_running_thread(&mut lock);
    // `dispatch_first_thread` takes over with the CPU Lock held
    core::mem::forget(lock);
    // Safety: CPU Lock active, a thread has been elected
    unsafe { Traits::dispatch_first_thread() }
}

/// Get the thread elected by [`choose_next_running_thread`].
///
/// # Safety
///
/// Must be called with the CPU Lock held by the caller (the port's
/// dispatcher).
pub unsafe fn current_running_thread<Traits: KernelTraits>(
) -> Option<core::ptr::NonNull<ThreadCb<Traits>>> {
    // Safety: The caller has the CPU Lock
    let lock = unsafe { klock::assume_cpu_lock::<Traits>() };
    let running = Traits::state().running_thread.get(&*lock);
    core::mem::forget(lock);
    running.map(|t| t.0)
}

// Scheduler lock
// ---------------------------------------------------------------------------

/// Disable preemption. Re-entrant; each `lock` must be balanced by an
/// [`unlock`].
pub fn lock<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    Traits::state()
        .sched_lock_depth
        .replace_with(&mut *lock, |d| *d += 1);
}

/// Re-enable preemption. When the outermost scheduler lock is released,
/// any reschedule deferred while it was held happens now.
pub fn unlock<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let depth = Traits::state().sched_lock_depth.get(&*lock);
    assert_ne!(depth, 0, "scheduler lock is not held");
    Traits::state()
        .sched_lock_depth
        .replace(&mut *lock, depth - 1);
    if depth == 1 {
        unlock_cpu_and_check_preemption(lock);
    }
}

/// Whether the scheduler is locked.
pub fn locked<Traits: KernelTraits>() -> bool {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    Traits::state().sched_lock_depth.get(&*lock) != 0
}

/// RAII scheduler critical section: preemption is disabled for its
/// lifetime, interrupts stay enabled.
pub struct CriticalSection<Traits: KernelTraits> {
    _not_send: PhantomData<*mut Traits>,
}

impl<Traits: KernelTraits> CriticalSection<Traits> {
    pub fn enter() -> Self {
        lock::<Traits>();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl<Traits: KernelTraits> Drop for CriticalSection<Traits> {
    fn drop(&mut self) {
        unlock::<Traits>();
    }
}

/// RAII *uncritical* section: inside a scheduler critical section,
/// temporarily restore preemption (performing any deferred reschedule on
/// entry). Used when a priority change made under a scheduler lock must be
/// allowed to take effect immediately.
pub struct UncriticalSection<Traits: KernelTraits> {
    saved_depth: u32,
    _not_send: PhantomData<*mut Traits>,
}

impl<Traits: KernelTraits> UncriticalSection<Traits> {
    pub fn enter() -> Self {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        let saved_depth = Traits::state().sched_lock_depth.replace(&mut *lock, 0);
        unlock_cpu_and_check_preemption(lock);
        Self {
            saved_depth,
            _not_send: PhantomData,
        }
    }
}

impl<Traits: KernelTraits> Drop for UncriticalSection<Traits> {
    fn drop(&mut self) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state()
            .sched_lock_depth
            .replace(&mut *lock, self.saved_depth);
    }
}

// Idle thread
// ---------------------------------------------------------------------------

/// Create the idle thread. Called once by
/// [`PortToKernel::boot`](crate::PortToKernel::boot).
pub(crate) fn create_idle_thread<Traits: KernelTraits>() {
    let handle = thread::Thread::<Traits>::build(
        thread::Attributes::new("idle")
            .priority(thread::priority::IDLE)
            .stack_size(Traits::STACK_MIN_SIZE),
        idle_entry::<Traits>,
        0,
    )
    .expect("failed to create the idle thread");

    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    Traits::state()
        .idle_thread
        .replace(&mut *lock, Some(handle.cb_ref()));
    drop(lock);

    // The idle thread never terminates; the handle is not needed.
    drop(handle);
}

/// The idle thread: reap terminated detached threads, then wait for the
/// next interrupt.
fn idle_entry<Traits: KernelTraits>(_: usize) -> usize {
    loop {
        thread::reap_terminated::<Traits>();

        // Safety: CPU Lock inactive, called from the idle thread
        unsafe { Traits::idle_wait() };
    }
}
