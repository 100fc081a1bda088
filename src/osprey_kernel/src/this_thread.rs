//! Operations on the calling thread.
use crate::{
    error::{SleepError, TimedWaitSigError, TrySigError, WaitError, WaitSigError,
            WaitTimeoutError},
    klock, sched,
    thread::{self, poll_sig_core, SigMode, ThreadSt},
    timeout::Duration,
    wait::{self, WaitPayload},
    KernelTraits,
};

/// If another thread of at least equal effective priority is ready,
/// requeue the calling thread at the tail of its priority bucket and
/// switch to the head of the ready queue. Otherwise do nothing. Never
/// suspends.
pub fn yield_now<Traits: KernelTraits>() {
    if !Traits::is_thread_context() {
        return;
    }

    let mut lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        Err(_) => return,
    };

    if Traits::state().sched_lock_depth.get(&*lock) != 0 {
        return;
    }

    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    let my_priority = unsafe { me.0.as_ref() }.effective_priority.get(&*lock);

    match Traits::state().ready_queue.front_priority(&mut lock) {
        Some(front) if front >= my_priority => {}
        _ => return,
    }

    // Go to the back of our priority bucket and let the head take over.
    sched::make_ready(&mut lock, me);
    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };
}

/// Suspend the calling thread for at least `duration` ticks of its
/// configured clock.
pub fn sleep_for<Traits: KernelTraits>(duration: Duration) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_waitable_context::<Traits>(&mut lock)?;

    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    let clock = unsafe { me.0.as_ref() }.clock;

    let deadline = clock.now_locked(&mut lock) + duration as crate::Tick;

    loop {
        let now = clock.now_locked(&mut lock);
        if now >= deadline {
            return Ok(());
        }
        let remaining = (deadline - now) as Duration;

        match wait::wait_no_queue_timeout(&mut lock, WaitPayload::Sleep, clock, remaining) {
            // Resumed early; keep sleeping out the rest of the duration.
            Ok(_) => {}
            Err(WaitTimeoutError::TimedOut) => return Ok(()),
            Err(WaitTimeoutError::Interrupted) => return Err(SleepError::Interrupted),
        }
    }
}

/// Terminate the calling thread with the given exit value. Never returns.
pub fn exit<Traits: KernelTraits>(value: usize) -> ! {
    thread::exit_current_thread::<Traits>(value)
}

/// Block until the calling thread's signal flags satisfy the condition
/// `(mask, mode)`; return the flag value that satisfied it.
///
/// A [`Thread::sig_raise`](crate::thread::Thread::sig_raise) observed
/// before a `sig_wait` that would otherwise block makes it return
/// immediately. With [`SigMode::CLEAR`], the satisfied flags are cleared
/// atomically with the observation.
pub fn sig_wait<Traits: KernelTraits>(
    mask: u32,
    mode: SigMode,
) -> Result<u32, WaitSigError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_waitable_context::<Traits>(&mut lock)?;

    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    let cb = unsafe { me.0.as_ref() };

    loop {
        let mut flags = cb.sig_flags.get(&*lock);
        if let Some(orig) = poll_sig_core(&mut flags, mask, mode) {
            cb.sig_flags.replace(&mut *lock, flags);
            return Ok(orig);
        }

        match wait::wait_no_queue(&mut lock, WaitPayload::Sig { mask, mode }) {
            Ok(_) => {}
            Err(WaitError::Interrupted) => return Err(WaitSigError::Interrupted),
        }
    }
}

/// Check the calling thread's signal flags against `(mask, mode)` without
/// blocking.
pub fn try_sig_wait<Traits: KernelTraits>(
    mask: u32,
    mode: SigMode,
) -> Result<u32, TrySigError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_thread_context::<Traits>()?;

    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    let cb = unsafe { me.0.as_ref() };

    let mut flags = cb.sig_flags.get(&*lock);
    if let Some(orig) = poll_sig_core(&mut flags, mask, mode) {
        cb.sig_flags.replace(&mut *lock, flags);
        Ok(orig)
    } else {
        Err(TrySigError::WouldBlock)
    }
}

/// [`sig_wait`] with a timeout, measured against the calling thread's
/// configured clock.
pub fn timed_sig_wait<Traits: KernelTraits>(
    mask: u32,
    mode: SigMode,
    duration: Duration,
) -> Result<u32, TimedWaitSigError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_waitable_context::<Traits>(&mut lock)?;

    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    let cb = unsafe { me.0.as_ref() };
    let clock = cb.clock;

    let deadline = clock.now_locked(&mut lock) + duration as crate::Tick;

    loop {
        let mut flags = cb.sig_flags.get(&*lock);
        if let Some(orig) = poll_sig_core(&mut flags, mask, mode) {
            cb.sig_flags.replace(&mut *lock, flags);
            return Ok(orig);
        }

        let now = clock.now_locked(&mut lock);
        if now >= deadline {
            return Err(TimedWaitSigError::TimedOut);
        }
        let remaining = (deadline - now) as Duration;

        match wait::wait_no_queue_timeout(
            &mut lock,
            WaitPayload::Sig { mask, mode },
            clock,
            remaining,
        ) {
            Ok(_) => {}
            Err(WaitTimeoutError::TimedOut) => return Err(TimedWaitSigError::TimedOut),
            Err(WaitTimeoutError::Interrupted) => return Err(TimedWaitSigError::Interrupted),
        }
    }
}

/// The state of the calling thread.
pub fn state<Traits: KernelTraits>() -> ThreadSt {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    unsafe { me.0.as_ref() }.st.get(&*lock)
}

/// The calling thread's `errno` cell.
pub fn errno<Traits: KernelTraits>() -> i32 {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    unsafe { me.0.as_ref() }
        .errno_cell()
        .load(core::sync::atomic::Ordering::Relaxed)
}

/// Set the calling thread's `errno` cell.
pub fn set_errno<Traits: KernelTraits>(value: i32) {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    let me = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `me` is registry-held
    unsafe { me.0.as_ref() }
        .errno_cell()
        .store(value, core::sync::atomic::Ordering::Relaxed);
    drop(lock);
}
