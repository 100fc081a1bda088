//! Wait queues and wait objects.
//!
//! A blocked thread is represented by a [`Wait`] object living on its own
//! stack for the duration of the blocking call — the *waiter node* of the
//! public documentation. The node links the thread into at most one
//! primitive's wait queue, and the accompanying timeout node (for timed
//! variants) links it into the clock's expiry list. Both links are made
//! and broken under the interrupt-mask critical section.
use core::fmt;

use crate::{
    error::{
        expect_not_timeout, BadObjectStateError, WaitError, WaitTimeoutError,
    },
    klock::{CpuLockCell, CpuLockGuard},
    mutex, sched,
    thread::{self, SigMode, ThreadCb, ThreadRef, ThreadSt},
    timeout,
    utils::{
        intrusive_list::{self, ListAccessorCell, ListHead, Ref, UnsafeRefPool},
        Init,
    },
    KernelTraits, PortThreading,
};

/// A reference to a [`Wait`].
pub(crate) type WaitRef<Traits> = Ref<Wait<Traits>>;

/// Get a `ListAccessorCell` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            // Safety: All elements are extant because a `Wait` never drops
            //         while it's still in a wait queue.
            unsafe { UnsafeRefPool::new() },
            |wait: &Wait<Traits>| &wait.link,
            $key,
        )
    };
}

/// *A wait object* describing *which thread* is waiting on *what
/// condition*.
///
/// # Lifetime
///
/// This object is constructed by `WaitQueue::wait` on a waiting thread's
/// stack, and only survives until the method returns. This means that
/// `Wait` can expire only when the waiting thread is not waiting anymore.
pub(crate) struct Wait<Traits: PortThreading + KernelTraits> {
    /// The thread that is waiting for something.
    thread: ThreadRef<Traits>,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The containing [`WaitQueue`], if any.
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

// Safety: Accessed only under the CPU Lock.
unsafe impl<Traits: PortThreading> Send for Wait<Traits> {}
unsafe impl<Traits: PortThreading> Sync for Wait<Traits> {}

/// Additional information included in a [`Wait`], specific to waitable
/// object types.
pub(crate) enum WaitPayload<Traits: PortThreading + KernelTraits> {
    /// Waiting to acquire a mutex.
    Mutex(mutex::MutexRef<Traits>),
    /// Waiting for a semaphore token.
    Semaphore,
    /// Waiting for a condition-variable notification.
    Condvar,
    /// Waiting for signal flags. The waker only checks the condition; the
    /// woken wait re-polls (and possibly clears) the flags itself.
    Sig { mask: u32, mode: SigMode },
    /// Waiting for the termination of another thread.
    Join(ThreadRef<Traits>),
    /// Waiting for a timeout (`sleep_for`).
    Sleep,
}

/// A queue of wait objects ([`Wait`]) waiting on a particular waitable
/// object.
pub(crate) struct WaitQueue<Traits: PortThreading> {
    /// Wait objects waiting on the waitable object associated with this
    /// instance of `WaitQueue`. The waiting threads (`Wait::thread`) must
    /// be in the Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, ListHead<WaitRef<Traits>>>,

    order: QueueOrder,
}

/// Specifies the sorting order of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a thread priority order. Threads
    /// with the same priorities follow a FIFO order.
    ThreadPriority,
}

/// The wait state of a thread.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// The wait object describing the ongoing Waiting state of the thread.
    /// Should be `None` iff the thread is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation. Set by a wake-upper.
    /// Returned by [`WaitQueue::wait`].
    wait_result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: CpuLockCell::new(None),
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: KernelTraits> fmt::Debug for ThreadWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadWait").finish_non_exhaustive()
    }
}

/// Register a timeout object to interrupt the current thread with
/// `TimedOut` after the duration specified by `$duration`. The timeout
/// object remains valid throughout the current lexical scope.
///
/// This macro is used inside a blocking operation with timeout.
macro_rules! setup_timeout_wait {
    ($lock:ident, $thread:expr, $clock:expr, $duration:expr) => {
        // Create a timeout object on the current stack.
        let timeout_object =
            new_timeout_object_for_thread::<Traits>(&mut *$lock, $thread, $clock, $duration);
        pin_utils::pin_mut!(timeout_object);

        // Use `TimeoutGuard` to automatically unregister the timeout when
        // leaving the current lexical scope.
        let mut timeout_guard = timeout::TimeoutGuard {
            timeout: timeout_object.as_ref(),
            lock: $lock,
        };
        let $lock = &mut *timeout_guard.lock;

        // Register the timeout object
        timeout::insert_timeout::<Traits>($lock, timeout_guard.timeout);
    };
}

impl<Traits: PortThreading> WaitQueue<Traits> {
    /// Construct a `WaitQueue`.
    pub(crate) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(ListHead::new()),
            order,
        }
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a wait object pertaining to the currently running thread to
    /// `self`, transitioning the thread into the Waiting state.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    pub(crate) fn wait(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result<WaitPayload<Traits>, WaitError> {
        let thread = Traits::state().running_thread.get(&**lock).unwrap();
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        self.wait_inner(lock, &wait).map_err(expect_not_timeout)?;

        Ok(wait.payload)
    }

    /// Insert a wait object pertaining to the currently running thread to
    /// `self`, transitioning the thread into the Waiting state. The
    /// operation will time out after the specified duration.
    ///
    /// The current context must be waitable (this function doesn't check
    /// that). The caller should use `expect_waitable_context` to do that.
    pub(crate) fn wait_timeout(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        payload: WaitPayload<Traits>,
        clock: &'static timeout::Clock<Traits>,
        duration: timeout::Duration,
    ) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
        let thread = Traits::state().running_thread.get(&**lock).unwrap();
        let wait = Wait {
            thread,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        // Configure a timeout
        let mut lock = lock;
        setup_timeout_wait!(lock, thread, clock, duration);

        self.wait_inner(lock, &wait)?;

        Ok(wait.payload)
    }

    /// The core portion of `Self::wait`.
    fn wait_inner(
        &'static self,
        lock: &mut CpuLockGuard<Traits>,
        wait: &Wait<Traits>,
    ) -> Result<(), WaitTimeoutError> {
        let thread = wait.thread;
        let wait_ref = WaitRef::new(wait);

        debug_assert_eq!(
            Some(wait.thread),
            Traits::state().running_thread.get(&**lock)
        );

        // Insert `wait_ref` into `self.waits`
        {
            let mut accessor = wait_queue_accessor!(&self.waits, &mut *lock);
            let insert_at = match self.order {
                QueueOrder::Fifo => {
                    // FIFO order - insert at the back
                    None
                }
                QueueOrder::ThreadPriority => {
                    // Safety: `thread` is registry-held
                    let cur_priority = unsafe { thread.0.as_ref() }
                        .effective_priority
                        .get(&***accessor.cell_key());
                    find_insertion_position_by_priority(cur_priority, &accessor)
                }
            };
            accessor.insert(wait_ref, insert_at);
        }

        // Set `thread.wait.current_wait`
        // Safety: `thread` is registry-held
        unsafe { thread.0.as_ref() }
            .wait
            .current_wait
            .replace(&mut **lock, Some(wait_ref));

        // Transition the thread into Waiting. This statement will complete
        // when the thread is woken up.
        thread::wait_until_woken_up(lock);

        // `wait_ref` should have been removed from the wait queue by a
        // wake-upper
        // Safety: `thread` is registry-held
        let cb = unsafe { thread.0.as_ref() };
        debug_assert!(wait.link.get(&**lock).is_none());
        debug_assert!(cb.wait.current_wait.get(&**lock).is_none());

        // Return the wait result set by the wake-upper. An interruption is
        // consumed by being delivered.
        let result = cb.wait.wait_result.get(&**lock);
        if result == Err(WaitTimeoutError::Interrupted) {
            cb.interrupted.replace(&mut **lock, false);
        }
        result
    }

    /// Reposition `wait` in the wait queue. This is necessary after
    /// changing the waiting thread's priority.
    fn reorder_wait(&'static self, lock: &mut CpuLockGuard<Traits>, wait: &Wait<Traits>) {
        match self.order {
            QueueOrder::Fifo => return,
            QueueOrder::ThreadPriority => {}
        }

        let wait_ref = WaitRef::new(wait);
        let thread = wait.thread;

        let mut accessor = wait_queue_accessor!(&self.waits, &mut *lock);
        accessor.remove(wait_ref);

        // Safety: `thread` is registry-held
        let cur_priority = unsafe { thread.0.as_ref() }
            .effective_priority
            .get(&***accessor.cell_key());
        let insert_at = find_insertion_position_by_priority(cur_priority, &accessor);
        accessor.insert(wait_ref, insert_at);
    }

    /// The highest priority among the waiting threads, or `None` if the
    /// queue is empty.
    pub(crate) fn max_waiter_priority(
        &self,
        lock: &mut CpuLockGuard<Traits>,
    ) -> Option<u8> {
        let accessor = wait_queue_accessor!(&self.waits, &mut *lock);
        let mut max_priority = None;
        for (_, wait) in accessor.iter() {
            // Safety: `wait.thread` is registry-held
            let priority = unsafe { wait.thread.0.as_ref() }
                .effective_priority
                .get(&***accessor.cell_key());
            if max_priority.map_or(true, |m| priority > m) {
                max_priority = Some(priority);
            }
        }
        max_priority
    }

    /// Wake up up to one waiting thread. Returns `true` if it has
    /// successfully woken up a thread.
    ///
    /// This method may make a thread Ready, but doesn't yield the
    /// processor. Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one(&self, lock: &mut CpuLockGuard<Traits>) -> bool {
        let wait_ref = {
            let mut accessor = wait_queue_accessor!(&self.waits, &mut *lock);
            accessor.pop_front()
        };

        let wait_ref = if let Some(wait_ref) = wait_ref {
            wait_ref
        } else {
            return false;
        };

        // Safety: `wait_ref` points to a valid `Wait` because it was in
        // `self.waits` at the beginning of this function call.
        let wait = unsafe { wait_ref.0.as_ref() };

        complete_wait(lock, wait, Ok(()));

        true
    }

    /// Wake up all waiting threads.
    ///
    /// This method may make threads Ready, but doesn't yield the
    /// processor. Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_all(&self, lock: &mut CpuLockGuard<Traits>) {
        while self.wake_up_one(lock) {}
    }
}

/// Find the insertion position for a wait object owned by a thread of
/// effective priority `cur_priority`: behind every waiter of priority
/// `>= cur_priority`, in front of any waiter of strictly lower priority.
fn find_insertion_position_by_priority<'p, 'k, Traits, HeadCell, MapLink>(
    cur_priority: u8,
    accessor: &ListAccessorCell<'p, HeadCell, UnsafeRefPool, MapLink, &'k mut CpuLockGuard<Traits>>,
) -> Option<WaitRef<Traits>>
where
    Traits: KernelTraits,
    HeadCell: intrusive_list::CellLike<
        &'k mut CpuLockGuard<Traits>,
        Target = ListHead<WaitRef<Traits>>,
    >,
    MapLink: Fn(&Wait<Traits>) -> &CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,
{
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(next_cursor) = cursor {
        // Should the new wait object be inserted at this or an earlier
        // position?
        let next_cursor_thread = accessor.pool()[next_cursor].thread;
        // Safety: the thread is registry-held
        let next_cursor_priority = unsafe { next_cursor_thread.0.as_ref() }
            .effective_priority
            .get(&***accessor.cell_key());
        if next_cursor_priority < cur_priority {
            // If so, update `insert_at`. Continue searching because there
            // might be a viable position that is even earlier.
            insert_at = Some(next_cursor);
            cursor = accessor.prev(next_cursor);
        } else {
            break;
        }
    }
    insert_at
}

/// Access the specified thread's current wait payload object in the
/// supplied closure.
///
/// The wait object might get deallocated when the thread starts running.
/// This function allows access to the wait object while ensuring the
/// reference to it doesn't escape from the scope.
pub(crate) fn with_current_wait_payload<Traits: KernelTraits, R>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &ThreadCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    let wait_ref = thread.wait.current_wait.get(&**lock);

    // Safety: `wait_ref` must point to an existing `Wait`
    let wait = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(wait)
}

/// Reposition the given thread's wait object within its wait queue. This
/// is necessary after changing the thread's priority because some wait
/// queues sort wait objects by thread priority.
///
/// Does nothing if the thread is not Waiting or the wait object is not
/// associated with any wait queue.
pub(crate) fn reorder_wait_of_thread<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: &ThreadCb<Traits>,
) {
    if let Some(wait_ref) = thread.wait.current_wait.get(&**lock) {
        // Safety: `wait_ref` must point to an existing `Wait`
        let wait = unsafe { &*wait_ref.0.as_ptr() };

        if let Some(wait_queue) = wait.wait_queue {
            wait_queue.reorder_wait(lock, wait);
        }
    }
}

/// Create a wait object pertaining to the currently running thread but
/// not pertaining to any wait queue. Transition the thread into the
/// Waiting state.
///
/// The only way to end such a wait operation is to call
/// [`interrupt_thread`].
pub(crate) fn wait_no_queue<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    payload: WaitPayload<Traits>,
) -> Result<WaitPayload<Traits>, WaitError> {
    let thread = Traits::state().running_thread.get(&**lock).unwrap();
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    wait_no_queue_inner(lock, &wait).map_err(expect_not_timeout)?;

    Ok(wait.payload)
}

/// Create a wait object pertaining to the currently running thread but
/// not pertaining to any wait queue. Transition the thread into the
/// Waiting state. The operation will time out after the specified
/// duration.
pub(crate) fn wait_no_queue_timeout<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    payload: WaitPayload<Traits>,
    clock: &'static timeout::Clock<Traits>,
    duration: timeout::Duration,
) -> Result<WaitPayload<Traits>, WaitTimeoutError> {
    let thread = Traits::state().running_thread.get(&**lock).unwrap();
    let wait = Wait {
        thread,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    // Configure a timeout
    let mut lock = lock;
    setup_timeout_wait!(lock, thread, clock, duration);

    wait_no_queue_inner(lock, &wait)?;

    Ok(wait.payload)
}

/// The core portion of [`wait_no_queue`].
fn wait_no_queue_inner<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    wait: &Wait<Traits>,
) -> Result<(), WaitTimeoutError> {
    let thread = wait.thread;
    let wait_ref = WaitRef::new(wait);

    debug_assert!(wait.wait_queue.is_none());
    debug_assert!(wait.link.get(&**lock).is_none());

    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    // Set `thread.wait.current_wait`
    cb.wait.current_wait.replace(&mut **lock, Some(wait_ref));

    // Transition the thread into Waiting. This statement will complete
    // when the thread is woken up.
    thread::wait_until_woken_up(lock);

    debug_assert!(cb.wait.current_wait.get(&**lock).is_none());

    // Return the wait result set by the wake-upper. An interruption is
    // consumed by being delivered.
    let result = cb.wait.wait_result.get(&**lock);
    if result == Err(WaitTimeoutError::Interrupted) {
        cb.interrupted.replace(&mut **lock, false);
    }
    result
}

/// Deassociate the specified wait object from its waiting thread
/// (`wait.thread`) and wake up the thread.
///
/// This method doesn't remove `wait` from `WaitQueue::waits`.
///
/// This method may make a thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    wait: &Wait<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) {
    let thread = wait.thread;
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    // Clear `ThreadWait::current_wait`
    debug_assert_eq!(cb.wait.current_wait.get(&**lock), Some(WaitRef::new(wait)));
    cb.wait.current_wait.replace(&mut **lock, None);

    // Set a wait result
    let _ = cb.wait.wait_result.replace(&mut **lock, wait_result);

    debug_assert_eq!(cb.st.get(&**lock), ThreadSt::Waiting);

    // Make the thread Ready. The thread's state is valid and ready to
    // resume from the point where it was previously suspended.
    sched::make_ready(lock, thread);
}

/// Interrupt any ongoing wait operation of the thread.
///
/// This method may make the thread Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `Err(BadState)` if the thread is not in the Waiting state.
///
/// `wait_result` must be valid for the wait operation type: pass
/// `Err(TimedOut)` only for wait operations that use a timeout.
pub(crate) fn interrupt_thread<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) -> Result<(), BadObjectStateError> {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    match cb.st.get(&**lock) {
        ThreadSt::Waiting => {
            // The thread is Waiting, so `current_wait` must be `Some(_)`
            let wait_ref = cb.wait.current_wait.get(&**lock).unwrap();

            // Safety: `wait_ref` must point to an existing `Wait`
            let wait = unsafe { &*wait_ref.0.as_ptr() };

            // Remove `wait` from the wait queue it belongs to
            if let Some(wait_queue) = wait.wait_queue {
                let mut accessor = wait_queue_accessor!(&wait_queue.waits, &mut *lock);
                accessor.remove(wait_ref);
            }

            // Wake up the thread
            complete_wait(lock, wait, wait_result);

            Ok(())
        }
        _ => Err(BadObjectStateError::BadState),
    }
}

/// Construct a [`timeout::Timeout`] to interrupt the specified thread with
/// `TimedOut` after a certain period of time.
fn new_timeout_object_for_thread<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
    clock: &'static timeout::Clock<Traits>,
    duration: timeout::Duration,
) -> timeout::Timeout<Traits> {
    // Construct a `Timeout`, supplying our callback function
    let param = thread.0.as_ptr() as usize;
    let timeout_object =
        timeout::Timeout::new(clock, interrupt_thread_by_timeout::<Traits>, param);

    /// The callback function
    fn interrupt_thread_by_timeout<Traits: KernelTraits>(
        param: usize,
        mut lock: CpuLockGuard<Traits>,
    ) -> CpuLockGuard<Traits> {
        // Safety: We are just converting `param` back to the original form
        let thread = Ref(core::ptr::NonNull::new(param as *mut ThreadCb<Traits>).unwrap());

        // Interrupt the thread. If it is already unblocked, we don't care.
        match interrupt_thread(&mut lock, thread, Err(WaitTimeoutError::TimedOut)) {
            Ok(()) | Err(BadObjectStateError::BadState) => {}
        }

        lock
    }

    // Configure the `Timeout` to expire in `duration`
    timeout_object.set_expiration_after(lock, duration);

    timeout_object
}
