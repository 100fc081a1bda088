//! Clocks and timeouts (timed events).
//!
//! A [`Clock`] is a monotonic tick counter paired with a list of pending
//! [`Timeout`] nodes kept in ascending expiry order. Insertion is O(n)
//! with n bounded by the number of threads in a timed wait; cancellation
//! is O(1) given the node. The port's tick interrupt drives the systick
//! clock through [`handle_tick`]; additional clocks (a calendar RTC, for
//! example) can coexist, each advanced by whoever owns its hardware, and a
//! thread chooses the clock its timed waits run against through its
//! attributes.
//!
//! Tick counts are 64-bit and never expected to wrap within the uptime of
//! any real system.
use core::{fmt, marker::PhantomPinned, pin::Pin, sync::atomic::{AtomicBool, Ordering}};

use crate::{
    klock::{self, CpuLockCell, CpuLockGuard},
    sched,
    utils::intrusive_list::{Link, ListAccessorCell, ListHead, Ref, UnsafeRefPool},
    KernelObject, KernelTraits, PortThreading,
};

/// An absolute point in time, measured in ticks since the clock started.
pub type Tick = u64;

/// A relative time span, measured in ticks of the clock it is used with.
pub type Duration = u32;

/// A reference to a [`Timeout`].
pub(crate) type TimeoutRef<Traits> = Ref<Timeout<Traits>>;

/// Get a `ListAccessorCell` used to access a clock's timeout list.
macro_rules! timeout_list_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            // Safety: All elements are extant; `Timeout::drop` refuses to
            //         drop a node that is still linked.
            unsafe { UnsafeRefPool::new() },
            |timeout: &Timeout<Traits>| &timeout.link,
            $key,
        )
    };
}

/// A monotonic clock with an ordered list of pending timeouts.
pub struct Clock<Traits: PortThreading> {
    name: &'static str,

    /// The current time. Incremented by [`Clock::advance`], never set
    /// back.
    steady_count: CpuLockCell<Traits, Tick>,

    /// Pending timeouts, in ascending order of [`Timeout::at`]; FIFO among
    /// equal expiry ticks.
    timeouts: CpuLockCell<Traits, ListHead<TimeoutRef<Traits>>>,
}

impl<Traits: PortThreading> Clock<Traits> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            steady_count: CpuLockCell::new(0),
            timeouts: CpuLockCell::new(ListHead::new()),
        }
    }
}

impl<Traits: PortThreading> KernelObject for Clock<Traits> {
    fn name(&self) -> &'static str {
        self.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for Clock<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("steady_count", &self.steady_count)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Clock<Traits> {
    /// The current tick count.
    pub fn now(&'static self) -> Tick {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.steady_count.get(&*lock)
    }

    pub(crate) fn now_locked(&self, lock: &mut CpuLockGuard<Traits>) -> Tick {
        self.steady_count.get(&**lock)
    }

    /// Advance the clock by `dticks` and fire every expired timeout.
    ///
    /// The callbacks may wake up threads; the caller is responsible for
    /// checking for dispatch afterwards
    /// (`sched::unlock_cpu_and_check_preemption`).
    pub(crate) fn advance(
        &'static self,
        mut lock: CpuLockGuard<Traits>,
        dticks: Duration,
    ) -> CpuLockGuard<Traits> {
        let now = self.steady_count.get(&*lock).wrapping_add(dticks as Tick);
        self.steady_count.replace(&mut *lock, now);

        // Pop and fire every timeout whose expiry tick has been reached.
        loop {
            let front = {
                let accessor = timeout_list_accessor!(&self.timeouts, &mut lock);
                accessor.front()
            };

            let timeout_ref = if let Some(r) = front {
                r
            } else {
                break;
            };

            // Safety: `timeout_ref` is linked, so the pointee is valid
            let timeout = unsafe { &*timeout_ref.0.as_ptr() };

            if timeout.at.get(&*lock) > now {
                break;
            }

            // The timeout has expired. Remove it from the list first; the
            // callback may re-register it.
            let Timeout {
                callback,
                callback_param,
                ..
            } = *timeout;
            {
                let mut accessor = timeout_list_accessor!(&self.timeouts, &mut lock);
                accessor.remove(timeout_ref);
            }
            timeout.linked.store(false, Ordering::Relaxed);

            // (`timeout` is considered invalid at this point because it's
            // not in the list anymore)

            lock = callback(callback_param, lock);
        }

        lock
    }
}

/// The clock driven by the port's tick interrupt.
pub fn system_clock<Traits: KernelTraits>() -> &'static Clock<Traits> {
    &Traits::state().sysclock
}

/// Timeout callback function.
///
/// The callback function is called with the CPU Lock active, from the
/// context that advances the clock (an interrupt context for the systick
/// clock), when the associated [`Timeout`] expires.
///
/// The callback may wake up threads. It doesn't have to request a
/// reschedule itself; the clock's driver takes care of that.
pub(crate) type TimeoutFn<Traits> =
    fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// A timeout (timed event).
///
/// `Timeout` is a `!Unpin` type. Once registered by [`insert_timeout`],
/// the `Timeout` must stay in the same memory location until it's
/// unregistered. Dropping isn't allowed either; `Timeout::drop` detects
/// the violation of this requirement and panics.
///
/// A `Timeout` is unregistered in one of the following ways:
///
///  - On expiry, right before its callback function is called.
///  - [`remove_timeout`] can unregister a `Timeout` at any time. The RAII
///    guard type [`TimeoutGuard`] does this automatically.
pub(crate) struct Timeout<Traits: PortThreading> {
    /// The expiry time, in ticks of `clock`.
    at: CpuLockCell<Traits, Tick>,

    /// Forms the linked list headed by `clock.timeouts`.
    link: CpuLockCell<Traits, Option<Link<TimeoutRef<Traits>>>>,

    /// Mirrors `link.is_some()`. Maintained so `Timeout::drop` can check
    /// linked-ness without the CPU Lock.
    linked: AtomicBool,

    /// The clock whose timeout list this node goes into.
    clock: &'static Clock<Traits>,

    /// Callback function.
    callback: TimeoutFn<Traits>,

    /// Parameter given to the callback function.
    callback_param: usize,

    _pin: PhantomPinned,
}

// Safety: Accessed only under the CPU Lock (`linked` is atomic).
unsafe impl<Traits: PortThreading> Send for Timeout<Traits> {}
unsafe impl<Traits: PortThreading> Sync for Timeout<Traits> {}

impl<Traits: PortThreading> Drop for Timeout<Traits> {
    fn drop(&mut self) {
        if self.linked.load(Ordering::Relaxed) {
            // The timeout is still in a clock's list. Dropping `self` now
            // would cause a use-after-free. The owner of `Timeout` is
            // responsible for unregistering it first.
            panic!("timeout is still linked");
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("linked", &self.linked)
            .field("callback_param", &self.callback_param)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Construct a `Timeout` against the given clock. The expiry time is
    /// set to zero.
    pub(crate) fn new(
        clock: &'static Clock<Traits>,
        callback: TimeoutFn<Traits>,
        callback_param: usize,
    ) -> Self {
        Self {
            at: CpuLockCell::new(0),
            link: CpuLockCell::new(None),
            linked: AtomicBool::new(false),
            clock,
            callback,
            callback_param,
            _pin: PhantomPinned,
        }
    }

    /// Configure the `Timeout` to expire in the specified duration.
    pub(crate) fn set_expiration_after(
        &self,
        lock: &mut CpuLockGuard<Traits>,
        duration: Duration,
    ) {
        let now = self.clock.steady_count.get(&**lock);
        self.at.replace(&mut **lock, now.wrapping_add(duration as Tick));
    }
}

/// Register the specified timeout in its clock's list.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    timeout: Pin<&Timeout<Traits>>,
) {
    // For each `Timeout`, there can be only one list entry pointing to it.
    assert!(
        !timeout.linked.load(Ordering::Relaxed),
        "timeout is already registered"
    );

    let timeout_ref = TimeoutRef::new(&*timeout);
    let at = timeout.at.get(&**lock);
    let clock = timeout.clock;

    let mut accessor = timeout_list_accessor!(&clock.timeouts, &mut *lock);

    // Search backwards for the last node expiring at or before `at`; the
    // new node goes right after it, preserving FIFO order among nodes with
    // the same expiry tick.
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(at_ref) = cursor {
        let cursor_at = accessor.pool()[at_ref].at.get(&***accessor.cell_key());
        if cursor_at > at {
            insert_at = Some(at_ref);
            cursor = accessor.prev(at_ref);
        } else {
            break;
        }
    }

    accessor.insert(timeout_ref, insert_at);
    timeout.linked.store(true, Ordering::Relaxed);
}

/// Unregister the specified `Timeout`. Does nothing if it's not
/// registered.
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    timeout: &Timeout<Traits>,
) {
    if !timeout.linked.load(Ordering::Relaxed) {
        return;
    }

    let timeout_ref = TimeoutRef::new(timeout);
    let clock = timeout.clock;

    let mut accessor = timeout_list_accessor!(&clock.timeouts, &mut *lock);
    accessor.remove(timeout_ref);

    timeout.linked.store(false, Ordering::Relaxed);
}

/// RAII guard that automatically unregisters a `Timeout` when dropped.
pub(crate) struct TimeoutGuard<'a, 'b, Traits: KernelTraits> {
    pub(crate) timeout: Pin<&'a Timeout<Traits>>,
    pub(crate) lock: &'b mut CpuLockGuard<Traits>,
}

impl<Traits: KernelTraits> Drop for TimeoutGuard<'_, '_, Traits> {
    #[inline]
    fn drop(&mut self) {
        remove_timeout(&mut *self.lock, &self.timeout);
    }
}

/// Implements [`PortToKernel::timer_tick`](crate::PortToKernel::timer_tick).
///
/// Precondition: CPU Lock inactive, an interrupt context.
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let lock = klock::lock_cpu::<Traits>().unwrap();

    let lock = Traits::state().sysclock.advance(lock, 1);

    // Callback functions might have woken up some threads. Check for
    // dispatch and release the CPU Lock.
    sched::unlock_cpu_and_check_preemption(lock);
}
