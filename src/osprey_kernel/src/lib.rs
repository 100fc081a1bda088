//! The Osprey kernel
//!
//! A portable real-time kernel for single-CPU microcontrollers, offering
//! POSIX-flavoured primitives — threads, mutexes, semaphores, condition
//! variables, signal flags, timed waits — on top of a preemptive priority
//! scheduler, with a pluggable arena memory resource backing dynamically
//! sized kernel objects (thread stacks in particular).
//!
//! # Contexts
//!
//! Kernel operations classify the calling context as follows:
//!
//!  - **Thread context** — executing a kernel thread with the scheduler
//!    started. All operations are allowed.
//!  - **Waitable context** — thread context with the scheduler *unlocked*.
//!    Blocking operations additionally require this and fail with
//!    `PermissionDenied` otherwise.
//!  - **Interrupt context** — a (first- or second-level) interrupt
//!    handler. Only interrupt-safe operations (`resume`, `sig_raise`,
//!    `cancel`, `Semaphore::post`, …) are allowed.
//!  - **Boot context** — before the scheduler is started. Object
//!    construction is allowed; blocking is not.
//!
//! # The port boundary
//!
//! The architecture-specific parts — saving and restoring register
//! contexts, pending the dispatcher, masking interrupts, the tick source —
//! live behind [`PortThreading`]. The kernel talks back to the port
//! through [`PortToKernel`]. A port binds a *system type* (an empty struct
//! naming the whole instantiation) to its implementation and to the
//! kernel's static state; see the `osprey_port_std` crate for a hosted
//! example.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
extern crate alloc;

use core::fmt;

pub mod utils;
pub mod error;
pub(crate) mod klock;
pub mod condvar;
pub mod mem;
pub mod mutex;
pub mod sched;
pub mod semaphore;
pub mod this_thread;
pub mod thread;
pub(crate) mod timeout;
pub(crate) mod wait;

pub use crate::timeout::{system_clock, Clock, Duration, Tick};

use crate::{
    klock::CpuLockCell,
    mem::MemoryResource,
    thread::{readyqueue::ReadyQueue, ThreadCb, ThreadRef},
    utils::{intrusive_list::ListHead, Init},
};

/// Implemented by kernel objects that carry a human-readable name.
///
/// Names are only used for diagnostics; the kernel never interprets them.
pub trait KernelObject {
    fn name(&self) -> &'static str;
}

/// Provides access to the port's low-level threading operations.
///
/// # Safety
///
/// Implementing this trait is the port's contract with the kernel: the
/// operations must behave exactly as documented, on the exact contexts
/// documented, or kernel invariants break.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-specific per-thread state, stored at the beginning of each
    /// thread control block so context-switch code can reach it at a fixed
    /// offset.
    type PortThreadState: Send + Sync + Init + 'static;

    /// Transfer control to the thread chosen by the last call to
    /// [`PortToKernel::choose_running_thread`].
    ///
    /// Precondition: CPU Lock active. Never returns to the caller.
    unsafe fn dispatch_first_thread() -> !;

    /// Pend the dispatcher, which will call
    /// [`PortToKernel::choose_running_thread`] and perform a context
    /// switch at the next safe point.
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Discard the current thread's context and dispatch the next thread.
    ///
    /// Precondition: CPU Lock active, `thread` is the current thread and
    /// is no longer the running thread.
    unsafe fn exit_and_dispatch(thread: &ThreadCb<Self>) -> !;

    /// Mask interrupts.
    unsafe fn enter_cpu_lock();

    /// Unmask interrupts.
    unsafe fn leave_cpu_lock();

    /// Lay out the initial context of `thread` so the first dispatch lands
    /// in the entry trampoline (which calls the thread function and, on
    /// return, `this_thread::exit`).
    ///
    /// Precondition: CPU Lock active, `thread` is inactive.
    unsafe fn initialize_thread_state(thread: &ThreadCb<Self>);

    fn is_cpu_lock_active() -> bool;

    /// `true` when executing a kernel thread (as opposed to an interrupt
    /// handler or the boot phase).
    fn is_thread_context() -> bool;

    fn is_interrupt_context() -> bool;

    /// Wait for the next interrupt. Called by the idle thread with the CPU
    /// Lock inactive; the power-save behaviour is up to the port.
    unsafe fn idle_wait();
}

/// The interface the kernel exposes to the port.
///
/// These are implemented for every system type through a blanket
/// implementation; the port merely calls them at the documented moments.
pub trait PortToKernel {
    /// Initialize the kernel: record the default memory resource and
    /// create the idle thread. Called once, in a boot context, with the
    /// CPU Lock inactive, before any kernel object is constructed.
    unsafe fn boot(resource: &'static dyn MemoryResource);

    /// Elect the next thread to run, updating the kernel's notion of the
    /// running thread. The port's dispatcher calls this, then switches to
    /// the elected context.
    ///
    /// Precondition: CPU Lock active.
    unsafe fn choose_running_thread();

    /// Called by the port's tick interrupt handler. Advances the system
    /// clock and fires expired timeouts.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context.
    unsafe fn timer_tick();
}

/// The all-encompassing trait of a bound system type: the port operations
/// plus access to the kernel's static state.
///
/// # Safety
///
/// `state` must return the same `KernelState` every time, used by nothing
/// else.
pub unsafe trait KernelTraits: PortThreading {
    /// The smallest stack the kernel will accept for a thread.
    const STACK_MIN_SIZE: usize = 256;

    /// The stack size used when thread attributes don't supply one.
    const STACK_DEFAULT_SIZE: usize = 4096;

    fn state() -> &'static KernelState<Self>;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot(resource: &'static dyn MemoryResource) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        Traits::state()
            .default_resource
            .replace(&mut *lock, Some(resource));

        drop(lock);

        // The idle thread is the first thread of every system. Its stack
        // comes from the default resource recorded above.
        sched::create_idle_thread::<Traits>();
    }

    unsafe fn choose_running_thread() {
        // Safety: The caller (the port's dispatcher) has the CPU Lock
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        sched::choose_next_running_thread(&mut lock);
        // The dispatcher keeps the CPU Lock
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// The kernel's mutable state, one instance per system type, reached
/// through [`KernelTraits::state`].
///
/// The scheduler, the systick clock, and the default memory resource are
/// process-wide singletons by the nature of a single-CPU kernel; they are
/// explicitly initialized by [`PortToKernel::boot`] rather than on first
/// use, which would be unsafe before the port is ready.
pub struct KernelState<Traits: PortThreading + KernelTraits> {
    /// The currently running thread. `None` only before the scheduler is
    /// started and (transiently) inside the dispatcher.
    pub(crate) running_thread: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// Threads in the Ready state, ordered by effective priority
    /// (descending), FIFO within one priority.
    pub(crate) ready_queue: ReadyQueue<Traits>,

    /// Re-entrant scheduler-lock depth. While non-zero, preemption checks
    /// keep the running thread and blocking primitives are rejected.
    pub(crate) sched_lock_depth: CpuLockCell<Traits, u32>,

    /// Terminated detached threads awaiting destruction by the idle
    /// thread.
    pub(crate) reap_list: CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>,

    /// Strong references keeping every live thread control block alive.
    /// An entry is removed only on the `Destroyed` transition, which the
    /// scheduler guarantees happens after the thread has left every
    /// kernel queue.
    pub(crate) registry: CpuLockCell<Traits, alloc::vec::Vec<alloc::sync::Arc<ThreadCb<Traits>>>>,

    /// The clock driven by the port's tick interrupt.
    pub(crate) sysclock: Clock<Traits>,

    /// The memory resource backing thread stacks and other dynamically
    /// sized kernel objects.
    pub(crate) default_resource: CpuLockCell<Traits, Option<&'static dyn MemoryResource>>,

    /// The idle thread, created by [`PortToKernel::boot`].
    pub(crate) idle_thread: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,
}

// Safety: Every field is either immutable, atomic, or a `CpuLockCell`
// whose contents are only reached through the interrupt-mask critical
// section.
unsafe impl<Traits: PortThreading> Send for KernelState<Traits> {}
unsafe impl<Traits: PortThreading> Sync for KernelState<Traits> {}

impl<Traits: PortThreading + KernelTraits> KernelState<Traits> {
    pub const fn new() -> Self {
        Self {
            running_thread: CpuLockCell::new(None),
            ready_queue: ReadyQueue::new(),
            sched_lock_depth: CpuLockCell::new(0),
            reap_list: CpuLockCell::new(ListHead::new()),
            registry: CpuLockCell::new(alloc::vec::Vec::new()),
            sysclock: Clock::new("sysclock"),
            default_resource: CpuLockCell::new(None),
            idle_thread: CpuLockCell::new(None),
        }
    }
}

impl<Traits: PortThreading> Default for KernelState<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for KernelState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelState")
            .field("running_thread", &self.running_thread)
            .field("sched_lock_depth", &self.sched_lock_depth)
            .field("sysclock", &self.sysclock)
            .finish_non_exhaustive()
    }
}
