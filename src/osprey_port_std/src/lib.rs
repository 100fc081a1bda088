//! Simulator port of the Osprey kernel for hosted (`std`) targets.
//!
//! Each kernel thread is backed by a host thread. A dispatch gate (a
//! mutex/condvar pair) ensures that a backing thread only executes while
//! the kernel considers its thread *running*; everyone else is parked.
//! The CPU Lock becomes a spin lock, and a timer thread delivers tick
//! interrupts at a fixed 1 ms period.
//!
//! The simulation is faithful at every suspension point. What it does not
//! reproduce is *asynchronous* preemption: a preempted thread's host
//! thread keeps executing user code until its next port operation, at
//! which point it parks. Kernel state, and therefore every scheduling
//! decision, is identical to the real thing.
//!
//! # Usage
//!
//! ```ignore
//! osprey_port_std::use_port!(unsafe struct SystemTraits);
//!
//! static ARENA: [u8; 65536] = ...;
//!
//! fn main() {
//!     SystemTraits::port_state().port_boot::<SystemTraits>(resource, app);
//! }
//! ```
use std::{
    cell::{Cell, RefCell},
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
    sync::{Condvar, Mutex},
    time::Duration as HostDuration,
};

use osprey_kernel::{
    mem::MemoryResource, sched, thread::ThreadCb, utils::Init, KernelObject, KernelTraits,
    PortThreading, PortToKernel,
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate osprey_kernel;

/// The host-time length of one kernel tick.
pub const TICK_PERIOD: HostDuration = HostDuration::from_millis(1);

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortThreadState = ThreadState>
{
    fn port_state() -> &'static State;
}

/// The role of a host thread within the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for an interrupt context (the timer thread).
    Interrupt,
    /// The backing thread for a kernel thread.
    Thread,
}

thread_local! {
    /// The current host thread's role, assigned when the port creates it.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The kernel thread this host thread backs (a `ThreadCb` address).
    static CURRENT_CB: Cell<usize> = Cell::new(0);

    /// The held CPU Lock, parked here between `enter_cpu_lock` and
    /// `leave_cpu_lock`.
    static CPU_GUARD: RefCell<Option<spin::MutexGuard<'static, ()>>> = RefCell::new(None);
}

/// Host-side state of one kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tsm {
    /// No context; `initialize_thread_state` hasn't run.
    Uninit,
    /// Context initialized, no backing thread spawned yet.
    Dormant,
    /// A backing thread exists.
    Running,
}

/// The port-specific per-thread state.
#[derive(Debug)]
pub struct ThreadState {
    tsm: spin::Mutex<Tsm>,
}

impl ThreadState {
    pub const fn new() -> Self {
        Self {
            tsm: spin::Mutex::new(Tsm::Uninit),
        }
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

impl Init for ThreadState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

/// The payload used to unwind a backing thread out of an exited kernel
/// thread.
struct ThreadExitToken;

struct SchedState {
    /// The kernel thread currently dispatched (a `ThreadCb` address).
    current: Option<usize>,
    shutdown: bool,
}

/// The internal state of the port. One instance per system type, created
/// by [`use_port!`].
pub struct State {
    /// Guards [`SchedState`]; paired with `dispatch_cv`.
    sched: Mutex<SchedState>,
    dispatch_cv: Condvar,
    shutdown_cv: Condvar,

    /// The interrupt mask. Holding the guard *is* the CPU Lock.
    cpu_mutex: spin::Mutex<()>,

    /// Set by `dispatch_first_thread`; before that, reschedule requests
    /// are ignored.
    scheduler_active: AtomicBool,

    /// The first panic that escaped a kernel thread, re-raised by
    /// `port_boot` after shutdown.
    panic_payload: spin::Mutex<Option<Box<dyn std::any::Any + Send>>>,
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: Mutex::new(SchedState {
                current: None,
                shutdown: false,
            }),
            dispatch_cv: Condvar::new(),
            shutdown_cv: Condvar::new(),
            cpu_mutex: spin::Mutex::new(()),
            scheduler_active: AtomicBool::new(false),
            panic_payload: spin::Mutex::new(None),
        }
    }

    /// Boot the kernel and run it until [`shutdown`] is called.
    ///
    /// `app` runs in a boot context after the kernel is initialized; it
    /// typically creates the application's initial threads. A panic that
    /// escapes any kernel thread shuts the simulation down and is
    /// propagated to the caller.
    pub fn port_boot<Traits: PortInstance>(
        &'static self,
        resource: &'static dyn MemoryResource,
        app: fn(),
    ) {
        log::trace!("port_boot");

        // The timer thread delivers tick interrupts until shutdown.
        let timer_join_handle = std::thread::Builder::new()
            .name("tick interrupt".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
                loop {
                    std::thread::sleep(TICK_PERIOD);
                    if self.sched.lock().unwrap().shutdown {
                        break;
                    }
                    // Safety: CPU Lock inactive on this thread, interrupt
                    // context
                    unsafe { Traits::timer_tick() };
                }
            })
            .unwrap();

        // The boot phase of the kernel runs on its own thread because
        // `sched::start` never returns.
        std::thread::Builder::new()
            .name("boot".to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

                let result = catch_unwind(AssertUnwindSafe(|| -> () {
                    // Safety: Boot context, CPU Lock inactive, called once
                    unsafe { Traits::boot(resource) };

                    app();

                    sched::start::<Traits>()
                }));

                if let Err(payload) = result {
                    let mut slot = self.panic_payload.lock();
                    if slot.is_none() {
                        *slot = Some(payload);
                    }
                    drop(slot);
                    shutdown_state(self);
                }
            })
            .unwrap();

        // Wait until a kernel thread initiates shutdown.
        {
            let mut sched_state = self.sched.lock().unwrap();
            while !sched_state.shutdown {
                sched_state = self.shutdown_cv.wait(sched_state).unwrap();
            }
        }

        log::trace!("stopping the timer thread");
        timer_join_handle.join().unwrap();

        // Propagate any panic that occurred in a kernel thread.
        if let Some(payload) = self.panic_payload.lock().take() {
            resume_unwind(payload);
        }
    }

    /// Run the dispatcher: elect the next kernel thread and (re)target the
    /// dispatch gate at it, spawning its backing thread on first use.
    ///
    /// Precondition: CPU Lock held by the calling thread.
    fn dispatch<Traits: PortInstance>(&'static self) {
        // Safety: CPU Lock held by us
        unsafe { Traits::choose_running_thread() };
        let running = unsafe { sched::current_running_thread::<Traits>() };

        let mut sched_state = self.sched.lock().unwrap();

        if let Some(cb_ptr) = running {
            // Safety: the kernel keeps the control block alive
            let cb = unsafe { cb_ptr.as_ref() };
            let mut tsm = cb.port_thread_state.tsm.lock();
            if *tsm == Tsm::Dormant {
                *tsm = Tsm::Running;
                drop(tsm);
                self.spawn_backing_thread::<Traits>(cb_ptr);
            }
        }

        sched_state.current = running.map(|p| p.as_ptr() as usize);
        log::trace!("dispatching {:?}", sched_state.current);
        drop(sched_state);
        self.dispatch_cv.notify_all();
    }

    fn spawn_backing_thread<Traits: PortInstance>(&'static self, cb_ptr: NonNull<ThreadCb<Traits>>) {
        // Safety: the kernel keeps the control block alive
        let name = unsafe { cb_ptr.as_ref() }.name();
        let cb_addr = cb_ptr.as_ptr() as usize;

        log::trace!("spawning a backing thread for {:?}", name);

        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Thread));
                CURRENT_CB.with(|c| c.set(cb_addr));

                // Do not run a single instruction of the thread function
                // before the kernel dispatches us.
                self.wait_dispatch(cb_addr);

                let result = catch_unwind(AssertUnwindSafe(|| -> () {
                    let cb_ptr = NonNull::new(cb_addr as *mut ThreadCb<Traits>).unwrap();
                    // Safety: First activation of this kernel thread, on
                    // its own backing thread
                    unsafe { osprey_kernel::thread::thread_entry::<Traits>(cb_ptr) }
                }));

                match result {
                    Err(payload) if payload.is::<ThreadExitToken>() => {
                        log::trace!("backing thread for {:?} unwound cleanly", name);
                    }
                    Err(payload) => {
                        // A test assertion or a bug; surface it through
                        // `port_boot`.
                        log::error!("kernel thread {:?} panicked", name);
                        let mut slot = self.panic_payload.lock();
                        if slot.is_none() {
                            *slot = Some(payload);
                        }
                        drop(slot);
                        shutdown_state(self);
                    }
                    Ok(()) => unreachable!(),
                }
            })
            .unwrap();
    }

    /// Park until the kernel dispatches the given thread again.
    fn wait_dispatch(&'static self, cb_addr: usize) {
        let mut sched_state = self.sched.lock().unwrap();
        while sched_state.current != Some(cb_addr) {
            sched_state = self.dispatch_cv.wait(sched_state).unwrap();
        }
    }

    pub unsafe fn dispatch_first_thread<Traits: PortInstance>(&'static self) -> ! {
        log::trace!("dispatch_first_thread");
        assert_eq!(THREAD_ROLE.with(|r| r.get()), ThreadRole::Boot);
        assert!(self.is_cpu_lock_active());

        self.scheduler_active.store(true, Ordering::Release);
        self.dispatch::<Traits>();
        unsafe { self.leave_cpu_lock() };

        // The boot context is over; this host thread has nothing left to
        // do.
        loop {
            std::thread::park();
        }
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        if !self.scheduler_active.load(Ordering::Acquire) {
            return;
        }

        log::trace!("yield_cpu");

        unsafe { self.enter_cpu_lock() };
        self.dispatch::<Traits>();
        unsafe { self.leave_cpu_lock() };

        // If the dispatch decision went against the calling thread, park
        // until it is dispatched again.
        if THREAD_ROLE.with(|r| r.get()) == ThreadRole::Thread {
            self.wait_dispatch(CURRENT_CB.with(|c| c.get()));
        }
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        thread: &ThreadCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({:?})", thread.name());
        assert_eq!(THREAD_ROLE.with(|r| r.get()), ThreadRole::Thread);
        assert!(self.is_cpu_lock_active());

        *thread.port_thread_state.tsm.lock() = Tsm::Uninit;

        self.dispatch::<Traits>();
        unsafe { self.leave_cpu_lock() };

        // Unwind out of the kernel thread; caught in
        // `spawn_backing_thread`.
        resume_unwind(Box::new(ThreadExitToken))
    }

    pub unsafe fn enter_cpu_lock(&'static self) {
        // A backing thread may still be executing user code after the
        // kernel preempted its thread (the simulator cannot interrupt it
        // asynchronously). It must not re-enter the kernel in that state:
        // park it on the dispatch gate first, and re-check after taking
        // the interrupt mask, since a tick can slip in between. Once the
        // mask is held, the dispatch decision cannot change under us.
        let is_thread = THREAD_ROLE.with(|r| r.get()) == ThreadRole::Thread
            && self.scheduler_active.load(Ordering::Acquire);

        let guard = loop {
            if is_thread {
                self.wait_dispatch(CURRENT_CB.with(|c| c.get()));
            }

            let guard = self.cpu_mutex.lock();

            if !is_thread
                || self.sched.lock().unwrap().current == Some(CURRENT_CB.with(|c| c.get()))
            {
                break guard;
            }

            drop(guard);
        };

        CPU_GUARD.with(|slot| {
            let prev = slot.borrow_mut().replace(guard);
            assert!(prev.is_none(), "CPU Lock is already active");
        });
    }

    pub unsafe fn leave_cpu_lock(&'static self) {
        CPU_GUARD.with(|slot| {
            let guard = slot
                .borrow_mut()
                .take()
                .expect("CPU Lock is not held by this thread");
            drop(guard);
        });
    }

    pub unsafe fn initialize_thread_state<Traits: PortInstance>(
        &self,
        thread: &ThreadCb<Traits>,
    ) {
        log::trace!("initialize_thread_state({:?})", thread.name());

        let mut tsm = thread.port_thread_state.tsm.lock();
        match *tsm {
            Tsm::Uninit | Tsm::Dormant => {
                *tsm = Tsm::Dormant;
            }
            Tsm::Running => {
                panic!("reinitializing a live thread is not supported");
            }
        }
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        // "Active" means active for the current execution context, which
        // in the simulator is per host thread.
        CPU_GUARD.with(|slot| slot.borrow().is_some())
    }

    pub fn is_thread_context(&self) -> bool {
        THREAD_ROLE.with(|r| r.get()) == ThreadRole::Thread
    }

    pub fn is_interrupt_context(&self) -> bool {
        THREAD_ROLE.with(|r| r.get()) == ThreadRole::Interrupt
    }

    pub unsafe fn idle_wait(&'static self) {
        // The closest thing a simulator has to a wait-for-interrupt
        // instruction.
        std::thread::sleep(HostDuration::from_micros(200));

        if THREAD_ROLE.with(|r| r.get()) == ThreadRole::Thread {
            self.wait_dispatch(CURRENT_CB.with(|c| c.get()));
        }
    }
}

fn shutdown_state(state: &'static State) {
    state.sched.lock().unwrap().shutdown = true;
    state.shutdown_cv.notify_all();
    // Unblock anything parked on the dispatch gate predicate re-check.
    state.dispatch_cv.notify_all();
}

/// Initiate graceful shutdown: [`State::port_boot`] returns once the
/// timer thread has stopped. Backing threads parked on the dispatch gate
/// are simply left parked.
///
/// Note: There is no way to restart the simulated system within the same
/// process.
pub fn shutdown<Traits: PortInstance>() {
    log::trace!("shutdown");
    shutdown_state(Traits::port_state());
}

/// Bind a system type to this port and to a kernel state instance.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::osprey_kernel::{
                thread::ThreadCb, KernelState, KernelTraits, PortThreading,
            };
            use $crate::{PortInstance, State, ThreadState};

            pub(super) static PORT_STATE: State = State::new();
            static KERNEL_STATE: KernelState<$SystemTraits> = KernelState::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                type PortThreadState = ThreadState;

                unsafe fn dispatch_first_thread() -> ! {
                    unsafe { PORT_STATE.dispatch_first_thread::<Self>() }
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(thread: &ThreadCb<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(thread) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn initialize_thread_state(thread: &ThreadCb<Self>) {
                    unsafe { PORT_STATE.initialize_thread_state::<Self>(thread) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_thread_context() -> bool {
                    PORT_STATE.is_thread_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }

                unsafe fn idle_wait() {
                    unsafe { PORT_STATE.idle_wait() }
                }
            }

            unsafe impl KernelTraits for $SystemTraits {
                fn state() -> &'static KernelState<Self> {
                    &KERNEL_STATE
                }
            }
        }
    };
}
