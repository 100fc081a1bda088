//! Threads
use core::{fmt, ptr::NonNull, sync::atomic::AtomicI32};

use alloc::sync::Arc;

use crate::{
    error::{
        BadObjectStateError, CancelError, ClearSigError, CreateThreadError, DetachError,
        JoinError, RaiseSigError, ResumeError, SetPriorityError, WaitError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard},
    mutex, sched,
    timeout::Clock,
    utils::{
        intrusive_list::{Link, ListAccessorCell, ListHead, Ref, UnsafeRefPool},
        Init,
    },
    wait::{self, ThreadWait, WaitPayload},
    KernelObject, KernelTraits, MemoryResource, PortThreading,
};

pub(crate) mod readyqueue;

/// Thread priorities.
///
/// An 8-bit value; *higher* numeric values represent *higher* priorities.
/// The named constants are spread over the 0–255 range so intermediate
/// priorities exist between any two names.
pub mod priority {
    /// Priorities pre-scaler. The default of 4 gives the full range of
    /// 256 priorities; lower values narrow the range (0 gives 16).
    pub const RANGE: u32 = 4;

    /// Undefined, thread not initialised.
    pub const NONE: u8 = 0;
    /// System reserved for the idle thread.
    pub const IDLE: u8 = (1 << RANGE) as u8;
    /// Lowest available for user code.
    pub const LOWEST: u8 = (2 << RANGE) as u8;
    pub const LOW: u8 = (2 << RANGE) as u8;
    pub const BELOW_NORMAL: u8 = (4 << RANGE) as u8;
    /// Default priority.
    pub const NORMAL: u8 = (6 << RANGE) as u8;
    pub const ABOVE_NORMAL: u8 = (8 << RANGE) as u8;
    pub const HIGH: u8 = (10 << RANGE) as u8;
    pub const REALTIME: u8 = (12 << RANGE) as u8;
    /// Highest available for user code.
    pub const HIGHEST: u8 = (((13 + 1) << RANGE) - 1) as u8;
    /// System reserved for the ISR deferred thread.
    pub const ISR: u8 = (((14 + 1) << RANGE) - 1) as u8;
    /// Error.
    pub const ERROR: u8 = (((15 + 1) << RANGE) - 1) as u8;
}

/// Signal flag masks with special meaning.
pub mod sig {
    /// Special signal mask representing any flag.
    pub const ANY: u32 = 0;
    /// Special signal mask representing all flags.
    pub const ALL: u32 = 0xFFFF_FFFF;
}

bitflags::bitflags! {
    /// Mode bits for the signal-flag wait operations, selecting whether
    /// all or any of the masked flags are expected and whether satisfied
    /// flags are cleared on return.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SigMode: u32 {
        /// Wait for all the masked flags.
        const ALL = 1;
        /// Wait for any of the masked flags.
        const ANY = 2;
        /// Clear the satisfied flags before returning.
        const CLEAR = 4;
    }
}

/// Thread state machine.
///
/// ```text
/// Undefined → Inactive → Ready ⇄ Running
///                          ↑        ↓
///                       Waiting ←───┘
///                                   ↓
///                            Terminated → Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// Catches uninitialised threads.
    Undefined,
    /// Constructed but not yet schedulable.
    Inactive,
    Ready,
    Running,
    Waiting,
    /// The thread function returned or `exit` was called. The join value
    /// is available for a joiner.
    Terminated,
    /// Reclaimed. Terminal.
    Destroyed,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Undefined;
}

/// A reference to a [`ThreadCb`]. The pointee is kept alive by the thread
/// registry until the `Destroyed` transition.
pub(crate) type ThreadRef<Traits> = Ref<ThreadCb<Traits>>;

// Stack
// ---------------------------------------------------------------------------

/// The magic word written over a fresh stack. A blown bottom word means
/// the thread overflowed its stack.
const STACK_MAGIC: usize = 0xEFBE_ADDE;

/// Alignment of stack allocations.
pub(crate) const STACK_ALIGN: usize = 8;

/// A thread's stack: a contiguous byte range with a magic canary word at
/// each end.
pub struct Stack {
    bottom: NonNull<u8>,
    size: usize,
    /// The memory resource the stack was carved from, or `None` for
    /// caller-supplied stacks.
    resource: Option<&'static dyn MemoryResource>,
}

// Safety: The raw range is only written through `&self` during `paint`,
// which runs before the owning thread becomes schedulable.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    fn new(bottom: NonNull<u8>, size: usize, resource: Option<&'static dyn MemoryResource>) -> Self {
        Self {
            bottom,
            size,
            resource,
        }
    }

    pub fn bottom(&self) -> *mut u8 {
        self.bottom.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of words the stack can hold.
    fn word_count(&self) -> usize {
        self.size / core::mem::size_of::<usize>()
    }

    /// Fill the entire stack with the canary magic.
    fn paint(&self) {
        let p = self.bottom.as_ptr() as *mut usize;
        for i in 0..self.word_count() {
            // Safety: `bottom..bottom + size` is owned by this stack
            unsafe { p.add(i).write(STACK_MAGIC) };
        }
    }

    /// The number of bytes never touched by the thread, measured by
    /// walking unmodified canary words from the bottom upward.
    pub fn available(&self) -> usize {
        let p = self.bottom.as_ptr() as *const usize;
        let mut n = 0;
        while n < self.word_count() {
            // Safety: `bottom..bottom + size` is owned by this stack
            if unsafe { p.add(n).read() } != STACK_MAGIC {
                break;
            }
            n += 1;
        }
        n * core::mem::size_of::<usize>()
    }

    /// Check the bottom canary word. Called every time the owning thread
    /// is switched out.
    pub(crate) fn check_bottom_canary(&self) {
        // Safety: `bottom..bottom + size` is owned by this stack
        let bottom_word = unsafe { (self.bottom.as_ptr() as *const usize).read() };
        assert_eq!(bottom_word, STACK_MAGIC, "stack overflow detected");
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom)
            .field("size", &self.size)
            .finish()
    }
}

// Attributes
// ---------------------------------------------------------------------------

/// The construction-time attributes of a thread.
pub struct Attributes<Traits: KernelTraits> {
    name: &'static str,
    priority: u8,
    stack_size: usize,
    stack_addr: Option<NonNull<u8>>,
    clock: Option<&'static Clock<Traits>>,
}

impl<Traits: KernelTraits> Attributes<Traits> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            priority: priority::NORMAL,
            stack_size: 0,
            stack_addr: None,
            clock: None,
        }
    }

    /// The initial assigned priority. Defaults to [`priority::NORMAL`].
    pub const fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// The stack size in bytes. Zero (the default) selects
    /// `KernelTraits::STACK_DEFAULT_SIZE`.
    pub const fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Use a caller-supplied stack instead of allocating one from the
    /// default memory resource. The range must stay valid and unused by
    /// anything else for the lifetime of the thread.
    pub fn stack(mut self, addr: NonNull<u8>, size: usize) -> Self {
        self.stack_addr = Some(addr);
        self.stack_size = size;
        self
    }

    /// The clock timed waits issued by this thread run against. Defaults
    /// to the systick clock.
    pub const fn clock(mut self, clock: &'static Clock<Traits>) -> Self {
        self.clock = Some(clock);
        self
    }
}

// Thread control block
// ---------------------------------------------------------------------------

/// *Thread control block* — the state data of a thread.
#[repr(C)]
pub struct ThreadCb<Traits: PortThreading + KernelTraits> {
    /// Port-specific per-thread state.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that context-switch code can refer to it easily.
    pub port_thread_state: Traits::PortThreadState,

    name: &'static str,

    pub(crate) entry_point: fn(usize) -> usize,
    pub(crate) entry_param: usize,

    stack: Stack,

    /// The clock this thread's timed waits run against.
    pub(crate) clock: &'static Clock<Traits>,

    /// The priority given by construction or `sched_prio`.
    pub(crate) assigned_priority: CpuLockCell<Traits, u8>,

    /// The priority the scheduler acts on: the maximum of
    /// `assigned_priority` and any boost applied by a mutex locking
    /// protocol. Determines the thread's position in the ready queue and
    /// in priority-ordered wait queues; reposition the thread after
    /// updating this.
    pub(crate) effective_priority: CpuLockCell<Traits, u8>,

    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// Links this thread into the ready queue (`Ready`) or the reap list
    /// (`Terminated`, detached).
    pub(crate) sched_link: CpuLockCell<Traits, Option<Link<ThreadRef<Traits>>>>,

    /// The wait state of the thread.
    pub(crate) wait: ThreadWait<Traits>,

    /// The thread's signal flags.
    pub(crate) sig_flags: CpuLockCell<Traits, u32>,

    /// Set by `cancel`; the current blocking call returns `Interrupted`.
    pub(crate) interrupted: CpuLockCell<Traits, bool>,

    /// The per-thread `errno` cell. Only the owning thread writes it.
    errno: AtomicI32,

    /// The thread that created this one, or `None` once the parent is
    /// destroyed (non-owning back-reference).
    pub(crate) parent: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// Threads created by this one.
    pub(crate) children: CpuLockCell<Traits, ListHead<ThreadRef<Traits>>>,

    /// Links this thread into its parent's `children` list.
    pub(crate) child_link: CpuLockCell<Traits, Option<Link<ThreadRef<Traits>>>>,

    /// The thread waiting in `join` for this one, if any (non-owning
    /// back-reference). At most one joiner may exist at a time.
    pub(crate) joiner: CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// When set, termination reaps the thread without needing a joiner.
    pub(crate) detached: CpuLockCell<Traits, bool>,

    /// The value passed to `exit` (or returned by the thread function),
    /// kept until a joiner or the reaper observes the termination.
    pub(crate) exit_value: CpuLockCell<Traits, Option<usize>>,

    /// The number of mutexes this thread currently owns.
    pub(crate) acquired_mutexes: CpuLockCell<Traits, u32>,

    /// The last mutex locked by the thread; heads the singly linked list
    /// of all mutexes it holds (chained by `Mutex::prev_mutex_held`).
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<mutex::MutexRef<Traits>>>,
}

// Safety: All mutable state is behind `CpuLockCell`s or atomics; the raw
// stack range is owned by the thread.
unsafe impl<Traits: PortThreading + KernelTraits> Send for ThreadCb<Traits> {}
unsafe impl<Traits: PortThreading + KernelTraits> Sync for ThreadCb<Traits> {}

impl<Traits: PortThreading + KernelTraits> ThreadCb<Traits> {
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// The entry point and its argument, used by the port to set up the
    /// initial context.
    pub fn entry(&self) -> (fn(usize) -> usize, usize) {
        (self.entry_point, self.entry_param)
    }

    pub(crate) fn errno_cell(&self) -> &AtomicI32 {
        &self.errno
    }
}

impl<Traits: PortThreading + KernelTraits> KernelObject for ThreadCb<Traits> {
    fn name(&self) -> &'static str {
        self.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("assigned_priority", &self.assigned_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` used to access a `children` list.
macro_rules! children_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new(
            $head,
            // Safety: Children are registry-held; a destroyed child is
            //         unlinked first.
            unsafe { UnsafeRefPool::new() },
            |cb: &ThreadCb<Traits>| &cb.child_link,
            $key,
        )
    };
}

// Public handle
// ---------------------------------------------------------------------------

/// An owned handle to a thread.
///
/// Dropping the handle without joining detaches the thread; the idle
/// thread destroys it after it terminates.
pub struct Thread<Traits: KernelTraits> {
    cb: Arc<ThreadCb<Traits>>,
    joined: bool,
}

impl<Traits: KernelTraits> Thread<Traits> {
    /// Create a thread and make it schedulable.
    ///
    /// If the attributes supply a stack, it is used as-is; otherwise a
    /// stack of the configured size is allocated from the default memory
    /// resource. The thread starts executing `entry(param)` as soon as
    /// the scheduler elects it; returning from `entry` is equivalent to
    /// calling [`this_thread::exit`](crate::this_thread::exit) with the
    /// returned value.
    pub fn build(
        attr: Attributes<Traits>,
        entry: fn(usize) -> usize,
        param: usize,
    ) -> Result<Self, CreateThreadError> {
        if Traits::is_interrupt_context() {
            return Err(CreateThreadError::PermissionDenied);
        }

        if attr.priority == priority::NONE || attr.priority >= priority::ERROR {
            return Err(CreateThreadError::Invalid);
        }

        // Resolve the stack before touching any kernel state.
        let stack = if let Some(addr) = attr.stack_addr {
            if attr.stack_size < Traits::STACK_MIN_SIZE {
                return Err(CreateThreadError::Invalid);
            }
            Stack::new(addr, attr.stack_size, None)
        } else {
            let size = if attr.stack_size == 0 {
                Traits::STACK_DEFAULT_SIZE
            } else {
                attr.stack_size.max(Traits::STACK_MIN_SIZE)
            };

            let resource = {
                let lock = klock::lock_cpu::<Traits>()
                    .map_err(|_| CreateThreadError::PermissionDenied)?;
                Traits::state().default_resource.get(&*lock)
            };
            let resource = resource.ok_or(CreateThreadError::OutOfMemory)?;
            let bottom = resource
                .allocate(size, STACK_ALIGN)
                .ok_or(CreateThreadError::OutOfMemory)?;
            Stack::new(bottom, size, Some(resource))
        };

        stack.paint();

        let clock = attr
            .clock
            .unwrap_or_else(|| &Traits::state().sysclock);

        let cb = Arc::new(ThreadCb::<Traits> {
            port_thread_state: Init::INIT,
            name: attr.name,
            entry_point: entry,
            entry_param: param,
            stack,
            clock,
            assigned_priority: CpuLockCell::new(attr.priority),
            effective_priority: CpuLockCell::new(attr.priority),
            st: CpuLockCell::new(ThreadSt::Undefined),
            sched_link: CpuLockCell::new(None),
            wait: Init::INIT,
            sig_flags: CpuLockCell::new(0),
            interrupted: CpuLockCell::new(false),
            errno: AtomicI32::new(0),
            parent: CpuLockCell::new(None),
            children: CpuLockCell::new(ListHead::new()),
            child_link: CpuLockCell::new(None),
            joiner: CpuLockCell::new(None),
            detached: CpuLockCell::new(false),
            exit_value: CpuLockCell::new(None),
            acquired_mutexes: CpuLockCell::new(0),
            last_mutex_held: CpuLockCell::new(None),
        });

        let thread = Ref::new(&*cb);

        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        // Keep the control block alive until the `Destroyed` transition.
        Traits::state()
            .registry
            .write(&mut *lock)
            .push(Arc::clone(&cb));

        // Record the creating thread as the parent.
        if Traits::is_thread_context() {
            if let Some(parent) = Traits::state().running_thread.get(&*lock) {
                // Safety: `parent` is registry-held
                let parent_cb = unsafe { parent.0.as_ref() };
                cb.parent.replace(&mut *lock, Some(parent));
                let mut accessor = children_accessor!(&parent_cb.children, &mut lock);
                accessor.push_back(thread);
            }
        }

        // Safety: CPU Lock active, the thread is in the Undefined state
        unsafe { Traits::initialize_thread_state(&cb) };
        cb.st.replace(&mut *lock, ThreadSt::Inactive);

        sched::make_ready(&mut lock, thread);

        // If the new thread has a higher priority, perform a context
        // switch.
        sched::unlock_cpu_and_check_preemption(lock);

        Ok(Self { cb, joined: false })
    }

    pub(crate) fn cb_ref(&self) -> ThreadRef<Traits> {
        Ref::new(&*self.cb)
    }

    /// The thread's stack descriptor.
    pub fn stack(&self) -> &Stack {
        self.cb.stack()
    }

    /// The scheduling state of the thread.
    pub fn state(&self) -> ThreadSt {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.cb.st.get(&*lock)
    }

    /// The assigned priority.
    pub fn priority(&self) -> u8 {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.cb.assigned_priority.get(&*lock)
    }

    /// The effective priority (the assigned priority plus any boost
    /// applied by a mutex locking protocol).
    pub fn effective_priority(&self) -> u8 {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.cb.effective_priority.get(&*lock)
    }

    /// Whether the interrupted flag is set.
    pub fn interrupted(&self) -> bool {
        let lock = klock::lock_cpu::<Traits>().unwrap();
        self.cb.interrupted.get(&*lock)
    }

    /// Change the assigned priority.
    ///
    /// A thread in the Ready state is re-linked at the position the new
    /// priority dictates; lowering the running thread's priority may cause
    /// it to be preempted. A boost applied by a mutex stays in effect: the
    /// effective priority becomes the maximum of the new assigned priority
    /// and the boost.
    pub fn sched_prio(&self, priority: u8) -> Result<(), SetPriorityError> {
        if Traits::is_interrupt_context() {
            return Err(SetPriorityError::PermissionDenied);
        }
        if priority == priority::NONE || priority >= priority::ERROR {
            return Err(SetPriorityError::Invalid);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let thread = self.cb_ref();

        match self.cb.st.get(&*lock) {
            ThreadSt::Undefined | ThreadSt::Terminated | ThreadSt::Destroyed => {
                return Err(SetPriorityError::BadState)
            }
            _ => {}
        }

        self.cb.assigned_priority.replace(&mut *lock, priority);

        let effective =
            mutex::evaluate_thread_effective_priority(&mut lock, thread, priority);
        set_effective_priority_and_reposition(&mut lock, thread, effective);

        // A lowered running thread may now be preempted; a raised ready
        // thread may preempt.
        sched::unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Block until the thread terminates, then reclaim it and return its
    /// exit value. Only one thread may join a given thread.
    pub fn join(&mut self) -> Result<usize, JoinError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_waitable_context::<Traits>(&mut lock)?;

        let me = Traits::state().running_thread.get(&*lock).unwrap();
        let target = self.cb_ref();

        if me == target {
            return Err(JoinError::Deadlock);
        }

        loop {
            // A detached thread belongs to the reaper, not to a joiner.
            if self.cb.detached.get(&*lock) {
                return Err(JoinError::BadState);
            }

            match self.cb.st.get(&*lock) {
                ThreadSt::Destroyed => return Err(JoinError::BadState),
                ThreadSt::Terminated => break,
                _ => {}
            }

            match self.cb.joiner.get(&*lock) {
                Some(j) if j != me => return Err(JoinError::BadState),
                _ => {}
            }

            self.cb.joiner.replace(&mut *lock, Some(me));

            match wait::wait_no_queue(&mut lock, WaitPayload::Join(target)) {
                Ok(_) => {}
                Err(WaitError::Interrupted) => {
                    self.cb.joiner.replace(&mut *lock, None);
                    return Err(JoinError::Interrupted);
                }
            }
        }

        self.cb.joiner.replace(&mut *lock, None);
        let value = self.cb.exit_value.get(&*lock).unwrap_or(0);

        let arc = destroy_thread(&mut lock, target);
        self.joined = true;
        drop(lock);
        drop(arc);

        Ok(value)
    }

    /// Mark the thread so that termination reaps it without a joiner. If
    /// the thread has already terminated, it is reaped immediately.
    pub fn detach(&mut self) -> Result<(), DetachError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        match self.cb.st.get(&*lock) {
            ThreadSt::Destroyed => Err(DetachError::BadState),
            ThreadSt::Terminated => {
                if self.cb.detached.get(&*lock) {
                    // It was detached before terminating, so it is already
                    // queued for the reaper.
                    self.joined = true;
                    return Ok(());
                }
                let arc = destroy_thread(&mut lock, self.cb_ref());
                self.joined = true;
                drop(lock);
                drop(arc);
                Ok(())
            }
            _ => {
                self.cb.detached.replace(&mut *lock, true);
                Ok(())
            }
        }
    }

    /// Set the interrupted flag and wake the thread from any blocking
    /// primitive, which then returns `Interrupted`. Interrupt-safe.
    pub fn cancel(&self) -> Result<(), CancelError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        match self.cb.st.get(&*lock) {
            ThreadSt::Undefined | ThreadSt::Terminated | ThreadSt::Destroyed => {
                return Err(CancelError::BadState)
            }
            _ => {}
        }

        self.cb.interrupted.replace(&mut *lock, true);

        if self.cb.st.get(&*lock) == ThreadSt::Waiting {
            wait::interrupt_thread(
                &mut lock,
                self.cb_ref(),
                Err(WaitTimeoutError::Interrupted),
            )
            .unwrap();

            // The thread is now awake; check dispatch
            sched::unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    /// If the thread is Waiting, unlink it from its wait queue (and
    /// timeout list) and make it Ready. The woken wait re-examines its
    /// condition, so a resumed wait that is not yet satisfied simply
    /// blocks again. Interrupt-safe.
    pub fn resume(&self) -> Result<(), ResumeError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        match wait::interrupt_thread(&mut lock, self.cb_ref(), Ok(())) {
            Ok(()) => {
                sched::unlock_cpu_and_check_preemption(lock);
                Ok(())
            }
            Err(BadObjectStateError::BadState) => Err(ResumeError::BadState),
        }
    }

    /// OR `mask` into the thread's signal flags, waking it if it is
    /// waiting for any/all of those flags. Returns the previous flags.
    /// Interrupt-safe.
    pub fn sig_raise(&self, mask: u32) -> Result<u32, RaiseSigError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        match self.cb.st.get(&*lock) {
            ThreadSt::Undefined | ThreadSt::Destroyed => return Err(RaiseSigError::BadState),
            _ => {}
        }

        let orig = self.cb.sig_flags.get(&*lock);
        let flags = orig | mask;
        self.cb.sig_flags.replace(&mut *lock, flags);

        // Wake the thread if its wake-up condition is now fulfilled. The
        // woken wait re-polls (and possibly clears) the flags itself.
        let should_wake = self.cb.st.get(&*lock) == ThreadSt::Waiting
            && wait::with_current_wait_payload(&mut lock, &self.cb, |payload| {
                matches!(
                    payload,
                    Some(&WaitPayload::Sig { mask, mode }) if sig_satisfied(flags, mask, mode)
                )
            });

        if should_wake {
            wait::interrupt_thread(&mut lock, self.cb_ref(), Ok(())).unwrap();
            sched::unlock_cpu_and_check_preemption(lock);
        }

        Ok(orig)
    }

    /// AND the thread's signal flags with `!mask` (`mask == sig::ANY`
    /// clears all). Returns the previous flags.
    pub fn sig_clear(&self, mask: u32) -> Result<u32, ClearSigError> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        match self.cb.st.get(&*lock) {
            ThreadSt::Undefined | ThreadSt::Destroyed => return Err(ClearSigError::BadState),
            _ => {}
        }

        let orig = self.cb.sig_flags.get(&*lock);
        let flags = if mask == sig::ANY { 0 } else { orig & !mask };
        self.cb.sig_flags.replace(&mut *lock, flags);

        Ok(orig)
    }

    /// Read the selected signal flags; with [`SigMode::CLEAR`], also clear
    /// them.
    pub fn sig_get(&self, mask: u32, mode: SigMode) -> u32 {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        let orig = self.cb.sig_flags.get(&*lock);
        let selected = if mask == sig::ANY { orig } else { orig & mask };

        if mode.contains(SigMode::CLEAR) {
            let flags = if mask == sig::ANY { 0 } else { orig & !mask };
            self.cb.sig_flags.replace(&mut *lock, flags);
        }

        selected
    }
}

impl<Traits: KernelTraits> KernelObject for Thread<Traits> {
    fn name(&self) -> &'static str {
        self.cb.name
    }
}

impl<Traits: KernelTraits> fmt::Debug for Thread<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread").field("cb", &self.cb).finish()
    }
}

impl<Traits: KernelTraits> Drop for Thread<Traits> {
    fn drop(&mut self) {
        if !self.joined {
            let _ = self.detach();
        }
    }
}

// Wait condition predicates
// ---------------------------------------------------------------------------

/// Check whether `flags` satisfies the wait condition `(mask, mode)`,
/// without mutating anything.
pub(crate) fn sig_satisfied(flags: u32, mask: u32, mode: SigMode) -> bool {
    if mask == sig::ANY {
        flags != 0
    } else if mode.contains(SigMode::ALL) {
        (flags & mask) == mask
    } else {
        (flags & mask) != 0
    }
}

/// Given a wait condition `(mask, mode)`, check if `flags` satisfies it.
/// On success, clear the satisfied bits if requested by `mode` and return
/// the original value.
pub(crate) fn poll_sig_core(flags: &mut u32, mask: u32, mode: SigMode) -> Option<u32> {
    if !sig_satisfied(*flags, mask, mode) {
        return None;
    }

    let orig = *flags;
    if mode.contains(SigMode::CLEAR) {
        if mask == sig::ANY {
            *flags = 0;
        } else {
            *flags &= !mask;
        }
    }
    Some(orig)
}

// Scheduler support
// ---------------------------------------------------------------------------

/// Transition the currently running thread into the Waiting state.
/// Returns when woken up.
///
/// The current context must be waitable (this function doesn't check
/// that).
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(lock: &mut CpuLockGuard<Traits>) {
    let thread = Traits::state().running_thread.get(&**lock).unwrap();
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    debug_assert_eq!(cb.st.get(&**lock), ThreadSt::Running);
    cb.st.replace(&mut **lock, ThreadSt::Waiting);

    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`.
        // The token behind `lock` is not used while the lock is released.
        // Safety: We have the CPU Lock and will re-acquire it below.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Safety: Re-acquire the CPU Lock relinquished above
        unsafe { Traits::enter_cpu_lock() };

        if cb.st.get(&**lock) == ThreadSt::Running {
            break;
        }

        debug_assert_eq!(cb.st.get(&**lock), ThreadSt::Waiting);
    }
}

/// Update a thread's effective priority and reposition it in whatever
/// priority-ordered queue it currently occupies.
pub(crate) fn set_effective_priority_and_reposition<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
    effective: u8,
) {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    let old = cb.effective_priority.replace(&mut **lock, effective);
    if old == effective {
        return;
    }

    match cb.st.get(&**lock) {
        ThreadSt::Ready => {
            let queue = &Traits::state().ready_queue;
            queue.remove_thread(lock, thread);
            queue.push_back_thread(lock, thread);
        }
        ThreadSt::Waiting => {
            wait::reorder_wait_of_thread(lock, cb);
        }
        _ => {}
    }
}

// Lifecycle internals
// ---------------------------------------------------------------------------

/// Get a `ListAccessorCell` used to access the reap list.
macro_rules! reap_list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new(
            $head,
            // Safety: Reap-list members are registry-held
            unsafe { UnsafeRefPool::new() },
            |cb: &ThreadCb<Traits>| &cb.sched_link,
            $key,
        )
    };
}

/// Run the thread function and exit. The port's entry trampoline calls
/// this on the first dispatch of a thread.
///
/// # Safety
///
/// Must be called exactly once per thread activation, on that thread, in
/// a thread context.
pub unsafe fn thread_entry<Traits: KernelTraits>(thread: NonNull<ThreadCb<Traits>>) -> ! {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.as_ref() };
    let value = (cb.entry_point)(cb.entry_param);
    exit_current_thread::<Traits>(value)
}

/// Terminate the calling thread, storing `value` for a joiner.
///
/// Held robust mutexes are abandoned (their next owner observes
/// `OwnerDead`); held non-robust mutexes become permanently unusable.
/// Never returns.
pub fn exit_current_thread<Traits: KernelTraits>(value: usize) -> ! {
    debug_assert!(Traits::is_thread_context());

    // If the CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let thread = Traits::state().running_thread.get(&*lock).unwrap();
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    // Abandon held mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(&mut lock, thread);
    debug_assert_eq!(cb.acquired_mutexes.get(&*lock), 0);

    cb.exit_value.replace(&mut *lock, Some(value));

    debug_assert_eq!(cb.st.get(&*lock), ThreadSt::Running);
    cb.st.replace(&mut *lock, ThreadSt::Terminated);

    if let Some(joiner) = cb.joiner.get(&*lock) {
        // The joiner reaps us once it observes the termination. It may
        // have been woken by a cancellation in the meantime, in which case
        // there is nothing to do here.
        match wait::interrupt_thread(&mut lock, joiner, Ok(())) {
            Ok(()) | Err(BadObjectStateError::BadState) => {}
        }
    } else if cb.detached.get(&*lock) {
        // No joiner will ever come; leave the reclamation to the idle
        // thread.
        let mut accessor = reap_list_accessor!(&Traits::state().reap_list, &mut lock);
        accessor.push_back(thread);
    }

    // Erase the running thread
    Traits::state().running_thread.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: CPU Lock active, the current thread is no longer the
    // running thread
    unsafe { Traits::exit_and_dispatch(cb) }
}

/// Destroy every thread in the reap list. Called by the idle thread.
pub(crate) fn reap_terminated<Traits: KernelTraits>() {
    loop {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        let thread = {
            let mut accessor = reap_list_accessor!(&Traits::state().reap_list, &mut lock);
            accessor.pop_front()
        };

        let thread = if let Some(t) = thread {
            t
        } else {
            return;
        };

        let arc = destroy_thread(&mut lock, thread);
        drop(lock);
        drop(arc);
    }
}

/// Transition `thread` (which must be Terminated and out of every wait or
/// ready queue) to Destroyed: release its stack, orphan its children,
/// unlink it from its parent, and remove it from the registry.
///
/// The returned `Arc` is possibly the last reference; the caller drops it
/// after releasing the CPU Lock.
pub(crate) fn destroy_thread<Traits: KernelTraits>(
    lock: &mut CpuLockGuard<Traits>,
    thread: ThreadRef<Traits>,
) -> Arc<ThreadCb<Traits>> {
    // Safety: `thread` is registry-held
    let cb = unsafe { thread.0.as_ref() };

    debug_assert_eq!(cb.st.get(&**lock), ThreadSt::Terminated);
    cb.st.replace(&mut **lock, ThreadSt::Destroyed);

    // Orphan the children: their parent back-references must not dangle.
    loop {
        let child = {
            let mut accessor = children_accessor!(&cb.children, &mut *lock);
            accessor.pop_front()
        };
        let child = if let Some(c) = child {
            c
        } else {
            break;
        };
        // Safety: `child` is registry-held
        unsafe { child.0.as_ref() }.parent.replace(&mut **lock, None);
    }

    // Unlink from the parent's children list.
    if let Some(parent) = cb.parent.replace(&mut **lock, None) {
        // Safety: `parent` is registry-held
        let parent_cb = unsafe { parent.0.as_ref() };
        let mut accessor = children_accessor!(&parent_cb.children, &mut *lock);
        accessor.remove(thread);
    }

    // Release an arena-allocated stack.
    if let Some(resource) = cb.stack.resource {
        // Safety: The range was allocated from `resource` with these
        // parameters and nothing references it anymore
        unsafe { resource.deallocate(cb.stack.bottom, cb.stack.size, STACK_ALIGN) };
    }

    // Remove the registry entry keeping the control block alive.
    let registry = Traits::state().registry.write(&mut **lock);
    let index = registry
        .iter()
        .position(|a| core::ptr::eq(&**a, cb))
        .expect("destroyed thread is not in the registry");
    registry.swap_remove(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_stack(size: usize) -> Stack {
        let region = Box::leak(vec![0u8; size].into_boxed_slice());
        Stack::new(NonNull::new(region.as_mut_ptr()).unwrap(), size, None)
    }

    #[test]
    fn stack_paint_and_available() {
        let stack = leaked_stack(256);
        stack.paint();
        assert_eq!(stack.available(), 256);
        stack.check_bottom_canary();

        // Simulate the thread touching the upper half of its stack.
        unsafe {
            stack.bottom().add(128).write_bytes(0xa5, 128);
        }
        assert_eq!(stack.available(), 128);
        stack.check_bottom_canary();
    }

    #[test]
    #[should_panic(expected = "stack overflow detected")]
    fn blown_canary_is_fatal() {
        let stack = leaked_stack(64);
        stack.paint();
        unsafe { stack.bottom().write(0) };
        stack.check_bottom_canary();
    }

    #[test]
    fn sig_predicates() {
        // `sig_raise(m); sig_raise(m)` must be equivalent to a single
        // raise; this is what makes that hold at the predicate level.
        let mut flags = 0x6u32;
        assert!(sig_satisfied(flags, 0x6, SigMode::ALL));
        assert!(sig_satisfied(flags, 0x2, SigMode::ANY));
        assert!(!sig_satisfied(flags, 0x9, SigMode::ALL));
        assert!(sig_satisfied(flags, 0x9, SigMode::ANY));
        assert!(!sig_satisfied(0, sig::ANY, SigMode::ANY));
        assert!(sig_satisfied(0x100, sig::ANY, SigMode::ALL));

        // Clearing is limited to the satisfied mask.
        let orig = poll_sig_core(&mut flags, 0x2, SigMode::ANY | SigMode::CLEAR).unwrap();
        assert_eq!(orig, 0x6);
        assert_eq!(flags, 0x4);

        // An unsatisfied poll clears nothing.
        assert!(poll_sig_core(&mut flags, 0x2, SigMode::ALL | SigMode::CLEAR).is_none());
        assert_eq!(flags, 0x4);

        // `mask == sig::ANY` + CLEAR wipes every flag.
        let orig = poll_sig_core(&mut flags, sig::ANY, SigMode::ANY | SigMode::CLEAR).unwrap();
        assert_eq!(orig, 0x4);
        assert_eq!(flags, 0);
    }

    #[test]
    fn priority_constants_span_the_range() {
        assert_eq!(priority::NONE, 0);
        assert_eq!(priority::IDLE, 16);
        assert_eq!(priority::LOWEST, 32);
        assert_eq!(priority::NORMAL, 96);
        assert_eq!(priority::HIGHEST, 223);
        assert_eq!(priority::ISR, 239);
        assert_eq!(priority::ERROR, 255);
        assert!(priority::IDLE < priority::LOWEST);
        assert!(priority::HIGHEST < priority::ISR);
    }
}
