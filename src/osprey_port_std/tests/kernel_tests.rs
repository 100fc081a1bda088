//! Kernel scenario tests, run on the simulator port.
//!
//! Every test binds its own system type (and therefore its own kernel and
//! port state) through `use_port!`, boots the kernel with a private arena,
//! runs a small application, and asserts on the recorded trace after
//! shutdown.
//!
//! Dispatch decisions triggered by kernel operations are synchronous in
//! the simulator, so the traces below are deterministic. Only the
//! tick-driven tests rely on real time, with generous margins.
use std::sync::Mutex;

use osprey_kernel::mem::{FirstFitTop, MemoryResource};

fn leak_resource(bytes: usize) -> &'static FirstFitTop {
    let region = Box::leak(vec![0u8; bytes].into_boxed_slice());
    Box::leak(Box::new(FirstFitTop::with_region("arena", region)))
}

fn boot<Traits: osprey_port_std::PortInstance>(app: fn()) {
    let _ = env_logger::builder().is_test(true).try_init();
    Traits::port_state().port_boot::<Traits>(leak_resource(128 * 1024), app);
}

// ---------------------------------------------------------------------------

mod priority_inversion {
    use super::*;
    use osprey_kernel::{
        mutex::{self, Mutex as KMutex, Protocol},
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static MUTEX: KMutex<System> =
        KMutex::new(mutex::Attributes::new("m").protocol(Protocol::Inherit));
    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static L_THREAD: Mutex<Option<Thread<System>>> = Mutex::new(None);

    fn tr(s: &'static str) {
        TRACE.lock().unwrap().push(s);
    }

    fn l_entry(_: usize) -> usize {
        MUTEX.lock().unwrap();
        tr("L:lock");

        // H preempts immediately and blocks on the mutex, boosting us.
        let h = Thread::<System>::build(
            thread::Attributes::new("H").priority(200),
            h_entry,
            0,
        )
        .unwrap();

        let m = Thread::<System>::build(
            thread::Attributes::new("M").priority(100),
            m_entry,
            0,
        )
        .unwrap();
        tr("L:created-M");

        // M must not have run: the boost keeps us ahead of it.
        MUTEX.unlock().unwrap();

        // H and M have both run to completion by now.
        drop(h);
        drop(m);
        tr("L:end");

        assert_eq!(
            *TRACE.lock().unwrap(),
            [
                "L:lock",
                "H:start",
                "H:block",
                "L:created-M",
                "H:locked",
                "H:exit",
                "M:run",
                "L:end",
            ],
        );
        assert!(!MUTEX.is_locked());

        osprey_port_std::shutdown::<System>();
        0
    }

    fn h_entry(_: usize) -> usize {
        tr("H:start");

        // The owner holds the lock; the failed attempt applies the boost.
        assert!(MUTEX.try_lock().is_err());
        let l = L_THREAD.lock().unwrap();
        let l = l.as_ref().unwrap();
        assert_eq!(l.priority(), 50);
        assert_eq!(l.effective_priority(), 200);
        drop(l);

        tr("H:block");
        MUTEX.lock().unwrap();
        tr("H:locked");

        // The boost died with the unlock.
        let l = L_THREAD.lock().unwrap();
        assert_eq!(l.as_ref().unwrap().effective_priority(), 50);
        drop(l);

        MUTEX.unlock().unwrap();
        tr("H:exit");
        0
    }

    fn m_entry(_: usize) -> usize {
        tr("M:run");
        0
    }

    fn app() {
        let l = Thread::<System>::build(thread::Attributes::new("L").priority(50), l_entry, 0).unwrap();
        *L_THREAD.lock().unwrap() = Some(l);
    }

    #[test]
    fn priority_inversion_avoidance() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod recursive_mutex {
    use super::*;
    use osprey_kernel::{
        error::{TryLockMutexError, UnlockMutexError},
        mutex::{self, Mutex as KMutex, MutexType},
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static MUTEX: KMutex<System> = KMutex::new(
        mutex::Attributes::new("m")
            .type_(MutexType::Recursive)
            .max_count(3),
    );

    fn entry(_: usize) -> usize {
        MUTEX.lock().unwrap();
        MUTEX.lock().unwrap();
        MUTEX.lock().unwrap();
        assert_eq!(MUTEX.try_lock(), Err(TryLockMutexError::Again));

        MUTEX.unlock().unwrap();
        MUTEX.unlock().unwrap();
        assert!(MUTEX.is_locked());
        MUTEX.unlock().unwrap();
        assert!(!MUTEX.is_locked());

        // The owner is cleared; a foreign unlock is now an error.
        assert_eq!(MUTEX.unlock(), Err(UnlockMutexError::PermissionDenied));

        // And the mutex is usable again from scratch.
        MUTEX.lock().unwrap();
        MUTEX.unlock().unwrap();

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(Thread::<System>::build(thread::Attributes::new("t"), entry, 0).unwrap());
    }

    #[test]
    fn recursion_accounting() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod timed_lock {
    use super::*;
    use osprey_kernel::{
        error::TimedLockMutexError,
        mutex::{self, Mutex as KMutex, Protocol},
        this_thread,
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static MUTEX: KMutex<System> =
        KMutex::new(mutex::Attributes::new("m").protocol(Protocol::Inherit));
    static A_THREAD: Mutex<Option<Thread<System>>> = Mutex::new(None);

    fn a_entry(_: usize) -> usize {
        MUTEX.lock().unwrap();

        let mut b = Thread::<System>::build(thread::Attributes::new("B").priority(150), b_entry, 0)
            .unwrap();

        // B is blocked in `timed_lock` with a 10-tick timeout; sleep well
        // past it.
        this_thread::sleep_for::<System>(40).unwrap();

        assert_eq!(b.join().unwrap(), 1);

        // B's request boosted us; the timeout must have decayed it.
        let a = A_THREAD.lock().unwrap();
        assert_eq!(a.as_ref().unwrap().effective_priority(), 100);
        drop(a);

        assert!(MUTEX.is_locked());
        MUTEX.unlock().unwrap();

        osprey_port_std::shutdown::<System>();
        0
    }

    fn b_entry(_: usize) -> usize {
        // The owner never gives the mutex up within the timeout.
        let t0 = osprey_kernel::system_clock::<System>().now();
        let result = MUTEX.timed_lock(10);
        let t1 = osprey_kernel::system_clock::<System>().now();

        assert_eq!(result, Err(TimedLockMutexError::TimedOut));
        assert!(t1 - t0 >= 10, "woke after {} ticks", t1 - t0);
        assert!(MUTEX.is_locked());
        1
    }

    fn app() {
        let a = Thread::<System>::build(thread::Attributes::new("A").priority(100), a_entry, 0).unwrap();
        *A_THREAD.lock().unwrap() = Some(a);
    }

    #[test]
    fn timed_lock_timeout() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod errorcheck_mutex {
    use super::*;
    use osprey_kernel::{
        error::{LockMutexError, UnlockMutexError},
        mutex::{self, Mutex as KMutex, MutexType},
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static MUTEX: KMutex<System> =
        KMutex::new(mutex::Attributes::new("m").type_(MutexType::Errorcheck));

    fn entry(_: usize) -> usize {
        MUTEX.lock().unwrap();
        // The relock is reported instead of blocking.
        assert_eq!(MUTEX.lock(), Err(LockMutexError::Deadlock));
        MUTEX.unlock().unwrap();
        assert_eq!(MUTEX.unlock(), Err(UnlockMutexError::PermissionDenied));

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(Thread::<System>::build(thread::Attributes::new("t"), entry, 0).unwrap());
    }

    #[test]
    fn self_deadlock_is_detected() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod signals {
    use super::*;
    use osprey_kernel::{
        this_thread,
        thread::{self, sig, SigMode, Thread, ThreadSt},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static T_THREAD: Mutex<Option<Thread<System>>> = Mutex::new(None);

    fn tr(s: &'static str) {
        TRACE.lock().unwrap().push(s);
    }

    fn t_entry(_: usize) -> usize {
        tr("T:wait");
        let oflags =
            this_thread::sig_wait::<System>(0x6, SigMode::ALL | SigMode::CLEAR).unwrap();
        tr("T:woken");

        // Both raises are visible, and CLEAR consumed them — the mask is
        // empty again.
        assert_eq!(oflags, 0x6);
        assert!(this_thread::try_sig_wait::<System>(sig::ANY, SigMode::empty()).is_err());
        0
    }

    fn r_entry(_: usize) -> usize {
        let t_guard = T_THREAD.lock().unwrap();
        let t = t_guard.as_ref().unwrap();

        // Raising half the mask leaves the waiter blocked.
        assert_eq!(t.sig_raise(0x2).unwrap(), 0);
        assert_eq!(t.state(), ThreadSt::Waiting);
        tr("R:raised-2");

        // Raising it again changes nothing (signals are idempotent).
        assert_eq!(t.sig_raise(0x2).unwrap(), 0x2);
        assert_eq!(t.sig_get(sig::ANY, SigMode::empty()), 0x2);
        assert_eq!(t.state(), ThreadSt::Waiting);

        // An unrelated flag neither wakes the waiter nor survives a
        // clear (which is likewise idempotent).
        t.sig_raise(0x8).unwrap();
        assert_eq!(t.state(), ThreadSt::Waiting);
        assert_eq!(t.sig_clear(0x8).unwrap(), 0xa);
        assert_eq!(t.sig_clear(0x8).unwrap(), 0x2);

        // Completing the mask wakes the waiter, which preempts us here.
        t.sig_raise(0x4).unwrap();
        tr("R:done");
        drop(t_guard);
        0
    }

    fn main_entry(_: usize) -> usize {
        let t = Thread::<System>::build(thread::Attributes::new("T").priority(150), t_entry, 0).unwrap();
        *T_THREAD.lock().unwrap() = Some(t);

        let mut r =
            Thread::<System>::build(thread::Attributes::new("R").priority(100), r_entry, 0).unwrap();
        r.join().unwrap();

        let mut t_guard = T_THREAD.lock().unwrap();
        t_guard.as_mut().unwrap().join().unwrap();
        drop(t_guard);

        assert_eq!(
            *TRACE.lock().unwrap(),
            ["T:wait", "R:raised-2", "T:woken", "R:done"],
        );

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(
            Thread::<System>::build(thread::Attributes::new("main").priority(50), main_entry, 0)
                .unwrap(),
        );
    }

    #[test]
    fn sig_wait_all_clear() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod join_and_reap {
    use super::*;
    use osprey_kernel::{
        this_thread,
        thread::{self, Thread},
    };
    use osprey_port_std::PortInstance;

    osprey_port_std::use_port!(unsafe struct System);

    static RESOURCE: Mutex<Option<&'static FirstFitTop>> = Mutex::new(None);

    fn child_entry(arg: usize) -> usize {
        arg * 2
    }

    fn parent_entry(_: usize) -> usize {
        let resource = RESOURCE.lock().unwrap().unwrap();
        let baseline = resource.max_size();

        // Joined child: the stack comes back with the join.
        let mut child =
            Thread::<System>::build(thread::Attributes::new("child").priority(80), child_entry, 21)
                .unwrap();
        assert!(resource.max_size() < baseline);
        assert_eq!(child.join().unwrap(), 42);
        assert_eq!(resource.max_size(), baseline);

        // Detached child: the idle thread reaps it.
        let detached =
            Thread::<System>::build(thread::Attributes::new("detached").priority(80), child_entry, 1)
                .unwrap();
        drop(detached); // dropping the handle detaches

        this_thread::sleep_for::<System>(20).unwrap();
        assert_eq!(resource.max_size(), baseline);

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(
            Thread::<System>::build(thread::Attributes::new("parent").priority(100), parent_entry, 0)
                .unwrap(),
        );
    }

    #[test]
    fn join_value_and_stack_reclamation() {
        let _ = env_logger::builder().is_test(true).try_init();
        let resource = leak_resource(128 * 1024);
        *RESOURCE.lock().unwrap() = Some(resource);
        System::port_state().port_boot::<System>(resource, app);
    }
}

// ---------------------------------------------------------------------------

mod semaphore_wakeup_order {
    use super::*;
    use osprey_kernel::{
        semaphore::{self, Semaphore},
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static SEM: Semaphore<System> = Semaphore::new(semaphore::Attributes::new("sem"));
    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn tr(s: &'static str) {
        TRACE.lock().unwrap().push(s);
    }

    fn w1_entry(_: usize) -> usize {
        SEM.wait().unwrap();
        tr("W1");
        0
    }

    fn w2_entry(_: usize) -> usize {
        SEM.wait().unwrap();
        tr("W2");
        0
    }

    fn p_entry(_: usize) -> usize {
        let mut w1 =
            Thread::<System>::build(thread::Attributes::new("W1").priority(150), w1_entry, 0).unwrap();
        let mut w2 =
            Thread::<System>::build(thread::Attributes::new("W2").priority(200), w2_entry, 0).unwrap();

        assert_eq!(SEM.value(), 0);

        // Wakeup order follows waiter priority, not arrival order.
        SEM.post().unwrap();
        SEM.post().unwrap();

        w1.join().unwrap();
        w2.join().unwrap();
        assert_eq!(*TRACE.lock().unwrap(), ["W2", "W1"]);
        assert_eq!(SEM.value(), 0);

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(Thread::<System>::build(thread::Attributes::new("P").priority(100), p_entry, 0).unwrap());
    }

    #[test]
    fn highest_priority_waiter_wakes_first() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod condvar_handshake {
    use super::*;
    use osprey_kernel::{
        condvar::Condvar,
        mutex::{self, Mutex as KMutex},
        thread::{self, Thread},
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    osprey_port_std::use_port!(unsafe struct System);

    static MUTEX: KMutex<System> = KMutex::new(mutex::Attributes::new("m"));
    static COND: Condvar<System> = Condvar::new("cond");
    static FLAG: AtomicBool = AtomicBool::new(false);

    fn consumer_entry(_: usize) -> usize {
        MUTEX.lock().unwrap();
        while !FLAG.load(Ordering::Relaxed) {
            COND.wait(&MUTEX).unwrap();
        }
        MUTEX.unlock().unwrap();
        7
    }

    fn producer_entry(_: usize) -> usize {
        let mut consumer =
            Thread::<System>::build(thread::Attributes::new("consumer").priority(150), consumer_entry, 0)
                .unwrap();

        MUTEX.lock().unwrap();
        FLAG.store(true, Ordering::Relaxed);
        COND.notify_one();
        MUTEX.unlock().unwrap();

        assert_eq!(consumer.join().unwrap(), 7);

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(
            Thread::<System>::build(thread::Attributes::new("producer").priority(100), producer_entry, 0)
                .unwrap(),
        );
    }

    #[test]
    fn wait_releases_and_reacquires_the_mutex() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod yield_round_robin {
    use super::*;
    use osprey_kernel::{
        this_thread,
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn spinner(name: usize) -> usize {
        for _ in 0..3 {
            TRACE
                .lock()
                .unwrap()
                .push(if name == 0 { "A" } else { "B" });
            this_thread::yield_now::<System>();
        }
        0
    }

    fn main_entry(_: usize) -> usize {
        let mut a =
            Thread::<System>::build(thread::Attributes::new("A").priority(100), spinner, 0).unwrap();
        let mut b =
            Thread::<System>::build(thread::Attributes::new("B").priority(100), spinner, 1).unwrap();

        a.join().unwrap();
        b.join().unwrap();

        // Equal priorities round-robin at yield points.
        assert_eq!(*TRACE.lock().unwrap(), ["A", "B", "A", "B", "A", "B"]);

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(
            Thread::<System>::build(thread::Attributes::new("main").priority(50), main_entry, 0)
                .unwrap(),
        );
    }

    #[test]
    fn equal_priorities_round_robin() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod scheduler_lock {
    use super::*;
    use osprey_kernel::{
        error::LockMutexError,
        mutex::{self, Mutex as KMutex},
        sched,
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static MUTEX: KMutex<System> = KMutex::new(mutex::Attributes::new("m"));
    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn tr(s: &'static str) {
        TRACE.lock().unwrap().push(s);
    }

    fn h_entry(_: usize) -> usize {
        tr("H");
        0
    }

    fn l_entry(_: usize) -> usize {
        sched::lock::<System>();
        assert!(sched::locked::<System>());

        // The newly created higher-priority thread cannot preempt us while
        // the scheduler is locked.
        let h = Thread::<System>::build(thread::Attributes::new("H").priority(200), h_entry, 0).unwrap();
        tr("L:locked-phase");

        // Blocking primitives are rejected in this state.
        assert_eq!(MUTEX.lock(), Err(LockMutexError::PermissionDenied));

        sched::unlock::<System>();
        // The deferred dispatch has happened by the time `unlock` returns.
        tr("L:after");

        drop(h);
        assert_eq!(*TRACE.lock().unwrap(), ["L:locked-phase", "H", "L:after"]);

        // Same game with the RAII forms: the uncritical section lets the
        // deferred dispatch through early.
        {
            let _cs = sched::CriticalSection::<System>::enter();
            let h2 =
                Thread::<System>::build(thread::Attributes::new("H2").priority(200), h2_entry, 0).unwrap();
            tr("L:cs");
            {
                let _ucs = sched::UncriticalSection::<System>::enter();
                // H2 ran on entry to the uncritical section.
                tr("L:ucs");
            }
            assert!(sched::locked::<System>());
            drop(h2);
        }
        assert!(!sched::locked::<System>());
        assert_eq!(
            *TRACE.lock().unwrap(),
            ["L:locked-phase", "H", "L:after", "L:cs", "H2", "L:ucs"],
        );

        osprey_port_std::shutdown::<System>();
        0
    }

    fn h2_entry(_: usize) -> usize {
        tr("H2");
        0
    }

    fn app() {
        drop(Thread::<System>::build(thread::Attributes::new("L").priority(100), l_entry, 0).unwrap());
    }

    #[test]
    fn scheduler_lock_defers_preemption() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod cancellation {
    use super::*;
    use osprey_kernel::{
        error::WaitSemaphoreError,
        semaphore::{self, Semaphore},
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static SEM: Semaphore<System> = Semaphore::new(semaphore::Attributes::new("sem"));

    fn victim_entry(_: usize) -> usize {
        match SEM.wait() {
            Err(WaitSemaphoreError::Interrupted) => 7,
            other => panic!("unexpected wait result: {:?}", other),
        }
    }

    fn killer_entry(_: usize) -> usize {
        let mut victim =
            Thread::<System>::build(thread::Attributes::new("victim").priority(150), victim_entry, 0)
                .unwrap();

        // The victim ran first (higher priority) and is blocked by now.
        assert!(!victim.interrupted());

        // A bare `resume` is a spurious wakeup: the wait re-examines its
        // condition and blocks again.
        victim.resume().unwrap();

        victim.cancel().unwrap();

        assert_eq!(victim.join().unwrap(), 7);
        // Delivering the interruption consumed the flag.
        assert!(!victim.interrupted());

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(
            Thread::<System>::build(thread::Attributes::new("killer").priority(100), killer_entry, 0)
                .unwrap(),
        );
    }

    #[test]
    fn cancel_interrupts_a_blocking_wait() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod sleep_and_clock {
    use super::*;
    use osprey_kernel::{
        error::TimedWaitSemaphoreError,
        semaphore::{self, Semaphore},
        system_clock, this_thread,
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static SEM: Semaphore<System> = Semaphore::new(semaphore::Attributes::new("sem"));

    fn entry(_: usize) -> usize {
        // The `errno` cell is per-thread and sticks.
        this_thread::set_errno::<System>(42);
        assert_eq!(this_thread::errno::<System>(), 42);

        // `sleep_for` returns no earlier than the requested duration.
        let t0 = system_clock::<System>().now();
        this_thread::sleep_for::<System>(20).unwrap();
        let t1 = system_clock::<System>().now();
        assert!(t1 - t0 >= 20, "slept only {} ticks", t1 - t0);
        assert_eq!(this_thread::errno::<System>(), 42);

        // Same bound for a timed wait that times out.
        let t0 = system_clock::<System>().now();
        assert_eq!(SEM.timed_wait(10), Err(TimedWaitSemaphoreError::TimedOut));
        let t1 = system_clock::<System>().now();
        assert!(t1 - t0 >= 10, "timed out after only {} ticks", t1 - t0);

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(Thread::<System>::build(thread::Attributes::new("t"), entry, 0).unwrap());
    }

    #[test]
    fn tick_driven_timeouts() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod robust_mutex {
    use super::*;
    use osprey_kernel::{
        error::{LockMutexError, TryLockMutexError},
        mutex::{self, Mutex as KMutex, Robustness},
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static M1: KMutex<System> =
        KMutex::new(mutex::Attributes::new("m1").robustness(Robustness::Robust));
    static M2: KMutex<System> =
        KMutex::new(mutex::Attributes::new("m2").robustness(Robustness::Robust));

    fn dying_entry(arg: usize) -> usize {
        if arg == 1 {
            M1.lock().unwrap();
        } else {
            M2.lock().unwrap();
        }
        // Terminate while holding the lock.
        0
    }

    fn main_entry(_: usize) -> usize {
        // Recovery path: OWNER_DEAD → consistent → unlock → usable.
        let mut d =
            Thread::<System>::build(thread::Attributes::new("D1").priority(150), dying_entry, 1).unwrap();
        d.join().unwrap();

        assert_eq!(M1.lock(), Err(LockMutexError::OwnerDead));
        // We own it nevertheless.
        assert!(M1.is_locked());
        M1.consistent().unwrap();
        M1.unlock().unwrap();
        M1.lock().unwrap();
        M1.unlock().unwrap();

        // Lockout path: unlocking without `consistent` bricks the mutex.
        let mut d =
            Thread::<System>::build(thread::Attributes::new("D2").priority(150), dying_entry, 2).unwrap();
        d.join().unwrap();

        assert_eq!(M2.lock(), Err(LockMutexError::OwnerDead));
        M2.unlock().unwrap();
        assert_eq!(M2.lock(), Err(LockMutexError::NotRecoverable));
        assert_eq!(M2.try_lock(), Err(TryLockMutexError::NotRecoverable));

        // `reset` is the only way back.
        M2.reset().unwrap();
        M2.lock().unwrap();
        M2.unlock().unwrap();

        osprey_port_std::shutdown::<System>();
        0
    }

    fn app() {
        drop(
            Thread::<System>::build(thread::Attributes::new("main").priority(100), main_entry, 0)
                .unwrap(),
        );
    }

    #[test]
    fn owner_death_and_recovery() {
        boot::<System>(app);
    }
}

// ---------------------------------------------------------------------------

mod priority_ceiling {
    use super::*;
    use osprey_kernel::{
        error::TryLockMutexError,
        mutex::{self, Mutex as KMutex, Protocol},
        thread::{self, Thread},
    };

    osprey_port_std::use_port!(unsafe struct System);

    static MUTEX: KMutex<System> = KMutex::new(
        mutex::Attributes::new("m")
            .protocol(Protocol::Protect)
            .priority_ceiling(180),
    );
    static T_THREAD: Mutex<Option<Thread<System>>> = Mutex::new(None);

    fn t_entry(_: usize) -> usize {
        MUTEX.lock().unwrap();

        // Holding a protect mutex raises us to its ceiling.
        let t = T_THREAD.lock().unwrap();
        assert_eq!(t.as_ref().unwrap().effective_priority(), 180);
        drop(t);

        MUTEX.unlock().unwrap();
        let t = T_THREAD.lock().unwrap();
        assert_eq!(t.as_ref().unwrap().effective_priority(), 100);
        drop(t);

        // The ceiling itself can be queried and updated.
        assert_eq!(MUTEX.prio_ceiling(), 180);
        assert_eq!(MUTEX.set_prio_ceiling(190), Ok(180));
        assert_eq!(MUTEX.prio_ceiling(), 190);

        osprey_port_std::shutdown::<System>();
        0
    }

    fn over_entry(_: usize) -> usize {
        // A thread above the ceiling may not take the lock at all.
        assert_eq!(MUTEX.try_lock(), Err(TryLockMutexError::Invalid));
        0
    }

    fn app() {
        let mut over = Thread::<System>::build(
            thread::Attributes::new("over").priority(200),
            over_entry,
            0,
        )
        .unwrap();
        over.detach().unwrap();

        let t = Thread::<System>::build(thread::Attributes::new("T").priority(100), t_entry, 0).unwrap();
        *T_THREAD.lock().unwrap() = Some(t);
    }

    #[test]
    fn ceiling_is_enforced_and_boosts() {
        boot::<System>(app);
    }
}
