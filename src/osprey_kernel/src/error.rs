//! Error kinds returned by the kernel.
//!
//! Every public operation returns a dedicated error enum listing exactly the
//! kinds it can produce. All enums share the [`ResultCode`] numbering so a
//! C-style shim can map them to integer codes without translation tables.
use core::fmt;

/// The numbering shared by all error enums in this crate. All errors are
/// returned; no out-of-band unwinding is used anywhere in the kernel.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed successfully. Not used by the error enums;
    /// defined so shims have a name for `0`.
    Success = 0,
    /// The operation is not allowed in the current context (interrupt
    /// handler, or the scheduler is locked).
    PermissionDenied = -1,
    /// A parameter is out of range (bad priority, priority above a mutex's
    /// ceiling, zero-sized stack, …).
    Invalid = -2,
    /// A recursion or counting limit was reached.
    Again = -3,
    /// The operation would deadlock on the calling thread itself.
    Deadlock = -4,
    /// The resource is unavailable right now (`try_*` flavors only).
    WouldBlock = -5,
    /// The timeout duration elapsed (`timed_*` flavors only).
    TimedOut = -6,
    /// The blocked thread was cancelled or interrupted.
    Interrupted = -7,
    /// A robust mutex was acquired, but its previous holder terminated
    /// while holding it.
    OwnerDead = -8,
    /// The robust mutex is in a permanently unusable state.
    NotRecoverable = -9,
    /// The backing memory resource could not satisfy an allocation.
    OutOfMemory = -10,
    /// The object is in a state that does not permit the operation.
    BadState = -11,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_error! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_error! {
    /// `PermissionDenied`, raised when an operation is attempted from an
    /// interrupt context or while the scheduler is locked.
    #[into(CreateThreadError)]
    #[into(JoinError)]
    #[into(SetPriorityError)]
    #[into(WaitSigError)]
    #[into(TrySigError)]
    #[into(TimedWaitSigError)]
    #[into(SleepError)]
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(TimedLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(ConsistentMutexError)]
    #[into(ResetMutexError)]
    #[into(WaitSemaphoreError)]
    #[into(TryWaitSemaphoreError)]
    #[into(TimedWaitSemaphoreError)]
    #[into(WaitCondvarError)]
    #[into(TimedWaitCondvarError)]
    pub(crate) enum BadContextError {
        PermissionDenied,
    }
}

define_error! {
    /// `BadState`
    #[into(JoinError)]
    #[into(DetachError)]
    #[into(CancelError)]
    #[into(ResumeError)]
    #[into(RaiseSigError)]
    #[into(ClearSigError)]
    #[into(SetPriorityError)]
    pub(crate) enum BadObjectStateError {
        BadState,
    }
}

define_error! {
    /// The result of a non-timed wait operation, set by whoever wakes the
    /// thread up.
    #[into(JoinError)]
    #[into(WaitSigError)]
    #[into(LockMutexError)]
    #[into(WaitSemaphoreError)]
    #[into(WaitCondvarError)]
    pub(crate) enum WaitError {
        Interrupted,
    }
}

define_error! {
    /// The result of a timed wait operation, set by whoever wakes the
    /// thread up.
    #[into(TimedWaitSigError)]
    #[into(TimedLockMutexError)]
    #[into(TimedWaitSemaphoreError)]
    #[into(TimedWaitCondvarError)]
    pub(crate) enum WaitTimeoutError {
        Interrupted,
        TimedOut,
    }
}

define_error! {
    /// The error conditions [`try_lock`](crate::mutex::Mutex::try_lock)'s
    /// core can detect besides "unavailable now". Used internally by the
    /// mutex implementation.
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(TimedLockMutexError)]
    pub(crate) enum LockCoreError {
        Invalid,
        Again,
        Deadlock,
        NotRecoverable,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::build`](crate::thread::Thread::build).
    pub enum CreateThreadError {
        PermissionDenied,
        Invalid,
        OutOfMemory,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::join`](crate::thread::Thread::join).
    pub enum JoinError {
        PermissionDenied,
        Deadlock,
        Interrupted,
        BadState,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::detach`](crate::thread::Thread::detach).
    pub enum DetachError {
        BadState,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::cancel`](crate::thread::Thread::cancel).
    pub enum CancelError {
        BadState,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::resume`](crate::thread::Thread::resume).
    pub enum ResumeError {
        BadState,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::sched_prio`](crate::thread::Thread::sched_prio).
    pub enum SetPriorityError {
        PermissionDenied,
        Invalid,
        BadState,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::sig_raise`](crate::thread::Thread::sig_raise).
    pub enum RaiseSigError {
        BadState,
    }
}

define_error! {
    /// Errors possibly returned by [`Thread::sig_clear`](crate::thread::Thread::sig_clear).
    pub enum ClearSigError {
        BadState,
    }
}

define_error! {
    /// Errors possibly returned by [`this_thread::sig_wait`](crate::this_thread::sig_wait).
    pub enum WaitSigError {
        PermissionDenied,
        Interrupted,
    }
}

define_error! {
    /// Errors possibly returned by [`this_thread::try_sig_wait`](crate::this_thread::try_sig_wait).
    pub enum TrySigError {
        PermissionDenied,
        WouldBlock,
    }
}

define_error! {
    /// Errors possibly returned by [`this_thread::timed_sig_wait`](crate::this_thread::timed_sig_wait).
    pub enum TimedWaitSigError {
        PermissionDenied,
        Interrupted,
        TimedOut,
    }
}

define_error! {
    /// Errors possibly returned by [`this_thread::sleep_for`](crate::this_thread::sleep_for).
    pub enum SleepError {
        PermissionDenied,
        Interrupted,
    }
}

define_error! {
    /// Errors possibly returned by [`Mutex::lock`](crate::mutex::Mutex::lock).
    pub enum LockMutexError {
        PermissionDenied,
        Invalid,
        Again,
        Deadlock,
        Interrupted,
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Errors possibly returned by [`Mutex::try_lock`](crate::mutex::Mutex::try_lock).
    pub enum TryLockMutexError {
        PermissionDenied,
        Invalid,
        Again,
        Deadlock,
        WouldBlock,
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Errors possibly returned by [`Mutex::timed_lock`](crate::mutex::Mutex::timed_lock).
    pub enum TimedLockMutexError {
        PermissionDenied,
        Invalid,
        Again,
        Deadlock,
        Interrupted,
        TimedOut,
        OwnerDead,
        NotRecoverable,
    }
}

define_error! {
    /// Errors possibly returned by [`Mutex::unlock`](crate::mutex::Mutex::unlock).
    pub enum UnlockMutexError {
        PermissionDenied,
        NotRecoverable,
    }
}

define_error! {
    /// Errors possibly returned by [`Mutex::consistent`](crate::mutex::Mutex::consistent).
    pub enum ConsistentMutexError {
        PermissionDenied,
        Invalid,
    }
}

define_error! {
    /// Errors possibly returned by [`Mutex::reset`](crate::mutex::Mutex::reset).
    pub enum ResetMutexError {
        PermissionDenied,
    }
}

/// Errors possibly returned by
/// [`Mutex::prio_ceiling`](crate::mutex::Mutex::prio_ceiling), which locks
/// the mutex, updates the ceiling, and unlocks it.
pub type SetPrioCeilingError = LockMutexError;

define_error! {
    /// Errors possibly returned by [`Semaphore::post`](crate::semaphore::Semaphore::post).
    pub enum PostSemaphoreError {
        Again,
    }
}

define_error! {
    /// Errors possibly returned by [`Semaphore::wait`](crate::semaphore::Semaphore::wait).
    pub enum WaitSemaphoreError {
        PermissionDenied,
        Interrupted,
    }
}

define_error! {
    /// Errors possibly returned by [`Semaphore::try_wait`](crate::semaphore::Semaphore::try_wait).
    pub enum TryWaitSemaphoreError {
        PermissionDenied,
        WouldBlock,
    }
}

define_error! {
    /// Errors possibly returned by [`Semaphore::timed_wait`](crate::semaphore::Semaphore::timed_wait).
    pub enum TimedWaitSemaphoreError {
        PermissionDenied,
        Interrupted,
        TimedOut,
    }
}

define_error! {
    /// Errors possibly returned by [`Condvar::wait`](crate::condvar::Condvar::wait).
    pub enum WaitCondvarError {
        PermissionDenied,
        Interrupted,
    }
}

define_error! {
    /// Errors possibly returned by [`Condvar::timed_wait`](crate::condvar::Condvar::timed_wait).
    pub enum TimedWaitCondvarError {
        PermissionDenied,
        Interrupted,
        TimedOut,
    }
}

/// Convert `e` to [`WaitError`], panicking if `e == TimedOut`.
#[inline]
pub(crate) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Interrupted => WaitError::Interrupted,
        WaitTimeoutError::TimedOut => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_round_trip() {
        assert_eq!(ResultCode::from(LockMutexError::Deadlock), ResultCode::Deadlock);
        assert_eq!(
            ResultCode::from(TimedLockMutexError::TimedOut),
            ResultCode::TimedOut
        );
        assert_eq!(
            ResultCode::from(CreateThreadError::OutOfMemory),
            ResultCode::OutOfMemory
        );
    }

    #[test]
    fn discriminants_match_result_code() {
        assert_eq!(LockMutexError::Interrupted as i8, ResultCode::Interrupted as i8);
        assert_eq!(TryLockMutexError::WouldBlock as i8, ResultCode::WouldBlock as i8);
        assert_eq!(UnlockMutexError::NotRecoverable as i8, ResultCode::NotRecoverable as i8);
    }

    #[test]
    fn suberror_conversions() {
        let e: JoinError = WaitError::Interrupted.into();
        assert_eq!(e, JoinError::Interrupted);
        let e: TimedLockMutexError = WaitTimeoutError::TimedOut.into();
        assert_eq!(e, TimedLockMutexError::TimedOut);
        let e: LockMutexError = BadContextError::PermissionDenied.into();
        assert_eq!(e, LockMutexError::PermissionDenied);
    }
}
