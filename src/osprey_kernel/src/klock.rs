//! Kernel state locking mechanism.
//!
//! Every mutation of scheduler-visible state happens inside the
//! interrupt-mask critical section. The section is represented by
//! [`CpuLockGuard`], and the data it protects lives in [`CpuLockCell`]s
//! that can only be read or written through a token borrowed from the
//! guard. Code that forgets to mask interrupts before touching kernel
//! state therefore does not compile.
use core::{fmt, marker::PhantomData, mem, ops};

use crate::{error::BadContextError, utils::intrusive_list::CellLike, utils::Init, PortThreading};

/// The key that "unlocks" [`CpuLockCell`]. There is at most one instance
/// per system type, owned by the active [`CpuLockGuard`].
#[non_exhaustive]
pub(crate) struct CpuLockToken<Traits> {
    _phantom: PhantomData<Traits>,
}

/// The keyhole type for the [`tokenlock::TokenLock`]s inside
/// [`CpuLockCell`].
pub(crate) struct CpuLockKeyhole<Traits> {
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for CpuLockKeyhole<Traits> {
    fn clone(&self) -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<Traits> Copy for CpuLockKeyhole<Traits> {}

impl<Traits> fmt::Debug for CpuLockKeyhole<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuLockKeyhole").finish()
    }
}

// This is safe because `CpuLockToken` can only be borrowed from
// `CpuLockGuard`, and there is at most one `CpuLockGuard` per system type
// at any point of time.
unsafe impl<Traits> tokenlock::Token<CpuLockKeyhole<Traits>> for CpuLockToken<Traits> {
    fn eq_id(&self, _: &CpuLockKeyhole<Traits>) -> bool {
        true
    }
}

impl<Traits> Init for CpuLockKeyhole<Traits> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

/// Cell type holding scheduler-visible state, accessible only through the
/// [`CpuLockToken`] borrowed from an active [`CpuLockGuard`].
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(
    tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>,
);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(tokenlock::TokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits: PortThreading, T> CpuLockCell<Traits, T> {
    /// Clone the contents.
    #[inline]
    pub(crate) fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Clone,
    {
        self.0.read(token).clone()
    }

    /// Replace the contents, returning the previous value.
    #[inline]
    pub(crate) fn replace(&self, token: &mut CpuLockToken<Traits>, value: T) -> T {
        mem::replace(self.0.write(token), value)
    }

    /// Mutate the contents in place.
    #[inline]
    pub(crate) fn replace_with(
        &self,
        token: &mut CpuLockToken<Traits>,
        f: impl FnOnce(&mut T),
    ) {
        f(self.0.write(token));
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = lock_cpu::<Traits>() {
            f.debug_tuple("CpuLockCell")
                .field(self.0.read(&*lock))
                .finish()
        } else {
            write!(f, "CpuLockCell(< locked >)")
        }
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'a, Element: Clone, Traits: PortThreading> CellLike<&'a mut CpuLockGuard<Traits>>
    for CpuLockCell<Traits, Element>
{
    type Target = Element;

    fn get(&self, key: &&'a mut CpuLockGuard<Traits>) -> Self::Target {
        self.0.read(&***key).clone()
    }
    fn set(&self, key: &mut &'a mut CpuLockGuard<Traits>, value: Self::Target) {
        *self.0.write(&mut ***key) = value;
    }
}

/// If the current context is in a CPU Lock state, return
/// `Err(PermissionDenied)`.
pub(crate) fn expect_cpu_lock_inactive<Traits: PortThreading>() -> Result<(), BadContextError> {
    if Traits::is_cpu_lock_active() {
        Err(BadContextError::PermissionDenied)
    } else {
        Ok(())
    }
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `PermissionDenied` if the kernel is already in a CPU Lock state.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    expect_cpu_lock_inactive::<Traits>()?;

    // Safety: CPU Lock is currently inactive, and it's us (the kernel) who
    // are going to control the CPU Lock state
    unsafe {
        Traits::enter_cpu_lock();
    }

    // Safety: We just entered a CPU Lock state
    Ok(unsafe { assume_cpu_lock() })
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state. There must be no other
/// instance of `CpuLockGuard` at the point of the call.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        token: CpuLockToken {
            _phantom: PhantomData,
        },
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel)
        // who are currently controlling the CPU Lock state
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
