//! Memory resources
//!
//! The kernel does not use a global heap. Dynamically sized kernel
//! objects — thread stacks in particular — are carved out of a *memory
//! resource*, a small capability object implementing [`MemoryResource`].
//! The resource used by default is recorded at boot
//! ([`PortToKernel::boot`](crate::PortToKernel::boot)); this is the one
//! place in the core where dynamic dispatch is genuinely needed, so the
//! protocol is object-safe and the kernel stores
//! `&'static dyn MemoryResource`.
pub mod first_fit_top;

pub use self::first_fit_top::FirstFitTop;

use core::ptr::NonNull;

/// The protocol of a pluggable allocator.
pub trait MemoryResource: Send + Sync {
    /// Allocate `bytes` bytes aligned to `align` (a power of two).
    ///
    /// Returns `None` if no block fits — exhaustion is not an error
    /// condition here; the caller decides.
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a block obtained from [`MemoryResource::allocate`].
    /// Deallocation never fails.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a call to `allocate` on the same resource with
    /// the same `bytes` and `align`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize);

    /// The largest allocation that could currently succeed, or 0 if none.
    fn max_size(&self) -> usize;

    /// Return the resource to its initial state, discarding every
    /// outstanding allocation.
    fn reset(&self);
}
