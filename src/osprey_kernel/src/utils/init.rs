use core::{cell::Cell, cell::UnsafeCell, sync::atomic};

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
///
/// This trait is subject to the API stability guarantee.
pub trait Init {
    /// The default value.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self;
}

impl<T: 'static> Init for &'_ [T] {
    const INIT: Self = &[];
}

impl Init for &'_ str {
    const INIT: Self = "";
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init> Init for UnsafeCell<T> {
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T: Init> Init for Cell<T> {
    const INIT: Self = Cell::new(T::INIT);
}

impl<T> Init for atomic::AtomicPtr<T> {
    const INIT: Self = atomic::AtomicPtr::new(core::ptr::null_mut());
}

impl<T: Init, E> Init for Result<T, E> {
    const INIT: Self = Ok(T::INIT);
}

macro_rules! impl_init {
    ($($ty:ty => $value:expr,)*) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    char => '\0',
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    u128 => 0,
    usize => 0,
    i8 => 0,
    i16 => 0,
    i32 => 0,
    i64 => 0,
    i128 => 0,
    isize => 0,
    f32 => 0.0,
    f64 => 0.0,
    () => (),
    atomic::AtomicBool => atomic::AtomicBool::new(false),
    atomic::AtomicU32 => atomic::AtomicU32::new(0),
    atomic::AtomicUsize => atomic::AtomicUsize::new(0),
    atomic::AtomicI32 => atomic::AtomicI32::new(0),
}
