//! Extra synchronization primitives
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

/// Primitive for global state initialized during boot. This is similar to
/// [`spin::Once`], but optimized for the case of values that are known to be
/// initialized in a specific order, such as memory allocators and state used in
/// interrupt handlers.
///
/// # Example
///
/// ```rust
/// use tern_common::sync::Global;
///
/// // In some_subsystem:
///
/// struct Driver {
///     base_address: usize,
/// }
///
/// pub fn init(base_address: usize) -> &'static Driver {
///     static GLOBAL: Global<Driver> = Global::new();
///     GLOBAL.init(Driver { base_address })
/// }
/// ```
pub struct Global<T> {
    initialized: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Global<T> {
    /// Create a new uninitialized `Global`
    pub const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Attempt to initialize this global with `value`, returning `Err` if it
    /// has already been initialized.
    pub fn try_init(&self, value: T) -> Result<&T, ()> {
        self.initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ())?;

        // SAFETY: at this point, we know `value` is uninitialized, and that any
        // other thread attempting initialization will fail because we have set
        // `initialized`
        let value_ref = unsafe { (*self.value.get()).write(value) };
        Ok(value_ref)
    }

    /// Initialize this global to `value`
    ///
    /// # Panics
    /// If already initialized
    pub fn init(&self, value: T) -> &T {
        self.try_init(value).expect("global already initialized")
    }

    /// Get a reference to the value if initialized, otherwise `None`
    pub fn try_get(&self) -> Option<&T> {
        if self.initialized.load(Ordering::Acquire) {
            // SAFETY: we know that this value has been initialized from checking
            // `initialized`
            Some(unsafe { &*(*self.value.get()).as_ptr() })
        } else {
            None
        }
    }

    /// Get a reference to the value
    ///
    /// # Panics
    /// If not yet initialized
    pub fn get(&self) -> &T {
        self.try_get().expect("global not initialized")
    }
}

// Same unsafe impls as spin::Once
unsafe impl<T: Send + Sync> Sync for Global<T> {}
unsafe impl<T: Send> Send for Global<T> {}

impl<T> Drop for Global<T> {
    fn drop(&mut self) {
        if *self.initialized.get_mut() {
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod test {
    use super::Global;

    #[test]
    fn test_init_then_get() {
        let global: Global<u32> = Global::new();
        assert!(global.try_get().is_none());

        global.init(42);
        assert_eq!(global.try_get(), Some(&42));
        assert_eq!(*global.get(), 42);
    }

    #[test]
    fn test_double_init_fails() {
        let global: Global<u32> = Global::new();
        assert!(global.try_init(1).is_ok());
        assert!(global.try_init(2).is_err());
        assert_eq!(*global.get(), 1);
    }
}
