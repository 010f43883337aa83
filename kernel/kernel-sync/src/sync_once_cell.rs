use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A minimal, lock-free, spin-based `OnceCell`.
///
/// Lazily initializes a `T` at most once and then provides shared access to
/// it. The first caller to observe the uninitialized state runs the
/// initializer; all others spin until the value becomes available.
///
/// # Concurrency
///
/// - A single initializer wins via `compare_exchange`.
/// - Readers observe readiness via `Acquire` loads after the value is
///   published with `Release`.
///
/// # Panics
///
/// If the initializer panics, the cell remains stuck in the `INITING` state
/// and all future calls spin forever. Ensure the initializer cannot panic.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    /// Creates a new, empty cell.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if the cell has been initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY guarantees the write is complete.
            Some(unsafe { &*(*self.value.get()).as_ptr() })
        } else {
            None
        }
    }

    /// Stores `value` if the cell is empty; returns `Err(value)` otherwise.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        unsafe {
            (*self.value.get()).write(value);
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Initializes the cell at most once and returns `&T`.
    ///
    /// If another caller is initializing concurrently, spins until the value
    /// becomes ready.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let v = init();
            unsafe {
                (*self.value.get()).write(v);
            }
            // Publish the value before marking READY.
            self.state.store(READY, Ordering::Release);
            // SAFETY: just written by us.
            return unsafe { &*(*self.value.get()).as_ptr() };
        }

        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // SAFETY: READY.
        unsafe { &*(*self.value.get()).as_ptr() }
    }
}

// Safety: shared only after READY; initialization is single-writer.
unsafe impl<T: Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let cell: SyncOnceCell<u32> = SyncOnceCell::new();
        assert!(cell.get().is_none());
    }

    #[test]
    fn set_once() {
        let cell = SyncOnceCell::new();
        assert!(cell.set(7).is_ok());
        assert_eq!(cell.set(8), Err(8));
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn get_or_init_runs_once() {
        let cell = SyncOnceCell::new();
        let a = *cell.get_or_init(|| 42);
        let b = *cell.get_or_init(|| unreachable!());
        assert_eq!(a, b);
    }
}
