//! # Retiring Slot
//!
//! An atomic pointer that exception handlers can read without locking,
//! allocating or touching thread-local state.
//!
//! Replaced values are never freed while the slot lives: they move to a
//! retired list and are dropped with the slot. A handler that loaded the old
//! pointer on another thread therefore never sees it dangle. Writers (install,
//! uninstall, path updates) are rare, so the retired list stays short.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

/// Lock-free readable slot holding at most one `T`.
pub struct RetiringSlot<T>
{
    current: AtomicPtr<T>,
    retired: Mutex<Vec<Box<T>>>,
    // Readers on other threads get `&T`
    _owns: PhantomData<Box<T>>,
}

impl<T> Default for RetiringSlot<T>
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<T> RetiringSlot<T>
{
    /// An empty slot.
    #[must_use]
    pub const fn new() -> Self
    {
        Self {
            current: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
            _owns: PhantomData,
        }
    }

    /// The current value. Safe to call from a signal handler.
    #[must_use]
    pub fn get(&self) -> Option<&T>
    {
        let current = self.current.load(Ordering::Acquire);
        // SAFETY: non-null pointers came from `Box::into_raw` and live until the slot drops
        unsafe { current.as_ref() }
    }

    /// Whether the slot holds a value.
    #[must_use]
    pub fn is_occupied(&self) -> bool
    {
        !self.current.load(Ordering::Acquire).is_null()
    }

    /// Store `value`, retiring whatever was there.
    pub fn replace(&self, value: T)
    {
        let previous = self.current.swap(Box::into_raw(Box::new(value)), Ordering::AcqRel);
        self.retire(previous);
    }

    /// Store `value` only if the slot is empty; hands it back otherwise.
    ///
    /// ## Errors
    ///
    /// `Err(value)` when another value is already stored.
    pub fn claim(&self, value: T) -> Result<(), T>
    {
        let fresh = Box::into_raw(Box::new(value));
        match self
            .current
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: `fresh` was never published
            Err(_) => Err(*unsafe { Box::from_raw(fresh) }),
        }
    }

    /// Empty the slot. Returns whether it held a value.
    pub fn clear(&self) -> bool
    {
        let previous = self.current.swap(ptr::null_mut(), Ordering::AcqRel);
        let occupied = !previous.is_null();
        self.retire(previous);
        occupied
    }

    fn retire(&self, previous: *mut T)
    {
        if previous.is_null() {
            return;
        }
        // SAFETY: `previous` came from `Box::into_raw` and is no longer published
        let boxed = unsafe { Box::from_raw(previous) };
        self.retired.lock().unwrap_or_else(PoisonError::into_inner).push(boxed);
    }
}

impl<T> Drop for RetiringSlot<T>
{
    fn drop(&mut self)
    {
        let current = *self.current.get_mut();
        if !current.is_null() {
            // SAFETY: exclusive access; nothing can read the slot any more
            drop(unsafe { Box::from_raw(current) });
        }
    }
}
