//! # Kernel synchronization primitives
//!
//! The two building blocks every global subsystem rests on:
//!
//! - [`SpinLock`] — a test-and-set lock for short critical sections.
//! - [`SyncOnceCell`] — an initialize-once cell for process-wide singletons.
//!
//! Both are self-contained (no external crates) and usable from host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
