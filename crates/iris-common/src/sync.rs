//! Lock helpers shared by the background loops.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Background loops must keep running after a sibling thread panicked while
/// holding a shared lock; the data behind these locks stays consistent per
/// operation.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
