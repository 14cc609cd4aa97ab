// ABOUTME: Small helper around std mutexes.
// ABOUTME: Recovers poisoned locks instead of panicking on the hot path.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
