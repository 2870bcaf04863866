//! Synchronization primitives wrapping `std::sync` without poisoning.
//!
//! Every mutable shared object in the runtime carries its own mutex; a
//! panicking handler must not wedge the rest of the process, so poisoned
//! locks are recovered by unwrapping into the inner guard.

use std::sync as std_sync;
use std::time::Duration;

/// A mutual exclusion primitive that wraps `std::sync::Mutex`.
///
/// Unlike `std::sync::Mutex`, this does not support poisoning.
pub struct Mutex<T: ?Sized> {
  inner: std_sync::Mutex<T>,
}

impl<T> Mutex<T> {
  /// Creates a new mutex in an unlocked state ready for use.
  #[inline]
  pub const fn new(value: T) -> Self {
    Self { inner: std_sync::Mutex::new(value) }
  }
}

impl<T: ?Sized> Mutex<T> {
  /// Acquires a mutex, blocking the current thread until it is able to do so.
  ///
  /// This function does not propagate poisoning, so it will always succeed.
  #[inline]
  pub fn lock(&self) -> MutexGuard<'_, T> {
    MutexGuard { inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
  }

  /// Attempts to acquire the mutex without blocking.
  #[inline]
  pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
    match self.inner.try_lock() {
      Ok(value) => Some(MutexGuard { inner: value }),
      Err(err) => match err {
        std_sync::TryLockError::WouldBlock => None,
        std_sync::TryLockError::Poisoned(e) => {
          Some(MutexGuard { inner: e.into_inner() })
        }
      },
    }
  }
}

/// An RAII implementation of a "scoped lock" of a mutex.
///
/// When this structure is dropped (falls out of scope), the lock will be unlocked.
pub struct MutexGuard<'a, T: ?Sized> {
  inner: std_sync::MutexGuard<'a, T>,
}

impl<T: ?Sized> std::ops::Deref for MutexGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    &self.inner
  }
}

impl<T: ?Sized> std::ops::DerefMut for MutexGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    &mut self.inner
  }
}

/// Condition variable paired with [`Mutex`], also without poisoning.
pub struct Condvar {
  inner: std_sync::Condvar,
}

impl Condvar {
  #[inline]
  pub const fn new() -> Self {
    Self { inner: std_sync::Condvar::new() }
  }

  /// Blocks the current thread until this condition variable is notified.
  ///
  /// Spurious wakeups are possible, callers loop over their predicate.
  #[inline]
  pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    MutexGuard {
      inner: self
        .inner
        .wait(guard.inner)
        .unwrap_or_else(|e| e.into_inner()),
    }
  }

  /// Waits on this condition variable with a timeout.
  ///
  /// Returns the reacquired guard and whether the wait timed out.
  #[inline]
  pub fn wait_timeout<'a, T>(
    &self,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
  ) -> (MutexGuard<'a, T>, bool) {
    match self.inner.wait_timeout(guard.inner, timeout) {
      Ok((inner, res)) => (MutexGuard { inner }, res.timed_out()),
      Err(e) => {
        let (inner, res) = e.into_inner();
        (MutexGuard { inner }, res.timed_out())
      }
    }
  }

  #[inline]
  pub fn notify_one(&self) {
    self.inner.notify_one();
  }

  #[inline]
  pub fn notify_all(&self) {
    self.inner.notify_all();
  }
}

impl Default for Condvar {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn test_mutex_basic() {
    let m = Mutex::new(5);
    *m.lock() = 7;
    assert_eq!(*m.lock(), 7);
  }

  #[test]
  fn test_try_lock_contended() {
    let m = Mutex::new(0);
    let g = m.lock();
    assert!(m.try_lock().is_none());
    drop(g);
    assert!(m.try_lock().is_some());
  }

  #[test]
  fn test_condvar_wakes_waiter() {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let pair2 = Arc::clone(&pair);

    let handle = thread::spawn(move || {
      let (lock, cvar) = &*pair2;
      let mut started = lock.lock();
      while !*started {
        started = cvar.wait(started);
      }
    });

    {
      let (lock, cvar) = &*pair;
      *lock.lock() = true;
      cvar.notify_all();
    }
    handle.join().unwrap();
  }

  #[test]
  fn test_condvar_timeout() {
    let m = Mutex::new(());
    let c = Condvar::new();
    let g = m.lock();
    let (_g, timed_out) = c.wait_timeout(g, Duration::from_millis(10));
    assert!(timed_out);
  }
}
