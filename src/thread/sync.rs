//! Thread-parking semaphore.
//!
//! The cooperative model runs one OS thread per stimulus thread and keeps
//! all but one of them parked. The parking primitive is a plain counting
//! semaphore built on `Mutex` + `Condvar`; each stimulus thread has one,
//! and the driver has one of its own. Exactly one semaphore in the system
//! holds a permit at any moment, which is what serializes all stimulus
//! execution onto a single virtual CPU.

use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits. Stimulus threads start
    /// at zero and park until the scheduler grants them the CPU.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            condvar: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the underlying lock was poisoned.
    pub fn acquire(&self) -> Result<()> {
        let guard = self
            .permits
            .lock()
            .map_err(|e| Error::LockError(format!("semaphore lock poisoned: {e}")))?;
        let mut guard = self
            .condvar
            .wait_while(guard, |permits| *permits == 0)
            .map_err(|e| Error::LockError(format!("semaphore condvar poisoned: {e}")))?;
        *guard -= 1;
        Ok(())
    }

    /// Add one permit, waking a parked thread if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the underlying lock was poisoned.
    pub fn release(&self) -> Result<()> {
        let mut guard = self
            .permits
            .lock()
            .map_err(|e| Error::LockError(format!("semaphore lock poisoned: {e}")))?;
        *guard += 1;
        self.condvar.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_initial_permit_is_consumable() {
        let sem = Semaphore::new(1);
        sem.acquire().unwrap();
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let releaser = Arc::clone(&sem);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            releaser.release().unwrap();
        });

        // returns only once the spawned thread releases
        sem.acquire().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_release_accumulates_permits() {
        let sem = Semaphore::new(0);
        sem.release().unwrap();
        sem.release().unwrap();
        sem.acquire().unwrap();
        sem.acquire().unwrap();
    }
}
