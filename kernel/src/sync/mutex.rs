//! The lock every frame, page and table in the VM subsystem is guarded by.
//!
//! Acquisition spins until the lock is free; there is no timeout. With the
//! `ticket_mutex` feature waiters are served in arrival order, so a thread
//! faulting in a page cannot be starved by the eviction sweep.

#[cfg(feature = "ticket_mutex")]
pub type Mutex<T> = spin::mutex::TicketMutex<T>;
#[cfg(feature = "ticket_mutex")]
pub type MutexGuard<'a, T> = spin::mutex::TicketMutexGuard<'a, T>;

#[cfg(not(feature = "ticket_mutex"))]
pub type Mutex<T> = spin::mutex::SpinMutex<T>;
#[cfg(not(feature = "ticket_mutex"))]
pub type MutexGuard<'a, T> = spin::mutex::SpinMutexGuard<'a, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = Mutex::new(5);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert_eq!(*lock.try_lock().unwrap(), 5);
    }

    #[test]
    fn test_contended_increments() {
        let counter = Arc::new(Mutex::new(0usize));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }
}
