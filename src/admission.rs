//! Admission control: a counting semaphore shared by the acceptor and workers.
//!
//! The acceptor calls [`Admission::try_admit`] exactly once per accepted
//! socket.  The returned [`Permit`] travels with the connection to a worker
//! and is released when the session ends, however it ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct Inner {
    active: AtomicUsize,
    capacity: usize,
}

/// Cloneable handle to the admission counter.
#[derive(Debug, Clone)]
pub struct Admission {
    inner: Arc<Inner>,
}

impl Admission {
    pub fn new(capacity: usize) -> Self {
        Admission {
            inner: Arc::new(Inner {
                active: AtomicUsize::new(0),
                capacity,
            }),
        }
    }

    /// Takes a slot if one is free.
    ///
    /// The check and the increment are a single atomic step, so concurrent
    /// callers can never push the count past capacity.  A refusal leaves the
    /// count untouched.
    pub fn try_admit(&self) -> Option<Permit> {
        self.inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.inner.capacity).then_some(active + 1)
            })
            .ok()
            .map(|_| Permit {
                inner: self.inner.clone(),
            })
    }

    /// Number of sessions currently admitted.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// One admitted session.  Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_past_capacity_without_changing_count() {
        let admission = Admission::new(2);
        let a = admission.try_admit().unwrap();
        let _b = admission.try_admit().unwrap();
        assert_eq!(admission.active(), 2);
        assert!(admission.try_admit().is_none());
        assert!(admission.try_admit().is_none());
        assert_eq!(admission.active(), 2);
        drop(a);
        assert_eq!(admission.active(), 1);
        assert!(admission.try_admit().is_some());
    }

    #[test]
    fn concurrent_admission_never_exceeds_capacity() {
        let admission = Admission::new(20);
        let permits = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        if let Some(permit) = admission.try_admit() {
                            permits.lock().unwrap().push(permit);
                        }
                    }
                });
            }
        });
        assert_eq!(permits.lock().unwrap().len(), 20);
        assert_eq!(admission.active(), 20);
        permits.lock().unwrap().clear();
        assert_eq!(admission.active(), 0);
    }
}
