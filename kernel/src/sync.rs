//! Synchronization primitives not covered by the `spin` crate.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Counting semaphore with spin-wait `down`.
///
/// Wakes no scheduler: waiters burn cycles, which is acceptable for the
/// short waits this kernel uses it for (the read-ahead daemon sleeping on
/// pending work).
pub struct Semaphore {
    permits: AtomicUsize,
}

impl Semaphore {
    pub const fn new(permits: usize) -> Self {
        Semaphore {
            permits: AtomicUsize::new(permits),
        }
    }

    /// Release one permit.
    pub fn up(&self) {
        self.permits.fetch_add(1, Ordering::Release);
    }

    /// Acquire one permit, spinning until one is available.
    pub fn down(&self) {
        loop {
            if self.try_down() {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Acquire one permit without blocking. Returns false if none are free.
    pub fn try_down(&self) -> bool {
        self.permits
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |p| p.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_down() {
        let s = Semaphore::new(0);
        assert!(!s.try_down());
        s.up();
        s.up();
        assert!(s.try_down());
        s.down();
        assert!(!s.try_down());
    }
}
