use core::sync::atomic::{AtomicIsize, Ordering};

/// Counting semaphore.
///
/// There is no scheduler to park on, so [`Semaphore::down`] spins.
/// [`Semaphore::try_down`] and [`Semaphore::up`] never wait and are fine in
/// interrupt handlers.
pub struct Semaphore {
    count: AtomicIsize,
}

impl Semaphore {
    pub const fn new(count: isize) -> Self {
        Semaphore {
            count: AtomicIsize::new(count),
        }
    }

    /// Takes one token, spinning until one is available.
    pub fn down(&self) {
        while !self.try_down() {
            core::hint::spin_loop();
        }
    }

    /// Takes one token if there is one.
    pub fn try_down(&self) -> bool {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |count| {
                if count > 0 {
                    Some(count - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Returns one token.
    pub fn up(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    pub fn count(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_down_stops_at_zero() {
        let sem = Semaphore::new(2);
        assert!(sem.try_down());
        assert!(sem.try_down());
        assert!(!sem.try_down());
        assert_eq!(sem.count(), 0);

        sem.up();
        assert_eq!(sem.count(), 1);
        assert!(sem.try_down());
    }

    #[test]
    fn down_returns_once_another_thread_signals() {
        let sem = Semaphore::new(0);
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(5));
                sem.up();
            });
            sem.down();
        });
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn tokens_are_conserved_across_threads() {
        let sem = Semaphore::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        sem.up();
                    }
                });
            }
        });
        let mut taken = 0;
        while sem.try_down() {
            taken += 1;
        }
        assert_eq!(taken, 4000);
    }
}
