//! Versioned immutable snapshots swapped atomically.
//!
//! A [`SnapshotCell`] holds one complete `Arc<T>`. Readers clone the `Arc`
//! under a short read lock and then work on their own snapshot, so a
//! reader never observes a value straddling two updates. Writers build
//! the replacement and swap it in; they serialize among themselves on the
//! write lock.

use std::sync::{Arc, PoisonError, RwLock};

pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    /// The current snapshot.
    pub fn load(&self) -> Arc<T> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the snapshot unconditionally, returning the previous one.
    pub fn store(&self, value: T) -> Arc<T> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(value))
    }

    /// Derive and publish a new snapshot from the current one.
    ///
    /// `f` runs while the write lock is held, so concurrent updates are
    /// applied one after another. If `f` fails the current snapshot stays.
    pub fn update<E, F>(&self, f: F) -> Result<Arc<T>, E>
    where
        F: FnOnce(&T) -> Result<T, E>,
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(f(&guard)?);
        *guard = Arc::clone(&next);
        Ok(next)
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, Clone, PartialEq)]
    struct Pair {
        version: u64,
        mirror: u64,
    }

    #[test]
    fn failed_update_keeps_current() {
        let cell = SnapshotCell::new(Pair { version: 1, mirror: 1 });
        let res: Result<_, &str> = cell.update(|_| Err("nope"));
        assert!(res.is_err());
        assert_eq!(cell.load().version, 1);
    }

    #[test]
    fn old_snapshots_stay_valid_after_store() {
        let cell = SnapshotCell::new(Pair { version: 1, mirror: 1 });
        let before = cell.load();
        let prev = cell.store(Pair { version: 2, mirror: 2 });
        assert_eq!(prev.version, 1);
        assert_eq!(before.version, 1);
        assert_eq!(cell.load().version, 2);
    }

    #[test]
    fn readers_never_see_torn_values() {
        let cell = Arc::new(SnapshotCell::new(Pair { version: 0, mirror: 0 }));
        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let _ = cell.update::<(), _>(|p| {
                        Ok(Pair {
                            version: p.version + 1,
                            mirror: p.mirror + 1,
                        })
                    });
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snap = cell.load();
                        assert_eq!(snap.version, snap.mirror);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cell.load().version, 2_000);
    }
}
