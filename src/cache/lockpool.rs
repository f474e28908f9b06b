/*
 * TetherFS
 * Copyright (C) 2020 Andrew Moffat
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The path-lock table.  Every operation the overlay performs on a path,
//! whether it came from a bridge request thread or from the sync worker,
//! happens while holding that path's lock.  Locks are re-entrant per thread
//! and counted, because the cache manager's operations call each other
//! (access -> stat, rmdir -> readdir) on the same path.

use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::ThreadId;

const TAG: &str = "lockpool";

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    count: usize,
    waiters: usize,
}

#[derive(Default)]
struct PathLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// A keyed re-entrant mutex registry.  Entries are created on first use and
/// reclaimed once nothing references them anymore.
#[derive(Default)]
pub struct PathLocks {
    table: Mutex<HashMap<PathBuf, Arc<PathLock>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Default::default()
    }

    fn entry(&self, path: &Path) -> Arc<PathLock> {
        let mut table = self.table.lock();
        Arc::clone(
            table
                .entry(path.to_owned())
                .or_insert_with(|| Arc::new(PathLock::default())),
        )
    }

    /// Blocks until the calling thread holds `path` exclusively.  A thread
    /// already holding the lock re-enters, and must release once per acquire.
    pub fn acquire(&self, path: &Path) {
        let lock = self.entry(path);
        let me = std::thread::current().id();
        trace!(target: TAG, "Acquiring lock on {}", path.display());

        let mut state = lock.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.count += 1;
                    return;
                }
                Some(_) => {
                    state.waiters += 1;
                    lock.cond.wait(&mut state);
                    state.waiters -= 1;
                }
            }
        }
    }

    pub fn release(&self, path: &Path) {
        let lock = self.entry(path);
        trace!(target: TAG, "Releasing lock on {}", path.display());

        let wake = {
            let mut state = lock.state.lock();
            assert_eq!(
                state.owner,
                Some(std::thread::current().id()),
                "released a path lock the thread didn't hold: {}",
                path.display()
            );
            state.count -= 1;
            if state.count == 0 {
                state.owner = None;
                true
            } else {
                false
            }
        };

        if wake {
            lock.cond.notify_one();
            // our own Arc must go away before reclaim can see a count of one
            drop(lock);
            self.reclaim(path);
        }
    }

    /// Drops table entries nobody is using.  Safe because an entry is only
    /// removed while the table lock is held and no outside Arc exists, so a
    /// concurrent acquire can't be holding a doomed entry.
    fn reclaim(&self, path: &Path) {
        let mut table = self.table.lock();
        let remove = match table.get(path) {
            Some(entry) => {
                if Arc::strong_count(entry) > 1 {
                    false
                } else {
                    let state = entry.state.lock();
                    state.owner.is_none() && state.waiters == 0
                }
            }
            None => false,
        };
        if remove {
            table.remove(path);
        }
    }

    /// Scoped acquisition for the common single-path case
    pub fn lock(&self, path: &Path) -> PathGuard<'_> {
        self.acquire(path);
        PathGuard {
            locks: self,
            path: path.to_owned(),
        }
    }

    /// Acquires two locks in the canonical byte-lexicographic order, so
    /// concurrent multi-path operations can't deadlock each other
    pub fn lock_pair(&self, a: &Path, b: &Path) -> (PathGuard<'_>, PathGuard<'_>) {
        if a.as_os_str() <= b.as_os_str() {
            let first = self.lock(a);
            let second = self.lock(b);
            (first, second)
        } else {
            let first = self.lock(b);
            let second = self.lock(a);
            (second, first)
        }
    }

    #[cfg(test)]
    fn table_len(&self) -> usize {
        self.table.lock().len()
    }
}

pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
}

impl<'a> Drop for PathGuard<'a> {
    fn drop(&mut self) {
        self.locks.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_reentry() {
        let locks = PathLocks::new();
        let p = Path::new("/a");
        locks.acquire(p);
        locks.acquire(p);
        locks.release(p);
        locks.release(p);
        // fully released, so the entry is gone
        assert_eq!(locks.table_len(), 0);
    }

    #[test]
    fn test_guard_releases() {
        let locks = PathLocks::new();
        {
            let _g = locks.lock(Path::new("/a"));
            assert_eq!(locks.table_len(), 1);
        }
        assert_eq!(locks.table_len(), 0);
    }

    #[test]
    fn test_paths_are_independent() {
        let locks = Arc::new(PathLocks::new());
        locks.acquire(Path::new("/a"));

        let locks2 = Arc::clone(&locks);
        let handle = std::thread::spawn(move || {
            // must not block even though /a is held
            locks2.acquire(Path::new("/b"));
            locks2.release(Path::new("/b"));
        });
        handle.join().unwrap();
        locks.release(Path::new("/a"));
    }

    #[test]
    fn test_contention_serializes() {
        let locks = Arc::new(PathLocks::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let p = PathBuf::from("/contended");

        locks.acquire(&p);

        let (locks2, hits2, p2) = (Arc::clone(&locks), Arc::clone(&hits), p.clone());
        let handle = std::thread::spawn(move || {
            locks2.acquire(&p2);
            hits2.fetch_add(1, Ordering::SeqCst);
            locks2.release(&p2);
        });

        // the other thread must be stuck behind us
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        locks.release(&p);
        handle.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pair_ordering() {
        let locks = PathLocks::new();
        // acquiring in either argument order must not self-deadlock
        let (g1, g2) = locks.lock_pair(Path::new("/b"), Path::new("/a"));
        drop(g1);
        drop(g2);
        let (g1, g2) = locks.lock_pair(Path::new("/a"), Path::new("/b"));
        drop(g1);
        drop(g2);
        assert_eq!(locks.table_len(), 0);
    }
}
