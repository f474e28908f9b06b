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

use crate::common::constants::MAX_FLAG_WAIT_SECS;
use log::info;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

const TAG: &str = "state";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    /// Remote operations may be attempted right now
    pub available: bool,
    /// The user asked for journaling only, no draining
    pub sync_paused: bool,
    /// The user forbade mount attempts entirely
    pub force_disconnect: bool,
    /// The overlay is shutting down
    pub unmounted: bool,
}

/// The shared mutable flags of the whole overlay, guarded by one mutex and
/// signalled through one condvar.  Anybody waiting on a flag sleeps at most
/// `MAX_FLAG_WAIT_SECS` before re-checking, so a lost wakeup can only ever
/// cost a bounded delay.
pub struct OverlayState {
    flags: Mutex<Flags>,
    cond: Condvar,
}

impl OverlayState {
    pub fn new(sync_paused: bool, force_disconnect: bool) -> Self {
        Self {
            flags: Mutex::new(Flags {
                available: false,
                sync_paused,
                force_disconnect,
                unmounted: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> Flags {
        *self.flags.lock()
    }

    pub fn is_available(&self) -> bool {
        self.flags.lock().available
    }

    pub fn set_available(&self, available: bool) {
        let mut flags = self.flags.lock();
        if flags.available != available {
            info!(target: TAG, "Remote availability -> {}", available);
        }
        flags.available = available;
        self.cond.notify_all();
    }

    pub fn is_sync_paused(&self) -> bool {
        self.flags.lock().sync_paused
    }

    pub fn set_sync_paused(&self, paused: bool) {
        let mut flags = self.flags.lock();
        if flags.sync_paused != paused {
            info!(target: TAG, "Sync paused -> {}", paused);
        }
        flags.sync_paused = paused;
        self.cond.notify_all();
    }

    pub fn is_force_disconnected(&self) -> bool {
        self.flags.lock().force_disconnect
    }

    pub fn set_force_disconnect(&self, forced: bool) {
        let mut flags = self.flags.lock();
        if flags.force_disconnect != forced {
            info!(target: TAG, "Force disconnect -> {}", forced);
        }
        flags.force_disconnect = forced;
        self.cond.notify_all();
    }

    pub fn is_unmounted(&self) -> bool {
        self.flags.lock().unmounted
    }

    /// Flips the shutdown flag and wakes every waiter so the worker threads
    /// can exit promptly
    pub fn set_unmounted(&self) {
        let mut flags = self.flags.lock();
        info!(target: TAG, "Unmount requested");
        flags.unmounted = true;
        self.cond.notify_all();
    }

    /// Sleeps until some flag changes, bounded by `timeout` and by the global
    /// maximum wait
    pub fn wait_for_change(&self, timeout: Duration) {
        let bounded = timeout.min(Duration::from_secs(MAX_FLAG_WAIT_SECS));
        let mut flags = self.flags.lock();
        let _ = self.cond.wait_for(&mut flags, bounded);
    }

    /// Wakes waiters without changing anything.  The sync log uses this when
    /// it appends an entry, so a drained worker re-checks for work.
    pub fn poke(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_flags() {
        let state = OverlayState::new(true, false);
        let flags = state.snapshot();
        assert!(!flags.available);
        assert!(flags.sync_paused);
        assert!(!flags.force_disconnect);
        assert!(!flags.unmounted);
    }

    #[test]
    fn test_wait_wakes_on_change() {
        let state = Arc::new(OverlayState::new(false, false));
        let state2 = Arc::clone(&state);

        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            while !state2.is_available() {
                state2.wait_for_change(Duration::from_secs(5));
                if start.elapsed() > Duration::from_secs(10) {
                    panic!("never woke up");
                }
            }
        });

        std::thread::sleep(Duration::from_millis(50));
        state.set_available(true);
        handle.join().unwrap();
    }
}
