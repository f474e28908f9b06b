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

//! The availability controller.  A heartbeat that keeps the availability
//! flag honest: while connected it verifies the mount is still live, a
//! forced disconnect tears the mount down and blocks it from coming back,
//! and every transition of the flag is published to the notifier.

use crate::common::constants::HEARTBEAT_SECS;
use crate::common::notify::Notifier;
use crate::remote::Remote;
use crate::sync::state::OverlayState;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const TAG: &str = "availability";

pub struct AvailabilityWorker<N>
where
    N: Notifier + 'static,
{
    remote: Arc<dyn Remote>,
    state: Arc<OverlayState>,
    notifier: Arc<Mutex<N>>,
}

impl<N> AvailabilityWorker<N>
where
    N: Notifier,
{
    pub fn new(remote: Arc<dyn Remote>, state: Arc<OverlayState>, notifier: Arc<Mutex<N>>) -> Self {
        Self {
            remote,
            state,
            notifier,
        }
    }

    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("availability".to_string())
            .spawn(move || self.run())
            .expect("Couldn't spawn availability worker")
    }

    pub fn run(&self) {
        // published notifications fire on transitions of this
        let mut last_available = self.state.is_available();

        while !self.state.is_unmounted() {
            if self.state.is_force_disconnected() {
                if self.state.is_available() {
                    info!(
                        target: TAG,
                        "User forced disconnect, dropping the remote"
                    );
                    self.state.set_available(false);
                    if let Err(e) = self.remote.unmount() {
                        warn!(target: TAG, "Couldn't unmount remote: {:?}", e);
                    }
                }
            } else if self.state.is_available() {
                // verify the mount is still alive underneath us
                if !self.remote.is_mounted() || !self.remote.ping() {
                    warn!(target: TAG, "Remote went away, marking unavailable");
                    self.state.set_available(false);
                    let _ = self.remote.unmount();
                }
            } else {
                debug!(target: TAG, "Remote unavailable, probing");
                // the sync worker owns the actual mount attempt; all the
                // heartbeat does here is wake it up so it re-probes promptly
                if self.remote.ping() {
                    self.state.poke();
                }
            }

            let available = self.state.is_available();
            if available != last_available {
                info!(
                    target: TAG,
                    "Availability transition: {} -> {}", last_available, available
                );
                let result = if available {
                    self.notifier.lock().connected()
                } else {
                    self.notifier.lock().disconnected()
                };
                if let Err(e) = result {
                    warn!(target: TAG, "Couldn't publish notification: {:?}", e);
                }
                last_available = available;
            }

            self.state
                .wait_for_change(Duration::from_secs(HEARTBEAT_SECS));
        }

        debug!(target: TAG, "Availability worker exiting");
    }
}
