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

use crate::common::types::note::Note;
use std::error::Error;
use std::path::Path;
use std::time::Duration;

pub mod uds;

/// The pluggable observer for availability and sync events.  The overlay
/// itself never blocks on a notifier; implementations must queue and return.
pub trait Notifier: Send {
    type Listener: Listener;

    /// The availability controller established (or re-established) the remote
    fn connected(&self) -> Result<(), Box<dyn Error>>;

    /// The remote dropped out, or the user forced a disconnect
    fn disconnected(&self) -> Result<(), Box<dyn Error>>;

    /// The sync worker quarantined a change on `path`
    fn conflict(&self, path: &Path) -> Result<(), Box<dyn Error>>;

    fn sync_paused(&self) -> Result<(), Box<dyn Error>>;
    fn sync_resumed(&self) -> Result<(), Box<dyn Error>>;

    /// The overlay is going away
    fn unmounted(&self) -> Result<(), Box<dyn Error>>;

    fn listener(&self) -> Result<Self::Listener, Box<dyn Error>>;
}

pub trait Listener {
    fn marker(&self) -> usize;
    fn wait_for_pred(
        &mut self,
        pred: impl Fn(&Note) -> bool,
        timeout: Duration,
        idx: usize,
    ) -> Option<(Note, usize)>;
    fn wait_for(&mut self, note: &Note, timeout: Duration, marker: usize) -> bool;
}
