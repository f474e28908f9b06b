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

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The events the overlay publishes to whatever is listening on the notifier
/// socket.  A tray app turns these into balloons; the tests just wait on
/// them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Note {
    /// The availability controller brought the remote up
    Connected,
    /// The remote went away, either on its own or via a forced disconnect
    Disconnected,
    /// The sync worker quarantined a conflicted change for this path
    Conflict(PathBuf),
    SyncPaused,
    SyncResumed,
    /// The overlay is shutting down
    Unmounted,
}
