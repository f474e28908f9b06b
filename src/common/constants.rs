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

pub const VERSION: (&str, &str, &str) = (
    env!("CARGO_PKG_VERSION_MAJOR"),
    env!("CARGO_PKG_VERSION_MINOR"),
    env!("CARGO_PKG_VERSION_PATCH"),
);
pub const ENV_PREFIX: &str = "TETHER";
pub const APP_NAME: &str = "tetherfs";
pub const AUTHOR: &str = "Andrew Moffat";
pub const ORG: &str = "ai.tetherfs";

pub const DB_FILE_NAME: &str = "meta.sqlite3";
pub const CACHE_DIR_NAME: &str = "cache";
pub const CACHE_SPEC_FILE_NAME: &str = "cachespec";

// how often the availability controller probes the remote, and the upper
// bound on any flag wait in the worker loops
pub const HEARTBEAT_SECS: u64 = 5;
pub const MAX_FLAG_WAIT_SECS: u64 = 5;

// the metadata read cache in front of sqlite
pub const META_CACHE_CAPACITY: usize = 8192;
pub const META_CACHE_TTL_S: u64 = 60;

// extended attributes exposed on the mount.  the root-only ones control the
// whole overlay, the per-file ones report cache state
pub const XATTR_IN_CACHE: &str = "tetherfs.in-cache";
pub const XATTR_DIRTY: &str = "tetherfs.dirty";
pub const XATTR_SHOULD_CACHE: &str = "tetherfs.should-cache";
pub const XATTR_PAUSE_SYNC: &str = "tetherfs.pause-sync";
pub const XATTR_FORCE_DISCONNECT: &str = "tetherfs.force-disconnect";
pub const XATTR_CONNECTED: &str = "tetherfs.connected";
pub const XATTR_SYNCLOG: &str = "tetherfs.synclog";
pub const XATTR_VERSION: &str = "tetherfs.version";

pub const DEFAULT_CONFIG_TOML: &str = r###"
force_disconnect = false

[remote]
type = "nfs"
source = ""
options = ""

[conflict]
dir = "/.conflicts"

[sync]
checkpoint_s = 30
pause = false

[perms]
default_mode_mask = "077"
default_cache_mode = "600"

[cache]
[metadata]
"###;
