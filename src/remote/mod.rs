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

//! The capability set every remote backend must supply.  The planner and the
//! sync worker only ever talk to this trait; which protocol is behind it is a
//! configuration detail.

use crate::common::err::TetherResult;
use crate::common::types::{DirEntry, FileAttr};
use libc::{gid_t, mode_t, uid_t};
use std::fs::File;
use std::path::{Path, PathBuf};

pub mod fs;

pub const REMOTE_TAG: &str = "remote";

/// An open file on the remote.  Handles never outlive a single overlay
/// operation; long-lived state belongs in the cache.
pub struct RemoteHandle {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
}

pub trait Remote: Send + Sync {
    /// A cheap liveness probe of the remote server, not of the mount
    fn ping(&self) -> bool;
    fn mount(&self) -> TetherResult<()>;
    fn unmount(&self) -> TetherResult<()>;
    fn is_mounted(&self) -> bool;

    fn open(&self, path: &Path, flags: i32) -> TetherResult<RemoteHandle>;
    fn read(&self, handle: &mut RemoteHandle, offset: u64, size: usize) -> TetherResult<Vec<u8>>;
    fn write(&self, handle: &mut RemoteHandle, offset: u64, data: &[u8]) -> TetherResult<usize>;
    fn close(&self, handle: RemoteHandle) -> TetherResult<()>;

    /// Reads `[start, end)` of `path`, returning short data at EOF unchanged
    fn read_region(&self, path: &Path, start: u64, end: u64) -> TetherResult<Vec<u8>>;
    fn write_region(&self, path: &Path, start: u64, data: &[u8]) -> TetherResult<()>;

    /// Streams a whole file up to the remote, creating it with `mode`
    fn copy_from(&self, path: &Path, src: &mut dyn std::io::Read, mode: mode_t)
        -> TetherResult<u64>;
    /// Streams a whole remote file down into `dst`
    fn copy_to(&self, path: &Path, dst: &mut dyn std::io::Write) -> TetherResult<u64>;

    fn truncate(&self, path: &Path, size: u64) -> TetherResult<()>;
    fn lstat(&self, path: &Path) -> TetherResult<FileAttr>;
    fn readdir(&self, path: &Path) -> TetherResult<Vec<DirEntry>>;

    fn mkdir(&self, path: &Path, mode: mode_t) -> TetherResult<()>;
    fn rmdir(&self, path: &Path) -> TetherResult<()>;
    fn unlink(&self, path: &Path) -> TetherResult<()>;
    fn symlink(&self, target: &Path, link: &Path) -> TetherResult<()>;
    fn readlink(&self, path: &Path) -> TetherResult<PathBuf>;
    fn rename(&self, old: &Path, new: &Path) -> TetherResult<()>;

    fn chmod(&self, path: &Path, mode: mode_t) -> TetherResult<()>;
    fn chown(&self, path: &Path, uid: uid_t, gid: gid_t) -> TetherResult<()>;
    fn utime(&self, path: &Path, atime: f64, mtime: f64) -> TetherResult<()>;

    fn getxattr(&self, path: &Path, name: &str) -> TetherResult<Vec<u8>>;
    fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> TetherResult<()>;
    fn listxattr(&self, path: &Path) -> TetherResult<Vec<String>>;
    fn removexattr(&self, path: &Path, name: &str) -> TetherResult<()>;
}
