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

//! The contract between the overlay and the userspace-filesystem kernel
//! bridge.  The bridge owns the libfuse plumbing and the request threads; we
//! own everything behind this trait.  Paths arrive absolute, rooted at the
//! mountpoint, and errors leave as negative errnos via `FuseErrno`.

use crate::common::types::{DirEntry, FileAttr};
use libc::{gid_t, mode_t, pid_t, uid_t};
use std::path::{Path, PathBuf};

pub mod err;
pub mod fs;
pub mod util;

pub type FuseResult<T> = Result<T, err::FuseErrno>;

/// The caller context the bridge hands us with every request
#[derive(Ord, PartialOrd, Eq, PartialEq, Hash, Clone, Debug)]
pub struct Request {
    pub uid: uid_t,
    pub gid: gid_t,
    pub pid: pid_t,
    pub umask: mode_t,
}

/// Filesystem statistics for `statfs`, in fragment-size units
#[derive(Debug, Clone, Default)]
pub struct StatFs {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u64,
}

/// A Filesystem represents a filesystem with callbacks for the bridge to
/// call.  Notice that none of the methods are &mut self: the bridge processes
/// requests on parallel threads, so implementors use interior mutation and
/// locking.
pub trait Filesystem: Send + Sync {
    /// Called at the top of every request thread so log lines carry a
    /// request id
    fn init_request_id(&self);

    fn getattr(&self, req: &Request, path: &Path) -> FuseResult<FileAttr>;
    fn access(&self, req: &Request, path: &Path, mask: i32) -> FuseResult<()>;
    fn readdir(&self, req: &Request, path: &Path) -> FuseResult<Vec<DirEntry>>;
    fn readlink(&self, req: &Request, path: &Path) -> FuseResult<PathBuf>;

    /// `mode` is only present when the bridge is creating (O_CREAT)
    fn open(&self, req: &Request, path: &Path, flags: i32, mode: Option<mode_t>)
        -> FuseResult<()>;
    fn read(&self, req: &Request, path: &Path, offset: i64, size: usize) -> FuseResult<Vec<u8>>;
    fn write(&self, req: &Request, path: &Path, data: &[u8], offset: i64) -> FuseResult<usize>;
    fn truncate(&self, req: &Request, path: &Path, size: u64) -> FuseResult<()>;
    fn release(&self, req: &Request, path: &Path) -> FuseResult<()>;

    fn mknod(&self, req: &Request, path: &Path, mode: mode_t, rdev: u64) -> FuseResult<()>;
    fn mkdir(&self, req: &Request, path: &Path, mode: mode_t) -> FuseResult<()>;
    fn symlink(&self, req: &Request, target: &Path, link: &Path) -> FuseResult<()>;
    fn link(&self, req: &Request, src: &Path, dst: &Path) -> FuseResult<()>;
    fn unlink(&self, req: &Request, path: &Path) -> FuseResult<()>;
    fn rmdir(&self, req: &Request, path: &Path) -> FuseResult<()>;
    fn rename(&self, req: &Request, old: &Path, new: &Path) -> FuseResult<()>;

    fn chmod(&self, req: &Request, path: &Path, mode: mode_t) -> FuseResult<()>;
    fn chown(&self, req: &Request, path: &Path, uid: uid_t, gid: gid_t) -> FuseResult<()>;
    fn utime(&self, req: &Request, path: &Path, atime: f64, mtime: f64) -> FuseResult<()>;

    fn setxattr(&self, req: &Request, path: &Path, name: &str, value: &[u8]) -> FuseResult<()>;
    fn getxattr(&self, req: &Request, path: &Path, name: &str) -> FuseResult<Vec<u8>>;
    fn listxattr(&self, req: &Request, path: &Path) -> FuseResult<Vec<String>>;
    fn removexattr(&self, req: &Request, path: &Path, name: &str) -> FuseResult<()>;

    fn statfs(&self, req: &Request, path: &Path) -> FuseResult<StatFs>;
}
