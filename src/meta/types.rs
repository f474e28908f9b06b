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

use crate::common::types::{FileAttr, FileType};
use libc::{gid_t, mode_t, uid_t};
use std::collections::HashMap;
use std::path::PathBuf;

/// One row of the `files` table: everything the overlay knows about a node.
/// The id is stable across renames; the path column is what mutates.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub path: PathBuf,
    /// Full mode including the type bits
    pub mode: mode_t,
    pub uid: uid_t,
    pub gid: gid_t,
    pub size: u64,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
    /// Opaque monotonic token from the remote.  Synthesized from
    /// (size, mtime) when the backend has no native notion of revisions.
    pub remote_revision: i64,
    /// Where a symlink points, if this is one
    pub link_target: Option<PathBuf>,
    pub rdev: u64,
    pub xattrs: HashMap<String, Vec<u8>>,
    pub tags: Vec<String>,
    pub acl: Option<String>,
}

impl FileRecord {
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn attr(&self) -> FileAttr {
        FileAttr {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            nlink: 1,
            rdev: self.rdev,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

/// The last remote revision the local cache holds for a file.  Absence means
/// the file has never been cached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedRevision {
    pub file_id: i64,
    pub revision: i64,
    pub mtime: f64,
}

/// What a sync-change entry does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    New,
    Link,
    Unlink,
    Change,
    Rename,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Link => "link",
            ChangeKind::Unlink => "unlink",
            ChangeKind::Change => "change",
            ChangeKind::Rename => "rename",
        }
    }

    pub fn from_str(val: &str) -> Option<Self> {
        match val {
            "new" => Some(ChangeKind::New),
            "link" => Some(ChangeKind::Link),
            "unlink" => Some(ChangeKind::Unlink),
            "change" => Some(ChangeKind::Change),
            "rename" => Some(ChangeKind::Rename),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of the sync log.  `seq` is the global total order the worker
/// drains in; `timestamp` is wall clock and only for humans reading dumps.
#[derive(Debug, Clone)]
pub struct SyncChange {
    pub seq: i64,
    pub timestamp: f64,
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub old_path: Option<PathBuf>,
    pub new_path: Option<PathBuf>,
    pub file_type: Option<FileType>,
    pub dev_major: Option<u32>,
    pub dev_minor: Option<u32>,
}

/// A contiguous span of new bytes pending propagation, together with the
/// snapshot of what the cache held in that span before the write landed.
/// The sync worker's conflict probe compares the remote against `base`, so
/// a remote that moved on is caught no matter what its size and mtime say.
/// The invariants `end - start == bytes.len() == base.len()` are enforced
/// at construction in `synclog::region`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRegion {
    pub start: u64,
    pub end: u64,
    pub bytes: Vec<u8>,
    pub base: Vec<u8>,
}

impl DataRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl std::fmt::Display for DataRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] ({} bytes)", self.start, self.end, self.len())
    }
}

/// The detail attached to a `change` entry: which metadata moved, and the
/// normalized set of data regions
#[derive(Debug, Clone, Default)]
pub struct FileChange {
    pub change_seq: i64,
    pub mode_changed: bool,
    pub uid_changed: bool,
    pub gid_changed: bool,
    pub times_changed: bool,
    pub acl_changed: bool,
    pub xattrs_changed: Vec<String>,
    pub regions: Vec<DataRegion>,
}

impl FileChange {
    /// Whether replaying this change touches anything at all
    pub fn is_empty(&self) -> bool {
        !self.mode_changed
            && !self.uid_changed
            && !self.gid_changed
            && !self.times_changed
            && !self.acl_changed
            && self.xattrs_changed.is_empty()
            && self.regions.is_empty()
    }
}
