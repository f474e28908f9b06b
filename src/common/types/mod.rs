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

use libc::{gid_t, mode_t, uid_t};

pub mod file_perms;
pub mod note;

/// The node types the overlay can journal and replay.  Hardlinks are not
/// here on purpose; `link` is reported as unsupported at the bridge.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Socket,
    Fifo,
    CharDevice,
    BlockDevice,
}

impl FileType {
    pub fn from_mode(mode: mode_t) -> Option<Self> {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Some(FileType::Regular),
            libc::S_IFDIR => Some(FileType::Directory),
            libc::S_IFLNK => Some(FileType::Symlink),
            libc::S_IFSOCK => Some(FileType::Socket),
            libc::S_IFIFO => Some(FileType::Fifo),
            libc::S_IFCHR => Some(FileType::CharDevice),
            libc::S_IFBLK => Some(FileType::BlockDevice),
            _ => None,
        }
    }

    pub fn mode_bits(self) -> mode_t {
        match self {
            FileType::Regular => libc::S_IFREG,
            FileType::Directory => libc::S_IFDIR,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Socket => libc::S_IFSOCK,
            FileType::Fifo => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
        }
    }

    /// The stable string form used in the sync_changes table
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Regular => "file",
            FileType::Directory => "dir",
            FileType::Symlink => "symlink",
            FileType::Socket => "socket",
            FileType::Fifo => "fifo",
            FileType::CharDevice => "char",
            FileType::BlockDevice => "block",
        }
    }

    pub fn from_str(val: &str) -> Option<Self> {
        match val {
            "file" => Some(FileType::Regular),
            "dir" => Some(FileType::Directory),
            "symlink" => Some(FileType::Symlink),
            "socket" => Some(FileType::Socket),
            "fifo" => Some(FileType::Fifo),
            "char" => Some(FileType::CharDevice),
            "block" => Some(FileType::BlockDevice),
            _ => None,
        }
    }

    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }

    pub fn is_device(self) -> bool {
        self == FileType::CharDevice || self == FileType::BlockDevice
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stat result in overlay terms.  Times are float seconds since the epoch,
/// matching how they're stored in the metadata tables.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub mode: mode_t,
    pub uid: uid_t,
    pub gid: gid_t,
    pub size: u64,
    pub nlink: u32,
    pub rdev: u64,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
}

impl FileAttr {
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// The type bits alone, for the sync worker's conflict probe
    pub fn type_bits(&self) -> mode_t {
        self.mode & libc::S_IFMT
    }
}

/// One visible entry in a directory listing, after the cache and remote
/// listings have been merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: mode_t,
}

impl DirEntry {
    pub fn new(name: &str, mode: mode_t) -> Self {
        Self {
            name: name.to_string(),
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_roundtrip() {
        for ft in &[
            FileType::Regular,
            FileType::Directory,
            FileType::Symlink,
            FileType::Socket,
            FileType::Fifo,
            FileType::CharDevice,
            FileType::BlockDevice,
        ] {
            assert_eq!(FileType::from_str(ft.as_str()), Some(*ft));
            assert_eq!(FileType::from_mode(ft.mode_bits() | 0o644), Some(*ft));
        }
    }

    #[test]
    fn test_bad_type_strings() {
        assert_eq!(FileType::from_str("hardlink"), None);
        assert_eq!(FileType::from_str(""), None);
    }
}
