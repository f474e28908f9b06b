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

//! The on-disk cache tree.  It mirrors the overlay's hierarchy verbatim under
//! the cache root; content is stored as plain files.  Anything the local
//! filesystem can't represent (device nodes, foreign owners) lives only in
//! the metadata store, and the tree holds a placeholder.

use crate::common::err::{TetherError, TetherResult};
use crate::common::types::{DirEntry, FileAttr};
use crate::fuse::util;
use libc::{gid_t, mode_t, uid_t};
use log::{debug, trace};
use std::fs::OpenOptions;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

const TAG: &str = "cache_store";

pub struct CacheStore {
    base: PathBuf,
}

impl CacheStore {
    pub fn new(base: PathBuf) -> TetherResult<Self> {
        std::fs::create_dir_all(&base).map_err(|e| TetherError::from_io(&base, e))?;
        Ok(Self { base })
    }

    /// Translates an overlay path into its location inside the cache tree
    pub fn cache_path_of(&self, path: &Path) -> PathBuf {
        let rhs = path.strip_prefix("/").unwrap_or(path);
        self.base.join(rhs)
    }

    fn parent_dirs(&self, path: &Path) -> TetherResult<()> {
        let cpath = self.cache_path_of(path);
        if let Some(parent) = cpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TetherError::from_io(path, e))?;
        }
        Ok(())
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.cache_path_of(path).symlink_metadata().is_ok()
    }

    pub fn lstat(&self, path: &Path) -> TetherResult<FileAttr> {
        let cpath = self.cache_path_of(path);
        let st = nix::sys::stat::lstat(&cpath).map_err(|e| TetherError::from_nix(path, e))?;

        Ok(FileAttr {
            mode: st.st_mode as mode_t,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size as u64,
            nlink: st.st_nlink as u32,
            rdev: st.st_rdev as u64,
            atime: st.st_atime as f64 + st.st_atime_nsec as f64 * 1e-9,
            mtime: st.st_mtime as f64 + st.st_mtime_nsec as f64 * 1e-9,
            ctime: st.st_ctime as f64 + st.st_ctime_nsec as f64 * 1e-9,
        })
    }

    pub fn size(&self, path: &Path) -> TetherResult<u64> {
        Ok(self.lstat(path)?.size)
    }

    /// Creates an empty cache file with the given permission bits.  Used both
    /// for user creations and as the placeholder for special nodes.
    pub fn create_file(&self, path: &Path, mode: mode_t) -> TetherResult<()> {
        self.parent_dirs(path)?;
        let cpath = self.cache_path_of(path);
        debug!(target: TAG, "Creating cache file {}", cpath.display());

        OpenOptions::new()
            .write(true)
            .create(true)
            .mode(mode as u32 & 0o7777)
            .open(&cpath)
            .map_err(|e| TetherError::from_io(path, e))?;
        Ok(())
    }

    pub fn open_for_read(&self, path: &Path) -> TetherResult<std::fs::File> {
        std::fs::File::open(self.cache_path_of(path)).map_err(|e| TetherError::from_io(path, e))
    }

    /// Reads up to `size` bytes at `offset`.  Short data past EOF comes back
    /// unchanged; the cache never invents zeros that aren't in the file.
    pub fn read(&self, path: &Path, offset: u64, size: usize) -> TetherResult<Vec<u8>> {
        let file = self.open_for_read(path)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0usize;

        while filled < size {
            let n = file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| TetherError::from_io(path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        trace!(
            target: TAG,
            "Read {} bytes from {} at {}",
            filled,
            path.display(),
            offset
        );
        Ok(buf)
    }

    /// Writes at `offset`, extending the file as needed.  Seeking past EOF
    /// leaves a hole that reads back as zeros, which is exactly the overlay's
    /// contract for sparse writes.
    pub fn write(&self, path: &Path, offset: u64, data: &[u8]) -> TetherResult<usize> {
        let cpath = self.cache_path_of(path);
        let file = OpenOptions::new()
            .write(true)
            .open(&cpath)
            .map_err(|e| TetherError::from_io(path, e))?;

        file.write_all_at(data, offset)
            .map_err(|e| TetherError::from_io(path, e))?;
        Ok(data.len())
    }

    /// A truncating writer over the cache copy, for clobbering it with
    /// content streamed down from the remote
    pub fn open_for_write(&self, path: &Path, mode: mode_t) -> TetherResult<std::fs::File> {
        self.parent_dirs(path)?;
        let cpath = self.cache_path_of(path);

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode as u32 & 0o7777)
            .open(&cpath)
            .map_err(|e| TetherError::from_io(path, e))
    }

    pub fn truncate(&self, path: &Path, size: u64) -> TetherResult<()> {
        util::truncate(&self.cache_path_of(path), size as i64)
            .map_err(|e| TetherError::from_io(path, e))
    }

    pub fn mkdir(&self, path: &Path, mode: mode_t) -> TetherResult<()> {
        self.parent_dirs(path)?;
        let cpath = self.cache_path_of(path);

        match std::fs::create_dir(&cpath) {
            Ok(_) => {}
            // an already-present cache dir may hold earlier cached children,
            // just adopt it
            Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(TetherError::from_io(path, e)),
        }

        std::fs::set_permissions(&cpath, std::fs::Permissions::from_mode(mode as u32 & 0o7777))
            .map_err(|e| TetherError::from_io(path, e))
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> TetherResult<()> {
        self.parent_dirs(link)?;
        let cpath = self.cache_path_of(link);

        // replace whatever was cached before
        match std::fs::remove_file(&cpath) {
            Ok(_) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(TetherError::from_io(link, e)),
        }

        std::os::unix::fs::symlink(target, &cpath).map_err(|e| TetherError::from_io(link, e))
    }

    pub fn readlink(&self, path: &Path) -> TetherResult<PathBuf> {
        std::fs::read_link(self.cache_path_of(path)).map_err(|e| TetherError::from_io(path, e))
    }

    pub fn unlink(&self, path: &Path) -> TetherResult<()> {
        debug!(target: TAG, "Unlinking cache copy of {}", path.display());
        std::fs::remove_file(self.cache_path_of(path)).map_err(|e| TetherError::from_io(path, e))
    }

    pub fn rmdir(&self, path: &Path) -> TetherResult<()> {
        debug!(target: TAG, "Removing cache dir of {}", path.display());
        std::fs::remove_dir(self.cache_path_of(path)).map_err(|e| TetherError::from_io(path, e))
    }

    /// Renames inside the cache tree, carrying host xattrs along
    pub fn rename(&self, old: &Path, new: &Path) -> TetherResult<()> {
        self.parent_dirs(new)?;
        crate::common::xattr::rename(self.cache_path_of(old), self.cache_path_of(new))
            .map_err(|e| TetherError::from_io(old, e))
    }

    pub fn chmod(&self, path: &Path, mode: mode_t) -> TetherResult<()> {
        std::fs::set_permissions(
            self.cache_path_of(path),
            std::fs::Permissions::from_mode(mode as u32 & 0o7777),
        )
        .map_err(|e| TetherError::from_io(path, e))
    }

    /// Ownership on the cache copy is best effort: the daemon usually isn't
    /// root, and the authoritative owner lives in the metadata store anyway
    pub fn chown(&self, path: &Path, uid: uid_t, gid: gid_t) -> TetherResult<()> {
        match util::lchown(&self.cache_path_of(path), uid, gid) {
            Ok(_) => Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EPERM) => {
                trace!(
                    target: TAG,
                    "Not permitted to chown cache copy of {}, metadata store keeps the truth",
                    path.display()
                );
                Ok(())
            }
            Err(e) => Err(TetherError::from_io(path, e)),
        }
    }

    pub fn utime(&self, path: &Path, atime: f64, mtime: f64) -> TetherResult<()> {
        util::utimes(&self.cache_path_of(path), atime, mtime)
            .map_err(|e| TetherError::from_io(path, e))
    }

    pub fn readdir(&self, path: &Path) -> TetherResult<Vec<DirEntry>> {
        let cpath = self.cache_path_of(path);
        let mut entries = Vec::new();

        for maybe_entry in std::fs::read_dir(&cpath).map_err(|e| TetherError::from_io(path, e))? {
            let entry = maybe_entry.map_err(|e| TetherError::from_io(path, e))?;
            let md = entry
                .path()
                .symlink_metadata()
                .map_err(|e| TetherError::from_io(path, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                mode: md.mode() as mode_t,
            });
        }
        Ok(entries)
    }
}
