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

//! Small POSIX helpers shared by the local cache store and the mounted-tree
//! remote backend, mostly places where std::fs doesn't reach.

use super::StatFs;
use libc::{gid_t, uid_t};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::path::Path;

/// Maps raw open(2) flags onto OpenOptions.
/// O_RDONLY is 0, so we start from read-only and can't bitwise test for it like the others.
pub fn open_opts_from_flags(opts: &mut OpenOptions, flags: i32) -> &mut OpenOptions {
    let mut fopts = opts.read(true).write(false);

    let flags = flags as u32;
    if flags & (libc::O_RDWR as u32) > 0 {
        fopts = fopts.read(true).write(true)
    } else if flags & (libc::O_WRONLY as u32) > 0 {
        fopts = fopts.read(false).write(true)
    }
    if flags & (libc::O_APPEND as u32) > 0 {
        fopts = fopts.append(true)
    }
    fopts
}

pub fn truncate(path: &Path, size: i64) -> std::io::Result<()> {
    let c_path = CString::new(path.to_string_lossy().to_string()).unwrap();
    let err;
    unsafe { err = libc::truncate(c_path.as_ptr(), size) }
    if err == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets atime/mtime from float epoch seconds, the precision the metadata
/// store works in
pub fn utimes(path: &Path, atime: f64, mtime: f64) -> std::io::Result<()> {
    let c_path = CString::new(path.to_string_lossy().to_string()).unwrap();

    let to_timeval = |secs: f64| libc::timeval {
        tv_sec: secs.trunc() as libc::time_t,
        tv_usec: (secs.fract() * 1e6) as libc::suseconds_t,
    };
    let times = [to_timeval(atime), to_timeval(mtime)];

    let err;
    unsafe { err = libc::utimes(c_path.as_ptr(), times.as_ptr()) }
    if err == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// lchown, since the overlay must never follow a cached symlink while
/// adjusting ownership.  EPERM is the caller's problem to tolerate.
pub fn lchown(path: &Path, uid: uid_t, gid: gid_t) -> std::io::Result<()> {
    let c_path = CString::new(path.to_string_lossy().to_string()).unwrap();
    let err;
    unsafe { err = libc::lchown(c_path.as_ptr(), uid, gid) }
    if err == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Filesystem figures for statfs, taken from whatever filesystem backs `path`
pub fn statfs_for(path: &Path) -> std::io::Result<StatFs> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| std::io::Error::from_raw_os_error(e.as_errno().map(|e| e as i32).unwrap_or(libc::EIO)))?;

    Ok(StatFs {
        block_size: stat.block_size() as u64,
        fragment_size: stat.fragment_size() as u64,
        blocks: stat.blocks() as u64,
        blocks_free: stat.blocks_free() as u64,
        blocks_avail: stat.blocks_available() as u64,
        files: stat.files() as u64,
        files_free: stat.files_free() as u64,
        name_max: stat.name_max() as u64,
    })
}
