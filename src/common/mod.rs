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

use std::ffi::CStr;
use std::path::Path;

use crate::common::constants::VERSION;
use libc::{gid_t, uid_t};
use nix::sys::stat::stat;

pub mod constants;
pub mod err;
pub mod log;
pub mod notify;
pub mod settings;
pub mod types;
pub mod xattr;

/// Takes a normal path on the filesystem and gets the device and inode nums
pub fn get_device_inode(path: &Path) -> err::TetherResult<(u64, u64)> {
    let st = stat(path).map_err(|e| err::TetherError::from_nix(path, e))?;
    // on macos, st_dev is a i32.
    let dev = st.st_dev as u64;
    Ok((dev, st.st_ino))
}

/// Maps an overlay path to the flat filename its conflict changeset lives
/// under.  "/dir/b.txt" becomes "-dir-b.txt", so every conflicted path gets a
/// unique, single-component name inside the conflict directory.
pub fn conflict_file_name(path: &Path) -> String {
    path.to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "-")
}

/// All of the group ids `uid` belongs to, including `gid`.  Used by the
/// access check to honor supplementary group membership.
pub fn gids_for_uid(uid: uid_t, gid: gid_t) -> Vec<gid_t> {
    let mut gids = vec![gid];

    let name_buf = unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            return gids;
        }
        CStr::from_ptr((*pw).pw_name).to_owned()
    };

    let mut groups: Vec<gid_t> = vec![0; 64];
    let mut ngroups = groups.len() as libc::c_int;
    let rc = unsafe {
        libc::getgrouplist(
            name_buf.as_ptr(),
            gid,
            groups.as_mut_ptr(),
            &mut ngroups as *mut libc::c_int,
        )
    };

    if rc >= 0 {
        groups.truncate(ngroups as usize);
        for g in groups {
            if !gids.contains(&g) {
                gids.push(g);
            }
        }
    }

    gids
}

pub fn version_str() -> String {
    format!("{}.{}.{}", VERSION.0, VERSION.1, VERSION.2)
}
