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

//! The mounted-tree backend.  Every supported protocol ends up as a kernel
//! (or fuse) mount at a private mount point, and from then on the remote is
//! just POSIX calls against that tree.  The protocol choice only decides the
//! mount command line and which port the liveness probe knocks on.

use super::{Remote, RemoteHandle, REMOTE_TAG};
use crate::common::err::{TetherError, TetherResult};
use crate::common::settings::config::{Remote as RemoteConf, RemoteType};
use crate::common::types::{DirEntry, FileAttr};
use crate::fuse::util;
use libc::{gid_t, mode_t, uid_t};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const PING_TIMEOUT_MS: u64 = 2000;

pub struct FsRemote {
    conf: RemoteConf,
    mount_point: PathBuf,
}

impl FsRemote {
    pub fn new(conf: RemoteConf, mount_point: PathBuf) -> Self {
        Self { conf, mount_point }
    }

    /// Translates an overlay path into the corresponding path under the
    /// backend mount point
    fn remote_path_of(&self, path: &Path) -> PathBuf {
        let rhs = path.strip_prefix("/").unwrap_or(path);
        self.mount_point.join(rhs)
    }

    /// io errors against a network mount get a second look: the timeouts and
    /// unreachable-host errnos mean the remote is gone, not that the
    /// operation was invalid
    fn rerr(&self, path: &Path, e: std::io::Error) -> TetherError {
        match e.raw_os_error() {
            Some(raw)
                if raw == libc::ETIMEDOUT
                    || raw == libc::ENOTCONN
                    || raw == libc::EHOSTUNREACH
                    || raw == libc::EHOSTDOWN
                    || raw == libc::ENXIO =>
            {
                TetherError::IoTransient(Box::new(e))
            }
            _ => TetherError::from_io(path, e),
        }
    }

    /// The host component of the backend source URI, plus the port its
    /// protocol answers on
    fn server_addr(&self) -> Option<(String, u16)> {
        let source = self.conf.source.as_str();
        match self.conf.kind {
            // host:/export
            RemoteType::Nfs => source.split(':').next().map(|h| (h.to_string(), 2049)),
            // //host/share
            RemoteType::Samba => source
                .trim_start_matches('/')
                .split('/')
                .next()
                .map(|h| (h.to_string(), 445)),
            // [user@]host:/path
            RemoteType::Sshfs => source
                .split(':')
                .next()
                .map(|h| h.rsplit('@').next().unwrap_or(h))
                .map(|h| (h.to_string(), 22)),
            // http[s]://host/path
            RemoteType::Webdav => {
                let (rest, port) = if let Some(rest) = source.strip_prefix("https://") {
                    (rest, 443)
                } else if let Some(rest) = source.strip_prefix("http://") {
                    (rest, 80)
                } else {
                    (source, 80)
                };
                rest.split('/').next().map(|h| (h.to_string(), port))
            }
        }
    }

    fn mount_command(&self) -> Command {
        let mp = self.mount_point.to_string_lossy().to_string();
        let mut cmd;

        match self.conf.kind {
            RemoteType::Nfs => {
                cmd = Command::new("mount");
                cmd.args(&["-t", "nfs"]);
                if !self.conf.options.is_empty() {
                    cmd.arg("-o").arg(&self.conf.options);
                }
                cmd.arg(&self.conf.source).arg(&mp);
            }
            RemoteType::Samba => {
                cmd = Command::new("mount");
                cmd.args(&["-t", "cifs"]);
                if !self.conf.options.is_empty() {
                    cmd.arg("-o").arg(&self.conf.options);
                }
                cmd.arg(&self.conf.source).arg(&mp);
            }
            RemoteType::Sshfs => {
                cmd = Command::new("sshfs");
                if !self.conf.options.is_empty() {
                    cmd.arg("-o").arg(&self.conf.options);
                }
                cmd.arg(&self.conf.source).arg(&mp);
            }
            RemoteType::Webdav => {
                cmd = Command::new("mount");
                cmd.args(&["-t", "davfs"]);
                if !self.conf.options.is_empty() {
                    cmd.arg("-o").arg(&self.conf.options);
                }
                cmd.arg(&self.conf.source).arg(&mp);
            }
        }
        cmd
    }

    fn unmount_command(&self) -> Command {
        let mp = self.mount_point.to_string_lossy().to_string();
        match self.conf.kind {
            RemoteType::Sshfs => {
                let mut cmd = Command::new("fusermount");
                cmd.arg("-u").arg(&mp);
                cmd
            }
            _ => {
                let mut cmd = Command::new("umount");
                cmd.arg(&mp);
                cmd
            }
        }
    }
}

impl Remote for FsRemote {
    fn ping(&self) -> bool {
        let (host, port) = match self.server_addr() {
            Some(addr) => addr,
            None => {
                warn!(
                    target: REMOTE_TAG,
                    "No server host in source {:?}, skipping ping", self.conf.source
                );
                return false;
            }
        };

        let addrs = match (host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(_) => return false,
        };

        for addr in addrs {
            if TcpStream::connect_timeout(&addr, Duration::from_millis(PING_TIMEOUT_MS)).is_ok() {
                return true;
            }
        }
        false
    }

    fn mount(&self) -> TetherResult<()> {
        if self.is_mounted() {
            debug!(target: REMOTE_TAG, "Already mounted, nothing to do");
            return Ok(());
        }

        std::fs::create_dir_all(&self.mount_point)
            .map_err(|e| self.rerr(&self.mount_point, e))?;

        let mut cmd = self.mount_command();
        info!(target: REMOTE_TAG, "Mounting remote: {:?}", cmd);

        let status = cmd.status().map_err(|e| self.rerr(&self.mount_point, e))?;
        if !status.success() {
            return Err(TetherError::IoTransient(
                format!("mount command exited with {}", status).into(),
            ));
        }
        Ok(())
    }

    fn unmount(&self) -> TetherResult<()> {
        if !self.is_mounted() {
            return Ok(());
        }

        let mut cmd = self.unmount_command();
        info!(target: REMOTE_TAG, "Unmounting remote: {:?}", cmd);

        let status = cmd.status().map_err(|e| self.rerr(&self.mount_point, e))?;
        if !status.success() {
            warn!(
                target: REMOTE_TAG,
                "Unmount command exited with {}", status
            );
        }
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        // a live mount point sits on a different device than its parent
        let parent = match self.mount_point.parent() {
            Some(p) => p,
            None => return false,
        };
        let mp_dev = match crate::common::get_device_inode(&self.mount_point) {
            Ok((dev, _)) => dev,
            Err(_) => return false,
        };
        let parent_dev = match crate::common::get_device_inode(parent) {
            Ok((dev, _)) => dev,
            Err(_) => return false,
        };
        mp_dev != parent_dev
    }

    fn open(&self, path: &Path, flags: i32) -> TetherResult<RemoteHandle> {
        let rpath = self.remote_path_of(path);
        let mut opts = OpenOptions::new();
        util::open_opts_from_flags(&mut opts, flags);
        if flags & libc::O_CREAT > 0 {
            opts.create(true).mode(0o600);
        }

        let file = opts.open(&rpath).map_err(|e| self.rerr(path, e))?;
        Ok(RemoteHandle {
            file,
            path: path.to_owned(),
        })
    }

    fn read(&self, handle: &mut RemoteHandle, offset: u64, size: usize) -> TetherResult<Vec<u8>> {
        let path = handle.path.clone();
        let mut buf = vec![0u8; size];
        let mut filled = 0usize;

        // read_at can return short before EOF, so loop until it really is EOF
        while filled < size {
            let n = handle
                .file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| self.rerr(&path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, handle: &mut RemoteHandle, offset: u64, data: &[u8]) -> TetherResult<usize> {
        let path = handle.path.clone();
        handle
            .file
            .write_all_at(data, offset)
            .map_err(|e| self.rerr(&path, e))?;
        Ok(data.len())
    }

    fn close(&self, handle: RemoteHandle) -> TetherResult<()> {
        let path = handle.path.clone();
        handle.file.sync_all().map_err(|e| self.rerr(&path, e))?;
        drop(handle);
        Ok(())
    }

    fn read_region(&self, path: &Path, start: u64, end: u64) -> TetherResult<Vec<u8>> {
        let mut handle = self.open(path, libc::O_RDONLY)?;
        let data = self.read(&mut handle, start, (end - start) as usize)?;
        self.close(handle)?;
        Ok(data)
    }

    fn write_region(&self, path: &Path, start: u64, data: &[u8]) -> TetherResult<()> {
        let mut handle = self.open(path, libc::O_WRONLY)?;
        self.write(&mut handle, start, data)?;
        self.close(handle)?;
        Ok(())
    }

    fn copy_from(
        &self,
        path: &Path,
        src: &mut dyn std::io::Read,
        mode: mode_t,
    ) -> TetherResult<u64> {
        let rpath = self.remote_path_of(path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode & 0o7777)
            .open(&rpath)
            .map_err(|e| self.rerr(path, e))?;

        let copied = std::io::copy(src, &mut file).map_err(|e| self.rerr(path, e))?;
        file.sync_all().map_err(|e| self.rerr(path, e))?;
        Ok(copied)
    }

    fn copy_to(&self, path: &Path, dst: &mut dyn std::io::Write) -> TetherResult<u64> {
        let rpath = self.remote_path_of(path);
        let mut file = std::fs::File::open(&rpath).map_err(|e| self.rerr(path, e))?;
        let copied = std::io::copy(&mut file, dst).map_err(|e| self.rerr(path, e))?;
        Ok(copied)
    }

    fn truncate(&self, path: &Path, size: u64) -> TetherResult<()> {
        util::truncate(&self.remote_path_of(path), size as i64).map_err(|e| self.rerr(path, e))
    }

    fn lstat(&self, path: &Path) -> TetherResult<FileAttr> {
        let rpath = self.remote_path_of(path);
        let st =
            nix::sys::stat::lstat(&rpath).map_err(|e| TetherError::from_nix(path, e))?;

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

    fn readdir(&self, path: &Path) -> TetherResult<Vec<DirEntry>> {
        let rpath = self.remote_path_of(path);
        let mut entries = Vec::new();

        for maybe_entry in std::fs::read_dir(&rpath).map_err(|e| self.rerr(path, e))? {
            let entry = maybe_entry.map_err(|e| self.rerr(path, e))?;
            let md = entry
                .path()
                .symlink_metadata()
                .map_err(|e| self.rerr(path, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                mode: md.mode() as mode_t,
            });
        }
        Ok(entries)
    }

    fn mkdir(&self, path: &Path, mode: mode_t) -> TetherResult<()> {
        let rpath = self.remote_path_of(path);
        std::fs::create_dir(&rpath).map_err(|e| self.rerr(path, e))?;
        std::fs::set_permissions(&rpath, std::fs::Permissions::from_mode(mode as u32 & 0o7777))
            .map_err(|e| self.rerr(path, e))
    }

    fn rmdir(&self, path: &Path) -> TetherResult<()> {
        std::fs::remove_dir(self.remote_path_of(path)).map_err(|e| self.rerr(path, e))
    }

    fn unlink(&self, path: &Path) -> TetherResult<()> {
        std::fs::remove_file(self.remote_path_of(path)).map_err(|e| self.rerr(path, e))
    }

    fn symlink(&self, target: &Path, link: &Path) -> TetherResult<()> {
        std::os::unix::fs::symlink(target, self.remote_path_of(link))
            .map_err(|e| self.rerr(link, e))
    }

    fn readlink(&self, path: &Path) -> TetherResult<PathBuf> {
        std::fs::read_link(self.remote_path_of(path)).map_err(|e| self.rerr(path, e))
    }

    fn rename(&self, old: &Path, new: &Path) -> TetherResult<()> {
        std::fs::rename(self.remote_path_of(old), self.remote_path_of(new))
            .map_err(|e| self.rerr(old, e))
    }

    fn chmod(&self, path: &Path, mode: mode_t) -> TetherResult<()> {
        std::fs::set_permissions(
            self.remote_path_of(path),
            std::fs::Permissions::from_mode(mode as u32 & 0o7777),
        )
        .map_err(|e| self.rerr(path, e))
    }

    fn chown(&self, path: &Path, uid: uid_t, gid: gid_t) -> TetherResult<()> {
        util::lchown(&self.remote_path_of(path), uid, gid).map_err(|e| self.rerr(path, e))
    }

    fn utime(&self, path: &Path, atime: f64, mtime: f64) -> TetherResult<()> {
        util::utimes(&self.remote_path_of(path), atime, mtime).map_err(|e| self.rerr(path, e))
    }

    fn getxattr(&self, path: &Path, name: &str) -> TetherResult<Vec<u8>> {
        let rpath = self.remote_path_of(path);
        match xattr::get(&rpath, name).map_err(|e| self.rerr(path, e))? {
            Some(val) => Ok(val),
            None => Err(TetherError::NotFound(path.to_owned())),
        }
    }

    fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> TetherResult<()> {
        xattr::set(self.remote_path_of(path), name, value).map_err(|e| self.rerr(path, e))
    }

    fn listxattr(&self, path: &Path) -> TetherResult<Vec<String>> {
        let names = xattr::list(self.remote_path_of(path)).map_err(|e| self.rerr(path, e))?;
        Ok(names
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn removexattr(&self, path: &Path, name: &str) -> TetherResult<()> {
        xattr::remove(self.remote_path_of(path), name).map_err(|e| self.rerr(path, e))
    }
}
