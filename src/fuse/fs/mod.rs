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

//! The `Filesystem` implementation the kernel bridge drives.  Thin by
//! design: translate the request, delegate to the cache manager, map the
//! error.  The POSIX permission gates that belong to the calling layer
//! (parent write access for unlink, owner checks for chmod) live here.

use crate::cache::CacheManager;
use crate::common::err::TetherError;
use crate::common::log::{REQUEST_ID, REQ_COUNTER};
use crate::common::notify::Notifier;
use crate::common::settings::Settings;
use crate::common::types::{DirEntry, FileAttr};
use crate::fuse::err::FuseErrno;
use crate::fuse::{util, Filesystem, FuseResult, Request, StatFs};
use crate::meta::MetaStore;
use crate::remote::Remote;
use crate::sync::state::OverlayState;
use crate::synclog::SyncLog;
use libc::{gid_t, mode_t, uid_t};
use log::{debug, info};
use nix::errno::Errno::{ENODATA, EOPNOTSUPP, EPERM};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub mod xattr;

const OP_TAG: &str = "tether_op";

/// Everything the overlay is made of, built once at mount and handed to the
/// bridge.  There are no process-wide singletons; tearing this down is the
/// whole shutdown story.
pub struct OverlayContext {
    pub settings: Arc<Settings>,
    pub meta: Arc<MetaStore>,
    pub log: Arc<SyncLog>,
    pub cache: Arc<CacheManager>,
    pub remote: Arc<dyn Remote>,
    pub state: Arc<OverlayState>,
}

pub struct OverlayFilesystem<N>
where
    N: Notifier + 'static,
{
    ctx: Arc<OverlayContext>,
    notifier: Arc<Mutex<N>>,
    xattrs: xattr::XattrRegistry,
}

impl<N> OverlayFilesystem<N>
where
    N: Notifier,
{
    #[must_use]
    pub fn new(ctx: Arc<OverlayContext>, notifier: Arc<Mutex<N>>) -> Self {
        Self {
            ctx,
            notifier,
            xattrs: xattr::XattrRegistry::standard(),
        }
    }

    pub fn context(&self) -> Arc<OverlayContext> {
        Arc::clone(&self.ctx)
    }

    /// rename(2)'s permission story: write on both parents, and write on the
    /// source itself when it's a directory (the `..` entry gets rewritten)
    fn check_rename_access(&self, req: &Request, old: &Path, new: &Path) -> FuseResult<()> {
        let old_attr = self.ctx.cache.stat(old)?;

        if old_attr.is_dir() {
            self.ctx.cache.access(req, old, libc::W_OK)?;
        }

        if let Some(parent) = old.parent() {
            self.ctx
                .cache
                .access(req, parent, libc::W_OK | libc::X_OK)?;
        }
        if let Some(parent) = new.parent() {
            self.ctx
                .cache
                .access(req, parent, libc::W_OK | libc::X_OK)?;
        }
        Ok(())
    }

    fn check_parent_write(&self, req: &Request, path: &Path) -> FuseResult<()> {
        if let Some(parent) = path.parent() {
            self.ctx.cache.access(req, parent, libc::W_OK)?;
        }
        Ok(())
    }
}

impl<N> Filesystem for OverlayFilesystem<N>
where
    N: Notifier,
{
    fn init_request_id(&self) {
        let req_id = REQ_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        REQUEST_ID.with(|id| *id.borrow_mut() = req_id);
    }

    fn getattr(&self, _req: &Request, path: &Path) -> FuseResult<FileAttr> {
        debug!(target: OP_TAG, "opcode: getattr | path: {}", path.display());
        Ok(self.ctx.cache.stat(path)?)
    }

    fn access(&self, req: &Request, path: &Path, mask: i32) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: access | path: {} | mask: {:o}",
            path.display(),
            mask
        );
        Ok(self.ctx.cache.access(req, path, mask)?)
    }

    fn readdir(&self, _req: &Request, path: &Path) -> FuseResult<Vec<DirEntry>> {
        debug!(target: OP_TAG, "opcode: readdir | path: {}", path.display());
        Ok(self.ctx.cache.readdir(path)?)
    }

    fn readlink(&self, _req: &Request, path: &Path) -> FuseResult<PathBuf> {
        debug!(target: OP_TAG, "opcode: readlink | path: {}", path.display());
        Ok(self.ctx.cache.readlink(path)?)
    }

    fn open(
        &self,
        req: &Request,
        path: &Path,
        flags: i32,
        mode: Option<mode_t>,
    ) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: open | path: {} | flags: {:o}",
            path.display(),
            flags
        );
        if flags & libc::O_CREAT > 0 {
            self.check_parent_write(req, path)?;
        }
        Ok(self.ctx.cache.open(req, path, flags, mode)?)
    }

    fn read(&self, _req: &Request, path: &Path, offset: i64, size: usize) -> FuseResult<Vec<u8>> {
        debug!(
            target: OP_TAG,
            "opcode: read | path: {} | offset: {} | size: {}",
            path.display(),
            offset,
            size
        );
        if offset < 0 {
            return Err(nix::errno::Errno::EINVAL.into());
        }
        Ok(self.ctx.cache.read(path, offset as u64, size)?)
    }

    fn write(&self, _req: &Request, path: &Path, data: &[u8], offset: i64) -> FuseResult<usize> {
        debug!(
            target: OP_TAG,
            "opcode: write | path: {} | offset: {} | len: {}",
            path.display(),
            offset,
            data.len()
        );
        Ok(self.ctx.cache.write(path, offset, data)?)
    }

    fn truncate(&self, req: &Request, path: &Path, size: u64) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: truncate | path: {} | size: {}",
            path.display(),
            size
        );
        Ok(self.ctx.cache.truncate(req, path, size)?)
    }

    fn release(&self, _req: &Request, path: &Path) -> FuseResult<()> {
        debug!(target: OP_TAG, "opcode: release | path: {}", path.display());
        // the overlay holds no per-handle state; everything was durable at
        // write time
        Ok(())
    }

    fn mknod(&self, req: &Request, path: &Path, mode: mode_t, rdev: u64) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: mknod | path: {} | mode: {:o}",
            path.display(),
            mode
        );
        self.check_parent_write(req, path)?;
        Ok(self.ctx.cache.mknod(req, path, mode, rdev)?)
    }

    fn mkdir(&self, req: &Request, path: &Path, mode: mode_t) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: mkdir | path: {} | mode: {:o}",
            path.display(),
            mode
        );
        self.check_parent_write(req, path)?;
        Ok(self.ctx.cache.mkdir(req, path, mode)?)
    }

    fn symlink(&self, req: &Request, target: &Path, link: &Path) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: symlink | target: {} | link: {}",
            target.display(),
            link.display()
        );
        if let Some(parent) = link.parent() {
            self.ctx
                .cache
                .access(req, parent, libc::W_OK | libc::X_OK)?;
        }
        Ok(self.ctx.cache.symlink(req, target, link)?)
    }

    fn link(&self, _req: &Request, src: &Path, dst: &Path) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: link | src: {} | dst: {}",
            src.display(),
            dst.display()
        );
        // hardlinks across a disconnection boundary are a can of worms;
        // they've never been supported
        Err(EOPNOTSUPP.into())
    }

    fn unlink(&self, req: &Request, path: &Path) -> FuseResult<()> {
        debug!(target: OP_TAG, "opcode: unlink | path: {}", path.display());
        self.check_parent_write(req, path)?;
        Ok(self.ctx.cache.unlink(req, path)?)
    }

    fn rmdir(&self, req: &Request, path: &Path) -> FuseResult<()> {
        debug!(target: OP_TAG, "opcode: rmdir | path: {}", path.display());
        self.ctx.cache.access(req, path, libc::W_OK)?;
        Ok(self.ctx.cache.rmdir(req, path)?)
    }

    fn rename(&self, req: &Request, old: &Path, new: &Path) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: rename | old: {} | new: {}",
            old.display(),
            new.display()
        );
        self.check_rename_access(req, old, new)?;
        Ok(self.ctx.cache.rename(req, old, new)?)
    }

    fn chmod(&self, req: &Request, path: &Path, mode: mode_t) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: chmod | path: {} | mode: {:o}",
            path.display(),
            mode
        );
        let attr = self.ctx.cache.stat(path)?;
        if req.uid != 0 && req.uid != attr.uid {
            return Err(EPERM.into());
        }
        Ok(self.ctx.cache.chmod(req, path, mode)?)
    }

    fn chown(&self, req: &Request, path: &Path, uid: uid_t, gid: gid_t) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: chown | path: {} | {}:{}",
            path.display(),
            uid,
            gid
        );
        let attr = self.ctx.cache.stat(path)?;
        // only root may reassign ownership; an owner may hand the file to
        // one of their own groups
        if req.uid != 0 {
            if uid != attr.uid || req.uid != attr.uid {
                return Err(EPERM.into());
            }
            if !crate::common::gids_for_uid(req.uid, req.gid).contains(&gid) {
                return Err(EPERM.into());
            }
        }
        Ok(self.ctx.cache.chown(req, path, uid, gid)?)
    }

    fn utime(&self, req: &Request, path: &Path, atime: f64, mtime: f64) -> FuseResult<()> {
        debug!(target: OP_TAG, "opcode: utime | path: {}", path.display());
        let attr = self.ctx.cache.stat(path)?;
        if req.uid != 0 && req.uid != attr.uid {
            self.ctx.cache.access(req, path, libc::W_OK)?;
        }
        Ok(self.ctx.cache.utime(req, path, atime, mtime)?)
    }

    fn setxattr(&self, _req: &Request, path: &Path, name: &str, value: &[u8]) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: setxattr | path: {} | name: {}",
            path.display(),
            name
        );

        if let Some(result) = self.xattrs.set(&self.ctx, path, name, value) {
            result?;

            // pause transitions are worth telling the world about
            if name == crate::common::constants::XATTR_PAUSE_SYNC {
                let result = if self.ctx.state.is_sync_paused() {
                    self.notifier.lock().sync_paused()
                } else {
                    self.notifier.lock().sync_resumed()
                };
                if let Err(e) = result {
                    info!(target: OP_TAG, "Couldn't publish pause note: {:?}", e);
                }
            }
            return Ok(());
        }

        Ok(self.ctx.cache.setxattr(path, name, value)?)
    }

    fn getxattr(&self, _req: &Request, path: &Path, name: &str) -> FuseResult<Vec<u8>> {
        debug!(
            target: OP_TAG,
            "opcode: getxattr | path: {} | name: {}",
            path.display(),
            name
        );

        if let Some(result) = self.xattrs.get(&self.ctx, path, name) {
            return result;
        }

        match self.ctx.cache.getxattr(path, name) {
            Ok(value) => Ok(value),
            Err(TetherError::NotFound(_)) => {
                // the path exists but the attribute doesn't
                if self.ctx.cache.stat(path).is_ok() {
                    Err(ENODATA.into())
                } else {
                    Err(nix::errno::Errno::ENOENT.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn listxattr(&self, _req: &Request, path: &Path) -> FuseResult<Vec<String>> {
        debug!(target: OP_TAG, "opcode: listxattr | path: {}", path.display());

        let mut names = self.ctx.cache.listxattr(path)?;
        names.extend(self.xattrs.names_for(path));
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn removexattr(&self, _req: &Request, path: &Path, name: &str) -> FuseResult<()> {
        debug!(
            target: OP_TAG,
            "opcode: removexattr | path: {} | name: {}",
            path.display(),
            name
        );

        if self.xattrs.is_registered(name) {
            // overlay attributes don't get removed, only toggled
            return Err(EOPNOTSUPP.into());
        }

        match self.ctx.cache.removexattr(path, name) {
            Ok(_) => Ok(()),
            Err(TetherError::NotFound(_)) if self.ctx.cache.stat(path).is_ok() => {
                Err(ENODATA.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn statfs(&self, _req: &Request, path: &Path) -> FuseResult<StatFs> {
        debug!(target: OP_TAG, "opcode: statfs | path: {}", path.display());
        // the cache filesystem is what actually fills up
        Ok(util::statfs_for(&self.ctx.settings.cache_dir())?)
    }
}
