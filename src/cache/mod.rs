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

//! The cache manager: the policy engine every request funnels through.  Each
//! operation takes the path lock, asks the planner what the world looks
//! like, executes the plan's side effects (pull into cache, drop from cache,
//! quarantine), performs the operation on the side the plan names, keeps the
//! metadata store honest, and journals mutations into the sync log.

use crate::common::err::{TetherError, TetherResult};
use crate::common::settings::Settings;
use crate::common::types::{DirEntry, FileAttr, FileType};
use crate::fuse::Request;
use crate::meta::types::{FileRecord, SyncChange};
use crate::meta::{get_now_secs, synthesize_revision, MetaStore};
use crate::remote::Remote;
use crate::sync::state::OverlayState;
use crate::synclog::conflict::ConflictHandler;
use crate::synclog::{region, MetaChanges, SyncLog};
use libc::{gid_t, mode_t, uid_t};
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod lockpool;
pub mod plan;
pub mod policy;
pub mod store;

use lockpool::PathLocks;
use plan::{gen_opcodes, rewrite_for_create, serve_side, Opcode, PlanInput};
use policy::CachePolicy;
use store::CacheStore;

pub const CACHE_TAG: &str = "cache";

pub struct CacheManager {
    settings: Arc<Settings>,
    meta: Arc<MetaStore>,
    store: Arc<CacheStore>,
    remote: Arc<dyn Remote>,
    log: Arc<SyncLog>,
    locks: Arc<PathLocks>,
    state: Arc<OverlayState>,
    policy: RwLock<CachePolicy>,
    conflicts: ConflictHandler,
}

impl CacheManager {
    pub fn new(
        settings: Arc<Settings>,
        meta: Arc<MetaStore>,
        store: Arc<CacheStore>,
        remote: Arc<dyn Remote>,
        log: Arc<SyncLog>,
        locks: Arc<PathLocks>,
        state: Arc<OverlayState>,
    ) -> TetherResult<Self> {
        let mut policy = CachePolicy::new(settings.cache_spec_file());
        policy.load()?;

        let conflicts = ConflictHandler::new(
            settings.conflict_dir(),
            Arc::clone(&meta),
            Arc::clone(&store),
            Arc::clone(&locks),
        );

        Ok(Self {
            settings,
            meta,
            store,
            remote,
            log,
            locks,
            state,
            policy: RwLock::new(policy),
            conflicts,
        })
    }

    // ------------------------------------------------------------------
    // predicates and planning

    pub fn is_cached_to_disk(&self, path: &Path) -> bool {
        self.store.exists(path)
    }

    pub fn should_cache(&self, path: &Path) -> bool {
        self.policy.read().should_cache(path)
    }

    /// The explicit policy entry for `path`, if the user set one
    pub fn policy_entry(&self, path: &Path) -> Option<bool> {
        self.policy.read().explicit(path)
    }

    /// Pin, ban, or reset the cache policy for a prefix
    pub fn set_policy(&self, path: &Path, entry: Option<bool>) -> TetherResult<()> {
        let mut policy = self.policy.write();
        match entry {
            Some(cache) => policy.set(path, cache),
            None => policy.clear(path),
        }
    }

    /// `cached_revision < remote_revision` and the mtimes disagree.  Never
    /// true when the remote is down or the path was never stat-cached.
    fn remote_changed(&self, path: &Path) -> TetherResult<bool> {
        let rec = match self.meta.try_get(path)? {
            Some(rec) => rec,
            None => return Ok(true),
        };

        let remote_attr = match self.remote.lstat(path) {
            Ok(attr) => attr,
            Err(TetherError::NotFound(_)) => return Ok(false),
            Err(e) => {
                self.check_remote_err(&e);
                return Err(e);
            }
        };
        let remote_rev = synthesize_revision(remote_attr.size, remote_attr.mtime);

        let cached = match self.meta.get_cached_rev(rec.id)? {
            Some(cached) => cached,
            // stats never cached
            None => return Ok(true),
        };

        trace!(
            target: CACHE_TAG,
            "{} changed?  remote ({},{}), cached ({},{})",
            path.display(),
            remote_rev,
            remote_attr.mtime,
            cached.revision,
            cached.mtime
        );

        Ok(cached.revision < remote_rev && (cached.mtime - remote_attr.mtime).abs() > 1e-9)
    }

    fn plan_input(&self, path: &Path, for_stat: bool) -> TetherResult<PlanInput> {
        let cached = self.store.exists(path);
        let remote_up = self.state.is_available();

        let remote_changed = if cached && remote_up {
            self.remote_changed(path).unwrap_or(false)
        } else {
            false
        };

        Ok(PlanInput {
            cached,
            should_cache: self.should_cache(path),
            remote_up,
            remote_changed,
            cached_dirty: self.log.is_dirty(path)?,
            for_stat,
            unlinked: self.log.is_unlinked(path)?,
        })
    }

    fn gen_plan(&self, path: &Path, for_stat: bool) -> TetherResult<Vec<Opcode>> {
        let input = self.plan_input(path, for_stat)?;
        let plan = gen_opcodes(&input);
        debug!(
            target: CACHE_TAG,
            "Opcodes for {} are {:?}",
            path.display(),
            plan
        );
        Ok(plan)
    }

    /// Runs the side-effect opcodes of a plan, leaving the world in the
    /// state the serving side expects
    fn validate_cache(&self, path: &Path, plan: &[Opcode]) -> TetherResult<()> {
        for opcode in plan {
            match opcode {
                Opcode::RemoveCache => {
                    debug!(target: CACHE_TAG, "Removing cached file {}", path.display());
                    self.remove_cached_file_locked(path, false)?;
                }
                Opcode::CacheFile => {
                    debug!(target: CACHE_TAG, "Updating cache of file {}", path.display());
                    self.cache_file(path)?;
                }
                Opcode::MergeConflict => {
                    info!(target: CACHE_TAG, "Merge/conflict on {}", path.display());
                    self.merge_conflict(path)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A transient remote failure during plan execution means the remote is
    /// gone; drop the availability flag so everything fails over to the cache
    fn check_remote_err(&self, e: &TetherError) {
        if e.is_disconnect() {
            warn!(
                target: CACHE_TAG,
                "Remote error marked transient, entering disconnected mode: {:?}", e
            );
            self.state.set_available(false);
            let _ = self.remote.unmount();
        }
    }

    // ------------------------------------------------------------------
    // record upkeep

    /// Builds or refreshes the file record from a remote stat
    fn record_from_remote(&self, path: &Path, attr: &FileAttr) -> TetherResult<FileRecord> {
        let revision = synthesize_revision(attr.size, attr.mtime);

        let mut rec = match self.meta.try_get(path)? {
            Some(mut rec) => {
                rec.mode = attr.mode;
                rec.uid = attr.uid;
                rec.gid = attr.gid;
                rec.size = attr.size;
                rec.atime = attr.atime;
                rec.mtime = attr.mtime;
                rec.ctime = attr.ctime;
                rec.rdev = attr.rdev;
                rec.remote_revision = revision;
                rec
            }
            None => FileRecord {
                id: 0,
                path: path.to_owned(),
                mode: attr.mode,
                uid: attr.uid,
                gid: attr.gid,
                size: attr.size,
                atime: attr.atime,
                mtime: attr.mtime,
                ctime: attr.ctime,
                remote_revision: revision,
                link_target: None,
                rdev: attr.rdev,
                xattrs: Default::default(),
                tags: Default::default(),
                acl: None,
            },
        };

        if attr.file_type() == Some(FileType::Symlink) && rec.link_target.is_none() {
            rec.link_target = self.remote.readlink(path).ok();
        }

        self.meta.put(&mut rec)?;
        Ok(rec)
    }

    /// The record for a path, synthesized from the cache copy when the store
    /// has never heard of it (a cache tree surviving a metadata rebuild)
    fn record_or_synth(&self, path: &Path) -> TetherResult<FileRecord> {
        if let Some(rec) = self.meta.try_get(path)? {
            return Ok(rec);
        }

        let attr = self.store.lstat(path)?;
        debug!(
            target: CACHE_TAG,
            "No record for cached {}, synthesizing one",
            path.display()
        );
        let mut rec = FileRecord {
            id: 0,
            path: path.to_owned(),
            mode: attr.mode,
            uid: attr.uid,
            gid: attr.gid,
            size: attr.size,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            remote_revision: 0,
            link_target: self.store.readlink(path).ok(),
            rdev: attr.rdev,
            xattrs: Default::default(),
            tags: Default::default(),
            acl: None,
        };
        self.meta.put(&mut rec)?;
        Ok(rec)
    }

    // ------------------------------------------------------------------
    // cache plumbing

    /// Pulls the remote copy of `path` into the cache, clobbering whatever
    /// was there, and records which revision the cache now holds
    fn cache_file(&self, path: &Path) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let attr = match self.remote.lstat(path) {
            Ok(attr) => attr,
            Err(e) => {
                self.check_remote_err(&e);
                return Err(e);
            }
        };
        let rec = self.record_from_remote(path, &attr)?;

        match attr.file_type() {
            Some(FileType::Directory) => {
                return self.cache_dir(path);
            }
            Some(FileType::Symlink) => {
                let target = self.remote.readlink(path)?;
                self.store.symlink(&target, path)?;
            }
            Some(FileType::Regular) => {
                debug!(target: CACHE_TAG, "Caching file {} to disk", path.display());
                let mut dst = self.store.open_for_write(path, attr.mode | 0o600)?;
                match self.remote.copy_to(path, &mut dst) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
            }
            Some(FileType::Fifo)
            | Some(FileType::Socket)
            | Some(FileType::CharDevice)
            | Some(FileType::BlockDevice) => {
                // content lives nowhere; a placeholder marks it cached and
                // the record holds the real mode and device numbers
                self.store.create_file(path, 0o600)?;
            }
            None => {
                return Err(TetherError::Unsupported("unknown file type"));
            }
        }

        self.meta
            .put_cached_rev(rec.id, rec.remote_revision, attr.mtime)?;
        Ok(())
    }

    /// Caches a directory: makes the mirror dir and discovers remote-only
    /// children into the metadata store
    fn cache_dir(&self, path: &Path) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let attr = self.remote.lstat(path)?;
        let rec = self.record_from_remote(path, &attr)?;

        self.store.mkdir(path, attr.mode | 0o700)?;

        debug!(
            target: CACHE_TAG,
            "Discovering directory {} contents", path.display()
        );
        let known: Vec<String> = self
            .meta
            .list_prefix(path)?
            .iter()
            .filter_map(|r| r.path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();

        match self.remote.readdir(path) {
            Ok(entries) => {
                for entry in entries {
                    if known.contains(&entry.name) {
                        continue;
                    }
                    let child = path.join(&entry.name);
                    if self.log.is_unlinked(&child)? {
                        continue;
                    }
                    if let Ok(child_attr) = self.remote.lstat(&child) {
                        self.record_from_remote(&child, &child_attr)?;
                    }
                }
            }
            Err(e) => {
                debug!(
                    target: CACHE_TAG,
                    "Cannot list directory {} ({:?})",
                    path.display(),
                    e
                );
            }
        }

        self.meta
            .put_cached_rev(rec.id, rec.remote_revision, attr.mtime)?;
        Ok(())
    }

    /// Drops the cached copy.  With `removeperm` the file is gone for good:
    /// the record goes too, and only the sync-log entry remembers it.
    fn remove_cached_file_locked(&self, path: &Path, removeperm: bool) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let maybe_rec = self.meta.try_get(path)?;
        let is_dir = match &maybe_rec {
            Some(rec) => rec.is_dir(),
            None => self
                .store
                .lstat(path)
                .map(|attr| attr.is_dir())
                .unwrap_or(false),
        };

        if self.store.exists(path) {
            if is_dir {
                self.store.rmdir(path)?;
            } else {
                self.store.unlink(path)?;
            }
        }

        if let Some(rec) = &maybe_rec {
            self.meta.delete_cached_rev(rec.id)?;
        }
        if removeperm {
            self.meta.delete(path)?;
        }
        Ok(())
    }

    /// Public eviction, used by the sync worker after quarantine
    pub fn evict(&self, path: &Path) -> TetherResult<()> {
        self.remove_cached_file_locked(path, false)
    }

    /// A planner-detected conflict: hand the pending change over to
    /// quarantine and drop it from the log
    fn merge_conflict(&self, path: &Path) -> TetherResult<()> {
        if let Some((item, file_change)) = self.log.change_entry(path)? {
            self.conflicts
                .quarantine(&self.log, &item, file_change.as_ref())?;
            self.log.remove_entry(item.seq)?;
        }
        Ok(())
    }

    /// The quarantine handler, shared with the sync worker
    pub fn conflicts(&self) -> &ConflictHandler {
        &self.conflicts
    }

    // ------------------------------------------------------------------
    // operations

    /// Stat through the overlay.  The metadata store is the truth for
    /// attributes; a remote stat refreshes it on pass-through.
    pub fn stat(&self, path: &Path) -> TetherResult<FileAttr> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, true)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                let attr = match self.remote.lstat(path) {
                    Ok(attr) => attr,
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                };
                let rec = self.record_from_remote(path, &attr)?;
                Ok(rec.attr())
            }
            Some(_) => {
                let rec = self.record_or_synth(path)?;
                Ok(rec.attr())
            }
        }
    }

    /// POSIX discretionary access check against the overlay's metadata.
    /// Ancestors need execute, root passes everything.
    pub fn access(&self, ctx: &Request, path: &Path, mask: i32) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        if ctx.uid == 0 {
            trace!(target: CACHE_TAG, "Root -- access granted");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if path != Path::new("/") {
                self.access(ctx, parent, libc::X_OK)?;
            }
        }

        let attr = self.stat(path)?;

        // existence was the whole question
        if mask == libc::F_OK {
            return Ok(());
        }

        let mask = mask as mode_t;

        // owner bits first
        if ctx.uid == attr.uid {
            if ((attr.mode & libc::S_IRWXU) >> 6) & mask == mask {
                trace!(target: CACHE_TAG, "Allowing for user bits");
                return Ok(());
            }
        }

        // then group bits, honoring supplementary groups
        if crate::common::gids_for_uid(ctx.uid, ctx.gid).contains(&attr.gid) {
            if ((attr.mode & libc::S_IRWXG) >> 3) & mask == mask {
                trace!(target: CACHE_TAG, "Allowing for group bits");
                return Ok(());
            }
        }

        // finally other bits
        if (attr.mode & libc::S_IRWXO) & mask == mask {
            trace!(target: CACHE_TAG, "Allowing for other bits");
            return Ok(());
        }

        Err(TetherError::Permission(path.to_owned()))
    }

    /// Open with create semantics.  The overlay keeps no open-handle state;
    /// what matters is making the path exist (or fail) correctly.
    pub fn open(
        &self,
        ctx: &Request,
        path: &Path,
        flags: i32,
        mode: Option<mode_t>,
    ) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let mut plan = self.gen_plan(path, false)?;
        let creating = flags & libc::O_CREAT > 0;
        if creating {
            rewrite_for_create(&mut plan);
        }

        match self.validate_cache(path, &plan) {
            Ok(_) => {}
            Err(TetherError::NotFound(_)) if creating => {
                debug!(target: CACHE_TAG, "Skipping over ENOENT since we want O_CREAT");
            }
            Err(e) => return Err(e),
        }

        let exists = self.meta.try_get(path)?.is_some() || self.store.exists(path);

        if exists && creating && flags & libc::O_EXCL > 0 {
            return Err(TetherError::Exists(path.to_owned()));
        }

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => {
                return Err(TetherError::NotFound(path.to_owned()));
            }
            Some(Opcode::UseRemote) => {
                if !exists && creating {
                    let handle = match self.remote.open(path, flags) {
                        Ok(h) => h,
                        Err(e) => {
                            self.check_remote_err(&e);
                            return Err(e);
                        }
                    };
                    self.remote.close(handle)?;
                    let attr = self.remote.lstat(path)?;
                    self.record_from_remote(path, &attr)?;
                }
            }
            Some(_) => {
                if !exists && creating {
                    let conf = self.settings.get_config();
                    let requested =
                        mode.unwrap_or_else(|| conf.perms.default_cache_mode.mode());
                    let final_mode =
                        conf.perms.default_mode_mask.apply(requested & 0o7777);

                    debug!(
                        target: CACHE_TAG,
                        "Creating {} in cache with mode {:o}",
                        path.display(),
                        final_mode
                    );
                    self.store.create_file(path, final_mode)?;

                    let now = get_now_secs();
                    let mut rec = FileRecord {
                        id: 0,
                        path: path.to_owned(),
                        mode: libc::S_IFREG | final_mode,
                        uid: ctx.uid,
                        gid: ctx.gid,
                        size: 0,
                        atime: now,
                        mtime: now,
                        ctime: now,
                        remote_revision: 0,
                        link_target: None,
                        rdev: 0,
                        xattrs: Default::default(),
                        tags: Default::default(),
                        acl: None,
                    };
                    self.meta.put(&mut rec)?;
                    self.meta.put_cached_rev(rec.id, 0, now)?;

                    self.log.append_new(path, FileType::Regular, None)?;
                }
            }
        }

        if exists && flags & libc::O_TRUNC > 0 {
            self.truncate(ctx, path, 0)?;
        }

        Ok(())
    }

    pub fn read(&self, path: &Path, offset: u64, size: usize) -> TetherResult<Vec<u8>> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        debug!(
            target: CACHE_TAG,
            "Reading {} [ofs: {}, len: {}]",
            path.display(),
            offset,
            size
        );

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                match self.remote.read_region(path, offset, offset + size as u64) {
                    Ok(data) => Ok(data),
                    Err(e) => {
                        self.check_remote_err(&e);
                        Err(e)
                    }
                }
            }
            Some(_) => self.store.read(path, offset, size),
        }
    }

    /// Write through the overlay.  Cache-side writes always journal a region
    /// carrying exactly the written bytes; zero-byte writes journal nothing.
    pub fn write(&self, path: &Path, offset: i64, data: &[u8]) -> TetherResult<usize> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                let attr = self.remote.lstat(path)?;
                let off = if offset < 0 { attr.size } else { offset as u64 };
                match self.remote.write_region(path, off, data) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
                let attr = self.remote.lstat(path)?;
                self.record_from_remote(path, &attr)?;
                Ok(data.len())
            }
            Some(_) => {
                let mut rec = self.record_or_synth(path)?;
                let off = if offset < 0 {
                    self.store.size(path)?
                } else {
                    offset as u64
                };

                // snapshot the span before the write lands; the sync
                // worker's conflict probe compares the remote against
                // exactly these bytes.  past EOF the span reads as zeros,
                // same as it would on the remote
                let base = if data.is_empty() {
                    Vec::new()
                } else {
                    let mut base = self.store.read(path, off, data.len())?;
                    base.resize(data.len(), 0);
                    base
                };

                debug!(
                    target: CACHE_TAG,
                    "Writing {} bytes to {} at offset {}",
                    data.len(),
                    path.display(),
                    off
                );
                self.store.write(path, off, data)?;

                rec.size = rec.size.max(off + data.len() as u64);
                rec.mtime = get_now_secs();
                self.meta.put(&mut rec)?;

                if !data.is_empty() {
                    let incoming =
                        region::new_region(off, off + data.len() as u64, data.to_vec(), base)?;
                    self.log.append_change(path, incoming)?;
                }
                Ok(data.len())
            }
        }
    }

    /// Truncate, clipping any pending regions so nothing reaches past the
    /// new size.  Truncating to the current size is a complete no-op.
    pub fn truncate(&self, _ctx: &Request, path: &Path, size: u64) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                let attr = self.remote.lstat(path)?;
                if attr.size == size {
                    return Ok(());
                }
                match self.remote.truncate(path, size) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
                let attr = self.remote.lstat(path)?;
                self.record_from_remote(path, &attr)?;
                Ok(())
            }
            Some(_) => {
                let mut rec = self.record_or_synth(path)?;
                if rec.size == size && self.store.size(path)? == size {
                    debug!(target: CACHE_TAG, "Truncate to current size, nothing to do");
                    return Ok(());
                }

                debug!(
                    target: CACHE_TAG,
                    "Truncating {} to {} bytes",
                    path.display(),
                    size
                );
                self.store.truncate(path, size)?;
                self.log.truncate_changes(path, size)?;

                rec.size = size;
                rec.mtime = get_now_secs();
                self.meta.put(&mut rec)?;

                self.log.append_metadata_change(
                    path,
                    &MetaChanges {
                        times: true,
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Directory listing: the union of what the overlay knows and what the
    /// remote shows.  Disconnected, entries that only ever lived remotely are
    /// hidden, since opening them could go nowhere.
    pub fn readdir(&self, path: &Path) -> TetherResult<Vec<DirEntry>> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;
        if serve_side(&plan) == Some(Opcode::Enoent) {
            return Err(TetherError::NotFound(path.to_owned()));
        }

        let remote_up = self.state.is_available();
        let mut merged: BTreeMap<String, mode_t> = BTreeMap::new();

        for rec in self.meta.list_prefix(path)? {
            let name = match rec.path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            // remote-only knowledge is useless while the remote is gone
            if !remote_up && !self.store.exists(&rec.path) {
                trace!(
                    target: CACHE_TAG,
                    "Hiding uncached {} while disconnected",
                    rec.path.display()
                );
                continue;
            }
            merged.insert(name, rec.mode);
        }

        if remote_up {
            match self.remote.readdir(path) {
                Ok(entries) => {
                    for entry in entries {
                        if merged.contains_key(&entry.name) {
                            continue;
                        }
                        let child = path.join(&entry.name);
                        if self.log.is_unlinked(&child)? {
                            continue;
                        }
                        // discovery: remember remote-only children
                        if let Ok(attr) = self.remote.lstat(&child) {
                            self.record_from_remote(&child, &attr)?;
                        }
                        merged.insert(entry.name, entry.mode);
                    }
                }
                Err(e) => {
                    self.check_remote_err(&e);
                    return Err(e);
                }
            }
        }

        Ok(merged
            .into_iter()
            .map(|(name, mode)| DirEntry { name, mode })
            .collect())
    }

    pub fn readlink(&self, path: &Path) -> TetherResult<PathBuf> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => self.remote.readlink(path),
            Some(_) => match self.store.readlink(path) {
                Ok(target) => Ok(target),
                Err(_) => {
                    let rec = self.meta.get(path)?;
                    rec.link_target
                        .ok_or_else(|| TetherError::InvalidPath(path.to_owned()))
                }
            },
        }
    }

    pub fn symlink(&self, ctx: &Request, target: &Path, link: &Path) -> TetherResult<()> {
        let _guard = self.locks.lock(link);

        if self.meta.try_get(link)?.is_some() {
            return Err(TetherError::Exists(link.to_owned()));
        }

        let mut plan = self.gen_plan(link, false)?;
        rewrite_for_create(&mut plan);

        match serve_side(&plan) {
            Some(Opcode::UseRemote) => {
                match self.remote.symlink(target, link) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
                let attr = self.remote.lstat(link)?;
                self.record_from_remote(link, &attr)?;
                Ok(())
            }
            _ => {
                self.store.symlink(target, link)?;

                let now = get_now_secs();
                let mut rec = FileRecord {
                    id: 0,
                    path: link.to_owned(),
                    mode: libc::S_IFLNK | 0o777,
                    uid: ctx.uid,
                    gid: ctx.gid,
                    size: target.as_os_str().len() as u64,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    remote_revision: 0,
                    link_target: Some(target.to_owned()),
                    rdev: 0,
                    xattrs: Default::default(),
                    tags: Default::default(),
                    acl: None,
                };
                self.meta.put(&mut rec)?;
                self.meta.put_cached_rev(rec.id, 0, now)?;

                self.log.append_new(link, FileType::Symlink, None)?;
                Ok(())
            }
        }
    }

    pub fn mkdir(&self, ctx: &Request, path: &Path, mode: mode_t) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        if self.meta.try_get(path)?.is_some() || self.store.exists(path) {
            return Err(TetherError::Exists(path.to_owned()));
        }

        let mut plan = self.gen_plan(path, false)?;
        rewrite_for_create(&mut plan);

        debug!(target: CACHE_TAG, "Making directory {}", path.display());

        match serve_side(&plan) {
            Some(Opcode::UseRemote) => {
                match self.remote.mkdir(path, mode) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
                let attr = self.remote.lstat(path)?;
                self.record_from_remote(path, &attr)?;
                Ok(())
            }
            _ => {
                let conf = self.settings.get_config();
                let final_mode = conf.perms.default_mode_mask.apply(mode & 0o7777);

                self.store.mkdir(path, final_mode)?;

                let now = get_now_secs();
                let mut rec = FileRecord {
                    id: 0,
                    path: path.to_owned(),
                    mode: libc::S_IFDIR | final_mode,
                    uid: ctx.uid,
                    gid: ctx.gid,
                    size: 0,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    remote_revision: 0,
                    link_target: None,
                    rdev: 0,
                    xattrs: Default::default(),
                    tags: Default::default(),
                    acl: None,
                };
                self.meta.put(&mut rec)?;
                self.meta.put_cached_rev(rec.id, 0, now)?;

                self.log.append_new(path, FileType::Directory, None)?;
                Ok(())
            }
        }
    }

    /// mknod: fifos and sockets for anyone, device nodes only for root, and
    /// regular files fall back to create
    pub fn mknod(
        &self,
        ctx: &Request,
        path: &Path,
        mode: mode_t,
        rdev: u64,
    ) -> TetherResult<()> {
        let file_type = FileType::from_mode(mode)
            .ok_or(TetherError::Unsupported("mknod of unknown type"))?;

        match file_type {
            FileType::Regular => {
                return self.open(ctx, path, libc::O_CREAT | libc::O_WRONLY, Some(mode));
            }
            FileType::CharDevice | FileType::BlockDevice => {
                if ctx.uid != 0 {
                    return Err(TetherError::Permission(path.to_owned()));
                }
            }
            FileType::Fifo | FileType::Socket => {}
            _ => return Err(TetherError::Unsupported("mknod of this type")),
        }

        let _guard = self.locks.lock(path);

        if self.meta.try_get(path)?.is_some() {
            return Err(TetherError::Exists(path.to_owned()));
        }

        let mut plan = self.gen_plan(path, false)?;
        rewrite_for_create(&mut plan);

        if serve_side(&plan) == Some(Opcode::UseRemote) {
            // the remote capability set has no mknod
            return Err(TetherError::Unsupported("mknod on a never-cache path"));
        }

        let conf = self.settings.get_config();
        let final_mode = conf.perms.default_mode_mask.apply(mode & 0o7777);

        // a placeholder in the cache tree, the record carries the real type
        self.store.create_file(path, 0o600)?;

        let now = get_now_secs();
        let mut rec = FileRecord {
            id: 0,
            path: path.to_owned(),
            mode: file_type.mode_bits() | final_mode,
            uid: ctx.uid,
            gid: ctx.gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            remote_revision: 0,
            link_target: None,
            rdev,
            xattrs: Default::default(),
            tags: Default::default(),
            acl: None,
        };
        self.meta.put(&mut rec)?;
        self.meta.put_cached_rev(rec.id, 0, now)?;

        let dev = if file_type.is_device() {
            let major = (rdev >> 8) as u32;
            let minor = (rdev & 0xff) as u32;
            Some((major, minor))
        } else {
            None
        };
        self.log.append_new(path, file_type, dev)?;
        Ok(())
    }

    pub fn unlink(&self, _ctx: &Request, path: &Path) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        if serve_side(&plan) == Some(Opcode::Enoent) {
            return Err(TetherError::NotFound(path.to_owned()));
        }

        let rec = self.record_or_synth(path)?;
        if rec.is_dir() {
            // unlinking directories is rmdir's job
            return Err(TetherError::Permission(path.to_owned()));
        }
        let file_type = rec.file_type().unwrap_or(FileType::Regular);

        if serve_side(&plan) == Some(Opcode::UseRemote) {
            match self.remote.unlink(path) {
                Ok(_) => {}
                Err(e) => {
                    self.check_remote_err(&e);
                    return Err(e);
                }
            }
            self.meta.delete_cached_rev(rec.id)?;
            self.meta.delete(path)?;
            Ok(())
        } else {
            self.remove_cached_file_locked(path, true)?;
            self.log.append_unlink(path, file_type)?;
            Ok(())
        }
    }

    pub fn rmdir(&self, _ctx: &Request, path: &Path) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        if serve_side(&plan) == Some(Opcode::Enoent) {
            return Err(TetherError::NotFound(path.to_owned()));
        }

        let rec = self.record_or_synth(path)?;
        if !rec.is_dir() {
            return Err(TetherError::InvalidPath(path.to_owned()));
        }

        // the merged view decides emptiness, same as readdir shows it.  some
        // children may exist only remotely, and removing the cache dir while
        // the remote rmdir would fail later is the bug this check prevents
        if !self.meta.list_prefix(path)?.is_empty() {
            return Err(TetherError::NotEmpty(path.to_owned()));
        }
        if self.state.is_available() {
            if let Ok(entries) = self.remote.readdir(path) {
                for entry in entries {
                    if !self.log.is_unlinked(&path.join(&entry.name))? {
                        return Err(TetherError::NotEmpty(path.to_owned()));
                    }
                }
            }
        }

        if serve_side(&plan) == Some(Opcode::UseRemote) {
            match self.remote.rmdir(path) {
                Ok(_) => {}
                Err(e) => {
                    self.check_remote_err(&e);
                    return Err(e);
                }
            }
            self.meta.delete_cached_rev(rec.id)?;
            self.meta.delete(path)?;
            Ok(())
        } else {
            self.remove_cached_file_locked(path, true)?;
            self.log.append_unlink(path, FileType::Directory)?;
            Ok(())
        }
    }

    /// Rename, with both locks taken in canonical order.  Descendants of a
    /// renamed directory move in the metadata transactionally and in the log
    /// by rewriting; their cache copies move with the directory itself.
    pub fn rename(&self, _ctx: &Request, old: &Path, new: &Path) -> TetherResult<()> {
        let (_g1, _g2) = self.locks.lock_pair(old, new);

        let old_plan = self.gen_plan(old, false)?;
        self.validate_cache(old, &old_plan)?;
        if serve_side(&old_plan) == Some(Opcode::Enoent) {
            return Err(TetherError::NotFound(old.to_owned()));
        }

        let new_plan = self.gen_plan(new, false)?;
        match self.validate_cache(new, &new_plan) {
            Ok(_) => {}
            // destination not existing yet is the normal case
            Err(TetherError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        debug!(
            target: CACHE_TAG,
            "Renaming {} -> {}",
            old.display(),
            new.display()
        );

        let rec = self.record_or_synth(old)?;
        let is_dir = rec.is_dir();

        let usefs = serve_side(&old_plan) == Some(Opcode::UseRemote)
            || serve_side(&new_plan) == Some(Opcode::UseRemote);

        if usefs {
            match self.remote.rename(old, new) {
                Ok(_) => {}
                Err(e) => {
                    self.check_remote_err(&e);
                    return Err(e);
                }
            }
            self.meta.rename_subtree(old, new, is_dir)?;
            Ok(())
        } else {
            if self.store.exists(old) {
                self.store.rename(old, new)?;
            }
            self.meta.rename_subtree(old, new, is_dir)?;
            self.log.append_rename(old, new, is_dir)?;
            Ok(())
        }
    }

    pub fn chmod(&self, _ctx: &Request, path: &Path, mode: mode_t) -> TetherResult<()> {
        let _guard = self.locks.lock(path);
        debug!(target: CACHE_TAG, "chmod {} {:o}", path.display(), mode);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                match self.remote.chmod(path, mode) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
                let attr = self.remote.lstat(path)?;
                self.record_from_remote(path, &attr)?;
                Ok(())
            }
            Some(_) => {
                let mut rec = self.record_or_synth(path)?;
                rec.mode = (rec.mode & libc::S_IFMT) | (mode & 0o7777);
                rec.ctime = get_now_secs();
                self.meta.put(&mut rec)?;

                if self.store.exists(path) && !rec.is_dir() {
                    self.store.chmod(path, mode)?;
                }

                self.log.append_metadata_change(
                    path,
                    &MetaChanges {
                        mode: true,
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
        }
    }

    pub fn chown(&self, _ctx: &Request, path: &Path, uid: uid_t, gid: gid_t) -> TetherResult<()> {
        let _guard = self.locks.lock(path);
        debug!(target: CACHE_TAG, "chown {} {}:{}", path.display(), uid, gid);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                match self.remote.chown(path, uid, gid) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
                let attr = self.remote.lstat(path)?;
                self.record_from_remote(path, &attr)?;
                Ok(())
            }
            Some(_) => {
                let mut rec = self.record_or_synth(path)?;
                rec.uid = uid;
                rec.gid = gid;
                rec.ctime = get_now_secs();
                self.meta.put(&mut rec)?;

                if self.store.exists(path) {
                    self.store.chown(path, uid, gid)?;
                }

                self.log.append_metadata_change(
                    path,
                    &MetaChanges {
                        uid: true,
                        gid: true,
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
        }
    }

    pub fn utime(&self, _ctx: &Request, path: &Path, atime: f64, mtime: f64) -> TetherResult<()> {
        let _guard = self.locks.lock(path);
        debug!(target: CACHE_TAG, "utime {}", path.display());

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                match self.remote.utime(path, atime, mtime) {
                    Ok(_) => {}
                    Err(e) => {
                        self.check_remote_err(&e);
                        return Err(e);
                    }
                }
                let attr = self.remote.lstat(path)?;
                self.record_from_remote(path, &attr)?;
                Ok(())
            }
            Some(_) => {
                let mut rec = self.record_or_synth(path)?;
                rec.atime = atime;
                rec.mtime = mtime;
                self.meta.put(&mut rec)?;

                if self.store.exists(path) {
                    self.store.utime(path, atime, mtime)?;
                }

                self.log.append_metadata_change(
                    path,
                    &MetaChanges {
                        times: true,
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
        }
    }

    pub fn getxattr(&self, path: &Path, name: &str) -> TetherResult<Vec<u8>> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, true)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => self.remote.getxattr(path, name),
            Some(_) => {
                let rec = self.record_or_synth(path)?;
                rec.xattrs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TetherError::NotFound(path.to_owned()))
            }
        }
    }

    pub fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => {
                match self.remote.setxattr(path, name, value) {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        self.check_remote_err(&e);
                        Err(e)
                    }
                }
            }
            Some(_) => {
                let mut rec = self.record_or_synth(path)?;
                rec.xattrs.insert(name.to_string(), value.to_vec());
                self.meta.put(&mut rec)?;

                self.log.append_metadata_change(
                    path,
                    &MetaChanges {
                        xattrs: vec![name.to_string()],
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
        }
    }

    pub fn listxattr(&self, path: &Path) -> TetherResult<Vec<String>> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, true)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => self.remote.listxattr(path),
            Some(_) => {
                let rec = self.record_or_synth(path)?;
                Ok(rec.xattrs.keys().cloned().collect())
            }
        }
    }

    pub fn removexattr(&self, path: &Path, name: &str) -> TetherResult<()> {
        let _guard = self.locks.lock(path);

        let plan = self.gen_plan(path, false)?;
        self.validate_cache(path, &plan)?;

        match serve_side(&plan) {
            Some(Opcode::Enoent) | None => Err(TetherError::NotFound(path.to_owned())),
            Some(Opcode::UseRemote) => self.remote.removexattr(path, name),
            Some(_) => {
                let mut rec = self.record_or_synth(path)?;
                if rec.xattrs.remove(name).is_none() {
                    return Err(TetherError::NotFound(path.to_owned()));
                }
                self.meta.put(&mut rec)?;

                self.log.append_metadata_change(
                    path,
                    &MetaChanges {
                        xattrs: vec![name.to_string()],
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // helpers for the sync worker

    /// Reads the cached copy under the path lock, padding a short read with
    /// zeros to the requested span
    pub fn read_cached_region(&self, path: &Path, start: u64, end: u64) -> TetherResult<Vec<u8>> {
        let _guard = self.locks.lock(path);
        let mut data = self.store.read(path, start, (end - start) as usize)?;
        data.resize((end - start) as usize, 0);
        Ok(data)
    }

    pub fn cached_size(&self, path: &Path) -> TetherResult<u64> {
        let _guard = self.locks.lock(path);
        self.store.size(path)
    }

    pub fn record(&self, path: &Path) -> TetherResult<FileRecord> {
        self.meta.get(path)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn log(&self) -> &Arc<SyncLog> {
        &self.log
    }

    /// Marks the cache copy of `path` as holding the given remote revision
    pub fn mark_cached_revision(&self, item: &SyncChange) -> TetherResult<()> {
        let path = item.new_path.as_deref().unwrap_or(&item.path);
        if let Some(rec) = self.meta.try_get(path)? {
            if let Ok(attr) = self.remote.lstat(path) {
                let revision = synthesize_revision(attr.size, attr.mtime);
                self.meta.put_cached_rev(rec.id, revision, attr.mtime)?;

                let mut rec = rec;
                rec.remote_revision = revision;
                self.meta.put(&mut rec)?;
            }
        }
        Ok(())
    }
}
