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

//! The sync worker: a single long-running reconciler that drains the sync
//! log against the remote.  Entries are consumed strictly in order; a
//! conflicted entry is quarantined, a transient remote failure puts the
//! worker back into its disconnected state with the entry intact, and a
//! shutdown lets the current entry finish before the thread exits.

use crate::cache::CacheManager;
use crate::common::err::{TetherError, TetherResult};
use crate::common::notify::Notifier;
use crate::common::types::FileType;
use crate::meta::types::{ChangeKind, FileChange, SyncChange};
use crate::meta::MetaStore;
use crate::remote::Remote;
use crate::synclog::SyncLog;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub mod availability;
pub mod state;

use state::OverlayState;

pub const SYNC_TAG: &str = "sync";

/// The metadata flush timer: forces the store and the log durable every
/// `interval_s` seconds until shutdown
pub fn spawn_checkpoint_timer(
    meta: Arc<MetaStore>,
    log: Arc<SyncLog>,
    state: Arc<OverlayState>,
    interval_s: u64,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("checkpoint-timer".to_string())
        .spawn(move || {
            let mut last = std::time::Instant::now();
            while !state.is_unmounted() {
                state.wait_for_change(Duration::from_secs(
                    crate::common::constants::MAX_FLAG_WAIT_SECS,
                ));
                if last.elapsed() < Duration::from_secs(interval_s) {
                    continue;
                }
                last = std::time::Instant::now();

                debug!(target: SYNC_TAG, "Periodic checkpoint");
                if let Err(e) = meta.checkpoint() {
                    warn!(target: SYNC_TAG, "Metadata checkpoint failed: {:?}", e);
                }
                if let Err(e) = log.checkpoint() {
                    warn!(target: SYNC_TAG, "Log checkpoint failed: {:?}", e);
                }
            }
        })
        .expect("Couldn't spawn checkpoint timer")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Mounting,
    IdleConnected,
    Draining,
    Paused,
    Stopping,
}

pub struct SyncWorker<N>
where
    N: Notifier + 'static,
{
    cache: Arc<CacheManager>,
    log: Arc<SyncLog>,
    meta: Arc<MetaStore>,
    remote: Arc<dyn Remote>,
    state: Arc<OverlayState>,
    notifier: Arc<Mutex<N>>,
}

impl<N> SyncWorker<N>
where
    N: Notifier,
{
    pub fn new(
        cache: Arc<CacheManager>,
        log: Arc<SyncLog>,
        meta: Arc<MetaStore>,
        remote: Arc<dyn Remote>,
        state: Arc<OverlayState>,
        notifier: Arc<Mutex<N>>,
    ) -> Self {
        Self {
            cache,
            log,
            meta,
            remote,
            state,
            notifier,
        }
    }

    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("sync-worker".to_string())
            .spawn(move || self.run())
            .expect("Couldn't spawn sync worker")
    }

    /// Pings the server and mounts the backend, flipping the availability
    /// flag to match the outcome
    fn attempt_mount(&self) -> bool {
        debug!(target: SYNC_TAG, "Checking for remote server availability");
        if !self.remote.ping() {
            debug!(target: SYNC_TAG, "Remote ping failed");
            self.state.set_available(false);
            return false;
        }

        if self.remote.is_mounted() {
            debug!(target: SYNC_TAG, "Remote is already mounted");
            self.state.set_available(true);
            return true;
        }

        debug!(target: SYNC_TAG, "Attempting mount");
        match self.remote.mount() {
            Ok(_) => {
                info!(target: SYNC_TAG, "Remote mount complete");
                self.state.set_available(true);
                true
            }
            Err(e) => {
                warn!(target: SYNC_TAG, "Remote mount failed: {:?}", e);
                self.state.set_available(false);
                false
            }
        }
    }

    pub fn run(&self) {
        let mut wstate = WorkerState::Disconnected;
        // where to go back to when a pause lifts
        let mut resume_state = WorkerState::Disconnected;

        loop {
            if self.state.is_unmounted() && wstate != WorkerState::Stopping {
                wstate = WorkerState::Stopping;
            }

            match wstate {
                WorkerState::Disconnected => {
                    if self.state.is_sync_paused() {
                        resume_state = wstate;
                        wstate = WorkerState::Paused;
                        continue;
                    }
                    if self.state.is_force_disconnected() {
                        debug!(
                            target: SYNC_TAG,
                            "User forced disconnect, not attempting mount"
                        );
                        self.state.wait_for_change(Duration::from_secs(
                            crate::common::constants::HEARTBEAT_SECS,
                        ));
                        continue;
                    }

                    wstate = WorkerState::Mounting;
                }
                WorkerState::Mounting => {
                    if self.attempt_mount() {
                        wstate = WorkerState::IdleConnected;
                    } else {
                        wstate = WorkerState::Disconnected;
                        self.state.wait_for_change(Duration::from_secs(
                            crate::common::constants::HEARTBEAT_SECS,
                        ));
                    }
                }
                WorkerState::IdleConnected => {
                    if self.state.is_sync_paused() {
                        resume_state = wstate;
                        wstate = WorkerState::Paused;
                        continue;
                    }
                    if !self.state.is_available() {
                        wstate = WorkerState::Disconnected;
                        continue;
                    }

                    match self.log.is_empty() {
                        Ok(false) => {
                            wstate = WorkerState::Draining;
                        }
                        _ => {
                            self.state.wait_for_change(Duration::from_secs(
                                crate::common::constants::MAX_FLAG_WAIT_SECS,
                            ));
                        }
                    }
                }
                WorkerState::Draining => {
                    debug!(target: SYNC_TAG, "Checking for items to sync");
                    self.drain();
                    wstate = if self.state.is_available() {
                        WorkerState::IdleConnected
                    } else {
                        WorkerState::Disconnected
                    };
                }
                WorkerState::Paused => {
                    if !self.state.is_sync_paused() {
                        info!(target: SYNC_TAG, "Sync resumed");
                        wstate = resume_state;
                        continue;
                    }
                    debug!(target: SYNC_TAG, "User requested sync pause, sleeping");
                    self.state.wait_for_change(Duration::from_secs(
                        crate::common::constants::MAX_FLAG_WAIT_SECS,
                    ));
                }
                WorkerState::Stopping => {
                    info!(target: SYNC_TAG, "Shutdown requested");

                    if let Err(e) = self.remote.unmount() {
                        warn!(target: SYNC_TAG, "Unable to unmount remote: {:?}", e);
                    }

                    debug!(target: SYNC_TAG, "Syncing changes to disk");
                    if let Err(e) = self.log.checkpoint() {
                        warn!(target: SYNC_TAG, "Unable to checkpoint the log: {:?}", e);
                    }
                    if let Err(e) = self.meta.checkpoint() {
                        warn!(
                            target: SYNC_TAG,
                            "Unable to checkpoint the metadata store: {:?}", e
                        );
                    }

                    info!(target: SYNC_TAG, "Sync worker shutdown complete");
                    return;
                }
            }
        }
    }

    /// One pass over the log.  Returns when the log runs dry, the user
    /// pauses, the remote drops, or shutdown begins.
    pub fn drain(&self) {
        let iter = match self.log.pop_changes() {
            Ok(iter) => iter,
            Err(e) => {
                error!(target: SYNC_TAG, "Couldn't open the log: {:?}", e);
                return;
            }
        };

        for (item, file_change) in iter {
            debug!(target: SYNC_TAG, "Got one: {} {}", item.kind, item.path.display());

            if self.state.is_sync_paused() {
                debug!(target: SYNC_TAG, "... but user requested sync pause");
                let _ = self.log.finish(&item, false);
                break;
            }
            if self.state.is_unmounted() || !self.state.is_available() {
                let _ = self.log.finish(&item, false);
                break;
            }

            match self.handle_change(&item, file_change.as_ref()) {
                Ok(_) => {
                    debug!(
                        target: SYNC_TAG,
                        "Marking change seq {} as complete", item.seq
                    );
                    if let Err(e) = self.log.finish(&item, true) {
                        error!(target: SYNC_TAG, "Couldn't finish change: {:?}", e);
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        target: SYNC_TAG,
                        "Caught an error in the middle of handling a change: {:?}", e
                    );

                    if e.is_disconnect() {
                        info!(target: SYNC_TAG, "Disconnecting from remote");
                        self.state.set_available(false);
                        let _ = self.remote.unmount();
                    }

                    debug!(
                        target: SYNC_TAG,
                        "Not removing change from the synclog, but finishing"
                    );
                    let _ = self.log.finish(&item, false);
                    break;
                }
            }
        }
    }

    fn handle_change(&self, item: &SyncChange, change: Option<&FileChange>) -> TetherResult<()> {
        let found_conflicts = match item.kind {
            ChangeKind::New => self.propagate_new(item)?,
            ChangeKind::Link => self.propagate_link(item)?,
            ChangeKind::Unlink => self.propagate_unlink(item)?,
            ChangeKind::Change => self.propagate_change(item, change)?,
            ChangeKind::Rename => self.propagate_rename(item)?,
        };

        if found_conflicts {
            info!(target: SYNC_TAG, "Found conflicts, running handler");
            let conflict_path = self
                .cache
                .conflicts()
                .quarantine(&self.log, item, change)?;
            debug!(
                target: SYNC_TAG,
                "Loser's changes quarantined into {}",
                conflict_path.display()
            );
            let _ = self.notifier.lock().conflict(&item.path);
        } else {
            // the cache copy now corresponds to what the remote holds
            match item.kind {
                ChangeKind::New | ChangeKind::Change | ChangeKind::Rename => {
                    self.cache.mark_cached_revision(item)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn propagate_new(&self, item: &SyncChange) -> TetherResult<bool> {
        let path = &item.path;

        let rec = match self.meta.try_get(path)? {
            Some(rec) => rec,
            None => {
                // deleted while we were waiting for the lock
                debug!(
                    target: SYNC_TAG,
                    "{} vanished before propagation, skipping",
                    path.display()
                );
                return Ok(false);
            }
        };

        match item.file_type.unwrap_or(FileType::Regular) {
            FileType::Symlink => {
                let target = match self.cache.store().readlink(path) {
                    Ok(target) => target,
                    Err(_) => rec
                        .link_target
                        .clone()
                        .ok_or_else(|| TetherError::InvalidPath(path.clone()))?,
                };
                self.remote.symlink(&target, path)?;
            }
            FileType::Directory => {
                self.remote.mkdir(path, rec.mode)?;
            }
            _ => {
                let mut src = self.cache.store().open_for_read(path)?;
                self.remote.copy_from(path, &mut src, rec.mode)?;
                self.remote.chmod(path, rec.mode)?;
            }
        }

        // ownership is best effort, the daemon usually can't chown on the
        // remote either
        if let Err(e) = self.remote.chown(path, rec.uid, rec.gid) {
            debug!(
                target: SYNC_TAG,
                "Tolerating failed chown on {}: {:?}",
                path.display(),
                e
            );
        }

        Ok(false)
    }

    fn propagate_link(&self, item: &SyncChange) -> TetherResult<bool> {
        // hardlinks never get journaled; a stray entry is dropped loudly
        warn!(
            target: SYNC_TAG,
            "Dropping unsupported link entry for {}",
            item.path.display()
        );
        Ok(false)
    }

    fn propagate_unlink(&self, item: &SyncChange) -> TetherResult<bool> {
        let path = &item.path;
        let result = match item.file_type {
            Some(FileType::Directory) => self.remote.rmdir(path),
            _ => self.remote.unlink(path),
        };

        match result {
            Ok(_) => Ok(false),
            // the remote is authoritative; if it's already gone, mission
            // accomplished
            Err(TetherError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn propagate_change(
        &self,
        item: &SyncChange,
        change: Option<&FileChange>,
    ) -> TetherResult<bool> {
        let path = &item.path;
        let change = match change {
            Some(change) => change,
            None => {
                debug!(
                    target: SYNC_TAG,
                    "Change entry for {} has no file change, nothing to do",
                    path.display()
                );
                return Ok(false);
            }
        };
        if change.is_empty() {
            debug!(
                target: SYNC_TAG,
                "Change entry for {} is empty, nothing to do",
                path.display()
            );
            return Ok(false);
        }

        let rec = self.cache.record(path)?;

        let remote_attr = match self.remote.lstat(path) {
            Ok(attr) => attr,
            // we have local changes to a file the remote no longer has;
            // the remote wins, the changes get quarantined
            Err(TetherError::NotFound(_)) => {
                info!(
                    target: SYNC_TAG,
                    "{} is gone on the remote -- conflicted",
                    path.display()
                );
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        debug!(
            target: SYNC_TAG,
            "Validating data hasn't changed on the remote for {}",
            path.display()
        );

        if remote_attr.type_bits() != rec.mode & libc::S_IFMT {
            info!(
                target: SYNC_TAG,
                "File type has completely changed -- conflicted"
            );
            return Ok(true);
        }

        // the conflict probe, run for every region on every drain.  the
        // remote's current bytes decide everything: equal to the region's
        // snapshot means the span is untouched, equal to the new bytes means
        // an earlier, interrupted replay of ours already landed, anything
        // else means the remote moved and the entire entry is conflicted
        for region in &change.regions {
            debug!(
                target: SYNC_TAG,
                "Probing region {} of {}",
                region,
                path.display()
            );
            let mut data = self.remote.read_region(path, region.start, region.end)?;
            // a short read means the remote file ends inside the region
            data.resize(region.len() as usize, 0);

            if data != region.base && data != region.bytes {
                info!(
                    target: SYNC_TAG,
                    "Region has changed -- entire changeset conflicted"
                );
                debug!(target: SYNC_TAG, "Data read was {:?}", data);
                debug!(
                    target: SYNC_TAG,
                    "Wanted the snapshot {:?} or our own {:?}", region.base, region.bytes
                );
                return Ok(true);
            }
        }

        // no conflicts; apply the regions in start-offset order
        for region in &change.regions {
            let data = self
                .cache
                .read_cached_region(path, region.start, region.end)?;
            debug!(
                target: SYNC_TAG,
                "Writing {} to {} at [{}-{}]",
                data.len(),
                path.display(),
                region.start,
                region.end
            );
            self.remote.write_region(path, region.start, &data)?;
        }

        // propagate truncations
        let cached_size = self.cache.cached_size(path)?;
        if cached_size < remote_attr.size {
            debug!(
                target: SYNC_TAG,
                "Truncating remote {} to {}",
                path.display(),
                cached_size
            );
            self.remote.truncate(path, cached_size)?;
        }

        // propagate metadata
        if change.mode_changed {
            self.remote.chmod(path, rec.mode)?;
        }
        if change.times_changed {
            self.remote.utime(path, rec.atime, rec.mtime)?;
        }
        if change.uid_changed && change.gid_changed {
            if let Err(e) = self.remote.chown(path, rec.uid, rec.gid) {
                debug!(
                    target: SYNC_TAG,
                    "Tolerating failed chown on {}: {:?}",
                    path.display(),
                    e
                );
            }
        }
        if change.acl_changed {
            if let Some(acl) = &rec.acl {
                if let Err(e) =
                    self.remote
                        .setxattr(path, "system.posix_acl_access", acl.as_bytes())
                {
                    debug!(
                        target: SYNC_TAG,
                        "Failed to propagate acl on {}: {:?}",
                        path.display(),
                        e
                    );
                }
            }
        }
        for name in &change.xattrs_changed {
            // the acl rides its own flag, don't set it twice
            if name == "system.posix_acl_access" && change.acl_changed {
                continue;
            }
            let result = match rec.xattrs.get(name) {
                Some(value) => self.remote.setxattr(path, name, value),
                None => self.remote.removexattr(path, name),
            };
            if let Err(e) = result {
                debug!(
                    target: SYNC_TAG,
                    "Failed to propagate extended attribute {} on {}: {:?}",
                    name,
                    path.display(),
                    e
                );
            }
        }

        Ok(false)
    }

    fn propagate_rename(&self, item: &SyncChange) -> TetherResult<bool> {
        let old = item.old_path.as_deref().unwrap_or(&item.path);
        let new = item.new_path.as_deref().unwrap_or(&item.path);

        match self.remote.rename(old, new) {
            Ok(_) => Ok(false),
            // the remote never had the source; nothing left to move
            Err(TetherError::NotFound(_)) => {
                warn!(
                    target: SYNC_TAG,
                    "Remote has no {}, skipping rename",
                    old.display()
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
