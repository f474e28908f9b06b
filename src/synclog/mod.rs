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

//! The sync log: a durable, totally ordered journal of every mutation made
//! while the remote couldn't see it.  Appends fold into existing entries
//! wherever possible (region fusion, rename rewriting, unlink compaction), so
//! what the worker eventually drains is the minimal set of operations whose
//! replay reproduces the cache's state.

use crate::cache::lockpool::PathLocks;
use crate::common::err::{TetherError, TetherResult};
use crate::common::types::FileType;
use crate::meta::tpool::ThreadConnPool;
use crate::meta::types::{ChangeKind, DataRegion, FileChange, SyncChange};
use crate::meta::get_now_secs;
use crate::sync::state::OverlayState;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite::Result as SqliteResult;
use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod conflict;
pub mod region;

pub const SYNCLOG_TAG: &str = "synclog";

/// The one consumer the log currently has
pub const CONSUMER: &str = "tetherfs-sync-worker";

/// Which metadata moved in a `change` entry
#[derive(Debug, Clone, Default)]
pub struct MetaChanges {
    pub mode: bool,
    pub uid: bool,
    pub gid: bool,
    pub times: bool,
    pub acl: bool,
    pub xattrs: Vec<String>,
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn to_sync_change(row: &Row) -> SqliteResult<SyncChange> {
    let kind_str: String = row.get(2)?;
    let kind = ChangeKind::from_str(&kind_str).unwrap_or(ChangeKind::Change);
    Ok(SyncChange {
        seq: row.get(0)?,
        timestamp: row.get(1)?,
        kind,
        path: PathBuf::from(row.get::<usize, String>(3)?),
        old_path: row.get::<usize, Option<String>>(4)?.map(PathBuf::from),
        new_path: row.get::<usize, Option<String>>(5)?.map(PathBuf::from),
        file_type: row
            .get::<usize, Option<String>>(6)?
            .and_then(|t| FileType::from_str(&t)),
        dev_major: row.get::<usize, Option<i64>>(7)?.map(|v| v as u32),
        dev_minor: row.get::<usize, Option<i64>>(8)?.map(|v| v as u32),
    })
}

const CHANGE_COLS: &str = "seq, ts, kind, path, old_path, new_path, file_type, dev_major, dev_minor";

pub struct SyncLog {
    pool: Arc<ThreadConnPool>,
    state: Arc<OverlayState>,
    locks: Arc<PathLocks>,
    // serializes compound log surgery (compaction, rename rewriting) across
    // threads.  per-path locks aren't enough because those walks cross paths
    surgery: Mutex<()>,
}

impl SyncLog {
    pub fn new(
        pool: Arc<ThreadConnPool>,
        state: Arc<OverlayState>,
        locks: Arc<PathLocks>,
    ) -> Self {
        Self {
            pool,
            state,
            locks,
            surgery: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // predicates

    /// A `new` entry for `path` is live in the log.  Compaction removes the
    /// `new` when the path is unlinked, so presence is sufficient.
    pub fn is_new(&self, path: &Path) -> TetherResult<bool> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();
        Self::is_new_conn(&real_conn, path)
    }

    fn is_new_conn(conn: &Connection, path: &Path) -> TetherResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sync_changes WHERE path=?1 AND kind='new'",
                params![path_str(path)],
                |row| Ok(row.get(0)?),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Any entry names `path`
    pub fn is_dirty(&self, path: &Path) -> TetherResult<bool> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();
        Self::is_dirty_conn(&real_conn, path)
    }

    fn is_dirty_conn(conn: &Connection, path: &Path) -> TetherResult<bool> {
        let p = path_str(path);
        let found: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sync_changes WHERE path=?1 OR old_path=?1 OR new_path=?1 LIMIT 1",
                params![p],
                |row| Ok(row.get(0)?),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Dirty check that also looks below `path`, for reporting on directories
    pub fn is_dirty_recursive(&self, path: &Path) -> TetherResult<bool> {
        if self.is_dirty(path)? {
            return Ok(true);
        }

        let prefix = format!("{}/%", path_str(path).trim_end_matches('/'));
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let found: Option<i64> = real_conn
            .query_row(
                "SELECT seq FROM sync_changes
                 WHERE path LIKE ?1 OR old_path LIKE ?1 OR new_path LIKE ?1 LIMIT 1",
                params![prefix],
                |row| Ok(row.get(0)?),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The last thing the log did to `path` was unlink it.  Such a path must
    /// look gone even while the remote still shows it.
    pub fn is_unlinked(&self, path: &Path) -> TetherResult<bool> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let last_kind: Option<String> = real_conn
            .query_row(
                "SELECT kind FROM sync_changes WHERE path=?1 ORDER BY seq DESC LIMIT 1",
                params![path_str(path)],
                |row| Ok(row.get(0)?),
            )
            .optional()?;
        Ok(last_kind.as_deref() == Some("unlink"))
    }

    // ------------------------------------------------------------------
    // appends

    fn insert_entry(
        conn: &Connection,
        kind: ChangeKind,
        path: &Path,
        old_path: Option<&Path>,
        new_path: Option<&Path>,
        file_type: Option<FileType>,
        dev: Option<(u32, u32)>,
    ) -> TetherResult<i64> {
        conn.execute(
            "INSERT INTO sync_changes (ts, kind, path, old_path, new_path, file_type, dev_major, dev_minor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                get_now_secs(),
                kind.as_str(),
                path_str(path),
                old_path.map(path_str),
                new_path.map(path_str),
                file_type.map(|t| t.as_str()),
                dev.map(|d| d.0 as i64),
                dev.map(|d| d.1 as i64),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Journal the birth of a node.  Precondition: no live `new` for this
    /// path already exists.
    pub fn append_new(
        &self,
        path: &Path,
        file_type: FileType,
        dev: Option<(u32, u32)>,
    ) -> TetherResult<()> {
        debug!(target: SYNCLOG_TAG, "append_new {} ({})", path.display(), file_type);
        let _surgery = self.surgery.lock();
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        if Self::is_new_conn(&real_conn, path)? {
            return Err(TetherError::Exists(path.to_owned()));
        }

        Self::insert_entry(&real_conn, ChangeKind::New, path, None, None, Some(file_type), dev)?;
        drop(real_conn);
        self.state.poke();
        Ok(())
    }

    /// Journal a hardlink.  Kept for log completeness; the bridge reports
    /// hardlinks as unsupported, so nothing appends these today.
    pub fn append_link(&self, path: &Path) -> TetherResult<()> {
        debug!(target: SYNCLOG_TAG, "append_link {}", path.display());
        let _surgery = self.surgery.lock();
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        Self::insert_entry(&real_conn, ChangeKind::Link, path, None, None, None, None)?;
        drop(real_conn);
        self.state.poke();
        Ok(())
    }

    /// Journal an unlink, compacting the log in place first: everything the
    /// remote never saw simply vanishes.  A file created while disconnected
    /// and deleted while still disconnected leaves no trace at all.
    pub fn append_unlink(&self, path: &Path, file_type: FileType) -> TetherResult<()> {
        debug!(target: SYNCLOG_TAG, "append_unlink {}", path.display());
        let _surgery = self.surgery.lock();
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let was_new = Self::is_new_conn(&real_conn, path)?;
        let mut target = path.to_owned();

        if Self::is_dirty_conn(&real_conn, path)? {
            // walk newest to oldest so deleting the tail never shifts what's
            // still ahead of us
            let entries: Vec<SyncChange> = {
                let query = format!("SELECT {} FROM sync_changes ORDER BY seq DESC", CHANGE_COLS);
                let mut stmt = real_conn.prepare(&query)?;
                let rows = stmt
                    .query_map(rusqlite::NO_PARAMS, to_sync_change)?
                    .collect::<SqliteResult<Vec<SyncChange>>>()?;
                rows
            };

            for entry in entries {
                match entry.kind {
                    ChangeKind::New | ChangeKind::Change | ChangeKind::Link => {
                        if entry.path == target {
                            trace!(
                                target: SYNCLOG_TAG,
                                "Compacting away seq {} ({})",
                                entry.seq,
                                entry.kind
                            );
                            // file_changes and data_regions go with it via
                            // the cascading foreign keys
                            real_conn.execute(
                                "DELETE FROM sync_changes WHERE seq=?1",
                                params![entry.seq],
                            )?;
                        }
                    }
                    ChangeKind::Rename => {
                        if entry.new_path.as_deref() == Some(target.as_path()) {
                            // follow the rename backwards; the unlink applies
                            // to whatever name the remote still knows
                            let old = entry
                                .old_path
                                .clone()
                                .ok_or_else(|| TetherError::InvalidPath(target.clone()))?;
                            trace!(
                                target: SYNCLOG_TAG,
                                "Following rename {} <- {} during compaction",
                                old.display(),
                                target.display()
                            );
                            real_conn.execute(
                                "DELETE FROM sync_changes WHERE seq=?1",
                                params![entry.seq],
                            )?;
                            target = old;
                        }
                    }
                    ChangeKind::Unlink => {}
                }
            }
        }

        // only a file the remote has ever known needs an unlink replayed
        if !was_new {
            Self::insert_entry(
                &real_conn,
                ChangeKind::Unlink,
                &target,
                None,
                None,
                Some(file_type),
                None,
            )?;
        }

        drop(real_conn);
        self.state.poke();
        Ok(())
    }

    fn ensure_change_entry(conn: &Connection, path: &Path) -> TetherResult<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT seq FROM sync_changes WHERE path=?1 AND kind='change'",
                params![path_str(path)],
                |row| Ok(row.get(0)?),
            )
            .optional()?;

        let seq = match existing {
            Some(seq) => seq,
            None => {
                let seq =
                    Self::insert_entry(conn, ChangeKind::Change, path, None, None, None, None)?;
                conn.execute(
                    "INSERT INTO file_changes (change_seq) VALUES (?1)",
                    params![seq],
                )?;
                seq
            }
        };
        Ok(seq)
    }

    fn load_regions(conn: &Connection, seq: i64) -> TetherResult<Vec<DataRegion>> {
        let mut stmt = conn.prepare(
            "SELECT start, end, bytes, base FROM data_regions WHERE change_seq=?1 ORDER BY start",
        )?;
        let regions = stmt
            .query_map(params![seq], |row| {
                Ok(DataRegion {
                    start: row.get::<usize, i64>(0)? as u64,
                    end: row.get::<usize, i64>(1)? as u64,
                    bytes: row.get(2)?,
                    base: row.get(3)?,
                })
            })?
            .collect::<SqliteResult<Vec<DataRegion>>>()?;
        Ok(regions)
    }

    fn replace_regions(conn: &Connection, seq: i64, regions: &[DataRegion]) -> TetherResult<()> {
        conn.execute("DELETE FROM data_regions WHERE change_seq=?1", params![seq])?;
        for r in regions {
            conn.execute(
                "INSERT INTO data_regions (change_seq, start, end, bytes, base)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![seq, r.start as i64, r.end as i64, r.bytes, r.base],
            )?;
        }
        Ok(())
    }

    /// Journal a data write.  The region fuses into whatever is already
    /// pending for this path; the stored set stays non-overlapping and
    /// non-adjacent.
    pub fn append_change(&self, path: &Path, incoming: DataRegion) -> TetherResult<()> {
        debug!(
            target: SYNCLOG_TAG,
            "append_change {} {}",
            path.display(),
            incoming
        );
        let _surgery = self.surgery.lock();
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let seq = Self::ensure_change_entry(&real_conn, path)?;
        let regions = Self::load_regions(&real_conn, seq)?;
        let fused = region::install(regions, incoming);
        Self::replace_regions(&real_conn, seq, &fused)?;

        drop(real_conn);
        self.state.poke();
        Ok(())
    }

    /// Journal a metadata-only mutation.  Reuses the path's `change` entry,
    /// just flips the flags on its file-change.
    pub fn append_metadata_change(&self, path: &Path, changes: &MetaChanges) -> TetherResult<()> {
        debug!(
            target: SYNCLOG_TAG,
            "append_metadata_change {} {:?}",
            path.display(),
            changes
        );
        let _surgery = self.surgery.lock();
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let seq = Self::ensure_change_entry(&real_conn, path)?;

        let existing_xattrs: String = real_conn.query_row(
            "SELECT xattrs_changed FROM file_changes WHERE change_seq=?1",
            params![seq],
            |row| Ok(row.get(0)?),
        )?;
        let mut xattrs: Vec<String> = serde_json::from_str(&existing_xattrs).unwrap_or_default();
        for name in &changes.xattrs {
            if !xattrs.contains(name) {
                xattrs.push(name.clone());
            }
        }

        real_conn.execute(
            "UPDATE file_changes SET
                mode_changed = mode_changed OR ?1,
                uid_changed = uid_changed OR ?2,
                gid_changed = gid_changed OR ?3,
                times_changed = times_changed OR ?4,
                acl_changed = acl_changed OR ?5,
                xattrs_changed = ?6
             WHERE change_seq=?7",
            params![
                changes.mode,
                changes.uid,
                changes.gid,
                changes.times,
                changes.acl,
                serde_json::to_string(&xattrs).unwrap(),
                seq,
            ],
        )?;

        drop(real_conn);
        self.state.poke();
        Ok(())
    }

    /// Rewrites pending regions for a truncate so nothing reaches past the
    /// new size.  A truncate that changes nothing appends nothing.
    pub fn truncate_changes(&self, path: &Path, size: u64) -> TetherResult<()> {
        debug!(
            target: SYNCLOG_TAG,
            "truncate_changes {} to {}",
            path.display(),
            size
        );
        let _surgery = self.surgery.lock();
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let existing: Option<i64> = real_conn
            .query_row(
                "SELECT seq FROM sync_changes WHERE path=?1 AND kind='change'",
                params![path_str(path)],
                |row| Ok(row.get(0)?),
            )
            .optional()?;

        if let Some(seq) = existing {
            let regions = Self::load_regions(&real_conn, seq)?;
            let clipped = region::clip(regions, size);
            Self::replace_regions(&real_conn, seq, &clipped)?;
        }
        Ok(())
    }

    /// Journal a rename.  For a node born in this log, history itself is
    /// rewritten to the new name (the remote never saw the old one); for
    /// everything else a `rename` entry is appended.
    pub fn append_rename(&self, old: &Path, new: &Path, renamed_is_dir: bool) -> TetherResult<()> {
        debug!(
            target: SYNCLOG_TAG,
            "append_rename {} -> {}",
            old.display(),
            new.display()
        );
        let _surgery = self.surgery.lock();
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        if Self::is_new_conn(&real_conn, old)? {
            real_conn.execute(
                "UPDATE sync_changes SET path=?1 WHERE path=?2",
                params![path_str(new), path_str(old)],
            )?;

            if renamed_is_dir {
                // every journaled descendant moves with its directory
                let old_prefix = format!("{}/", path_str(old));
                let new_prefix = format!("{}/", path_str(new));

                let entries: Vec<(i64, String)> = {
                    let mut stmt = real_conn.prepare(
                        "SELECT seq, path FROM sync_changes WHERE path LIKE ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![format!("{}%", old_prefix)], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })?
                        .collect::<SqliteResult<Vec<(i64, String)>>>()?;
                    rows
                };

                for (seq, entry_path) in entries {
                    let moved = format!("{}{}", new_prefix, &entry_path[old_prefix.len()..]);
                    real_conn.execute(
                        "UPDATE sync_changes SET path=?1 WHERE seq=?2",
                        params![moved, seq],
                    )?;
                }
            }
        } else {
            let rename_seq = Self::insert_entry(
                &real_conn,
                ChangeKind::Rename,
                new,
                Some(old),
                Some(new),
                None,
                None,
            )?;

            if renamed_is_dir {
                // journaled descendants have to replay against their new
                // paths, and only after the rename itself has reached the
                // remote.  rewrite their paths and move them behind the
                // rename entry, preserving their relative order
                Self::resequence_subtree(&real_conn, old, new, rename_seq)?;
            }
        }

        drop(real_conn);
        self.state.poke();
        Ok(())
    }

    /// Rewrites every entry under `old/` to live under `new/`, re-appending
    /// them (fresh seqs, original relative order) so they drain after the
    /// rename entry that just went in.  The file-change rows and their data
    /// regions follow along via the cascading key updates.
    fn resequence_subtree(
        conn: &Connection,
        old: &Path,
        new: &Path,
        rename_seq: i64,
    ) -> TetherResult<()> {
        let old_prefix = format!("{}/", path_str(old));
        let new_prefix = format!("{}/", path_str(new));

        let entries: Vec<SyncChange> = {
            let query = format!(
                "SELECT {} FROM sync_changes WHERE seq < ?1 AND path LIKE ?2 ORDER BY seq",
                CHANGE_COLS
            );
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt
                .query_map(
                    params![rename_seq, format!("{}%", old_prefix)],
                    to_sync_change,
                )?
                .collect::<SqliteResult<Vec<SyncChange>>>()?;
            rows
        };

        for entry in entries {
            let moved = PathBuf::from(format!(
                "{}{}",
                new_prefix,
                &path_str(&entry.path)[old_prefix.len()..]
            ));
            trace!(
                target: SYNCLOG_TAG,
                "Resequencing seq {} as {}",
                entry.seq,
                moved.display()
            );

            let new_seq = Self::insert_entry(
                conn,
                entry.kind,
                &moved,
                entry.old_path.as_deref(),
                entry.new_path.as_deref(),
                entry.file_type,
                entry.dev_major.and_then(|maj| entry.dev_minor.map(|min| (maj, min))),
            )?;

            if entry.kind == ChangeKind::Change {
                conn.execute(
                    "UPDATE file_changes SET change_seq=?1 WHERE change_seq=?2",
                    params![new_seq, entry.seq],
                )?;
            }
            conn.execute("DELETE FROM sync_changes WHERE seq=?1", params![entry.seq])?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // consumption

    pub fn last_checkpoint(&self) -> TetherResult<i64> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let seq: Option<i64> = real_conn
            .query_row(
                "SELECT seq FROM sync_checkpoints WHERE consumer=?1",
                params![CONSUMER],
                |row| Ok(row.get(0)?),
            )
            .optional()?;
        Ok(seq.unwrap_or(0))
    }

    fn set_checkpoint(&self, seq: i64) -> TetherResult<()> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let updated = real_conn.execute(
            "UPDATE sync_checkpoints SET seq=?1 WHERE consumer=?2",
            params![seq, CONSUMER],
        )?;
        if updated == 0 {
            real_conn.execute(
                "INSERT INTO sync_checkpoints (consumer, seq) VALUES (?1, ?2)",
                params![CONSUMER, seq],
            )?;
        }
        Ok(())
    }

    /// A lazy, restartable walk of the log starting after the consumer
    /// checkpoint.  Blocks while the log is empty; yields `None` only when
    /// the overlay is shutting down or the user paused syncing.  Every
    /// yielded entry comes back with its path locks held; `finish` drops
    /// them.
    pub fn pop_changes(&self) -> TetherResult<ChangeIter<'_>> {
        let cursor = self.last_checkpoint()?;
        debug!(
            target: SYNCLOG_TAG,
            "Draining changes after seq {}", cursor
        );
        Ok(ChangeIter {
            log: self,
            cursor,
            waited: false,
            yielded: false,
        })
    }

    fn first_after(&self, cursor: i64) -> TetherResult<Option<(SyncChange, Option<FileChange>)>> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let query = format!(
            "SELECT {} FROM sync_changes WHERE seq > ?1 ORDER BY seq LIMIT 1",
            CHANGE_COLS
        );
        let maybe = real_conn
            .query_row(&query, params![cursor], to_sync_change)
            .optional()?;

        let item = match maybe {
            Some(item) => item,
            None => return Ok(None),
        };

        let file_change = if item.kind == ChangeKind::Change {
            let flags: Option<(bool, bool, bool, bool, bool, String)> = real_conn
                .query_row(
                    "SELECT mode_changed, uid_changed, gid_changed, times_changed, acl_changed,
                            xattrs_changed
                     FROM file_changes WHERE change_seq=?1",
                    params![item.seq],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()?;

            match flags {
                Some((mode, uid, gid, times, acl, xattrs_json)) => Some(FileChange {
                    change_seq: item.seq,
                    mode_changed: mode,
                    uid_changed: uid,
                    gid_changed: gid,
                    times_changed: times,
                    acl_changed: acl,
                    xattrs_changed: serde_json::from_str(&xattrs_json).unwrap_or_default(),
                    regions: Self::load_regions(&real_conn, item.seq)?,
                }),
                None => {
                    warn!(
                        target: SYNCLOG_TAG,
                        "No file change found for {}",
                        item.path.display()
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Some((item, file_change)))
    }

    fn lock_item(&self, item: &SyncChange) {
        match item.kind {
            ChangeKind::Rename => {
                let old = item.old_path.clone().unwrap_or_else(|| item.path.clone());
                let new = item.new_path.clone().unwrap_or_else(|| item.path.clone());
                // canonical order, same as the request side
                if old.as_os_str() <= new.as_os_str() {
                    self.locks.acquire(&old);
                    self.locks.acquire(&new);
                } else {
                    self.locks.acquire(&new);
                    self.locks.acquire(&old);
                }
            }
            _ => self.locks.acquire(&item.path),
        }
    }

    fn unlock_item(&self, item: &SyncChange) {
        match item.kind {
            ChangeKind::Rename => {
                let old = item.old_path.clone().unwrap_or_else(|| item.path.clone());
                let new = item.new_path.clone().unwrap_or_else(|| item.path.clone());
                self.locks.release(&new);
                self.locks.release(&old);
            }
            _ => self.locks.release(&item.path),
        }
    }

    /// Done with a popped entry.  Always drops the path locks; when `remove`
    /// is set the entry (and its file-change, via the cascade) is deleted and
    /// the consumer checkpoint advances to its seq.
    pub fn finish(&self, item: &SyncChange, remove: bool) -> TetherResult<()> {
        self.unlock_item(item);

        if remove {
            debug!(
                target: SYNCLOG_TAG,
                "Finishing seq {} ({} {})",
                item.seq,
                item.kind,
                item.path.display()
            );
            {
                let conn_lock = self.pool.get_conn();
                let conn = conn_lock.lock();
                let real_conn = conn.borrow();
                real_conn.execute("DELETE FROM sync_changes WHERE seq=?1", params![item.seq])?;
            }
            self.set_checkpoint(item.seq)?;
        } else {
            debug!(
                target: SYNCLOG_TAG,
                "Keeping seq {} for a later retry", item.seq
            );
        }
        Ok(())
    }

    /// The live `change` entry for `path`, with its file-change, if any.
    /// The cache manager uses this to hand a planner-detected conflict over
    /// to quarantine.
    pub fn change_entry(
        &self,
        path: &Path,
    ) -> TetherResult<Option<(SyncChange, Option<FileChange>)>> {
        let seq: Option<i64> = {
            let conn_lock = self.pool.get_conn();
            let conn = conn_lock.lock();
            let real_conn = conn.borrow();
            real_conn
                .query_row(
                    "SELECT seq FROM sync_changes WHERE path=?1 AND kind='change'",
                    params![path_str(path)],
                    |row| Ok(row.get(0)?),
                )
                .optional()?
        };

        match seq {
            Some(seq) => self.first_after(seq - 1),
            None => Ok(None),
        }
    }

    /// Deletes one entry without advancing the consumer checkpoint.  For
    /// out-of-band removal (quarantine from a request thread); the worker
    /// itself always goes through `finish`.
    pub fn remove_entry(&self, seq: i64) -> TetherResult<()> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();
        real_conn.execute("DELETE FROM sync_changes WHERE seq=?1", params![seq])?;
        Ok(())
    }

    /// Flushes the journal to disk
    pub fn checkpoint(&self) -> TetherResult<()> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();
        real_conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Human-readable queue contents, served through the synclog xattr
    pub fn dump(&self) -> TetherResult<String> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let query = format!("SELECT {} FROM sync_changes ORDER BY seq", CHANGE_COLS);
        let mut stmt = real_conn.prepare(&query)?;
        let entries = stmt
            .query_map(rusqlite::NO_PARAMS, to_sync_change)?
            .collect::<SqliteResult<Vec<SyncChange>>>()?;

        let mut out = String::new();
        for entry in entries {
            match entry.kind {
                ChangeKind::Rename => {
                    let _ = writeln!(
                        out,
                        "{} rename {} -> {}",
                        entry.seq,
                        entry.old_path.as_deref().unwrap_or(&entry.path).display(),
                        entry.new_path.as_deref().unwrap_or(&entry.path).display(),
                    );
                }
                _ => {
                    let regions: String = if entry.kind == ChangeKind::Change {
                        let regs = Self::load_regions(&real_conn, entry.seq)?;
                        regs.iter()
                            .map(|r| format!(" [{}:{}]", r.start, r.end))
                            .collect()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(
                        out,
                        "{} {} {}{}",
                        entry.seq,
                        entry.kind,
                        entry.path.display(),
                        regions
                    );
                }
            }
        }
        Ok(out)
    }

    /// How many entries are pending
    pub fn len(&self) -> TetherResult<usize> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let count: i64 = real_conn.query_row(
            "SELECT COUNT(*) FROM sync_changes",
            rusqlite::NO_PARAMS,
            |row| Ok(row.get(0)?),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> TetherResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// The blocking iterator behind `pop_changes`.  Cancellation (unmount or
/// pause) unblocks it and ends the sequence.
pub struct ChangeIter<'a> {
    log: &'a SyncLog,
    cursor: i64,
    waited: bool,
    yielded: bool,
}

impl<'a> Iterator for ChangeIter<'a> {
    type Item = (SyncChange, Option<FileChange>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.log.state.is_unmounted() || self.log.state.is_sync_paused() {
                return None;
            }

            match self.log.first_after(self.cursor) {
                Ok(Some((item, file_change))) => {
                    self.log.lock_item(&item);
                    self.cursor = item.seq;
                    self.yielded = true;
                    trace!(
                        target: SYNCLOG_TAG,
                        "Yielding seq {} ({} {})",
                        item.seq,
                        item.kind,
                        item.path.display()
                    );
                    return Some((item, file_change));
                }
                Ok(None) => {
                    // drained: the sequence ends and the worker goes idle.
                    // on a log that was empty from the start, block once for
                    // work to show up before giving up
                    if self.yielded || self.waited {
                        return None;
                    }
                    self.log.state.wait_for_change(Duration::from_secs(
                        crate::common::constants::MAX_FLAG_WAIT_SECS,
                    ));
                    self.waited = true;
                }
                Err(e) => {
                    warn!(target: SYNCLOG_TAG, "Error reading log: {:?}", e);
                    return None;
                }
            }
        }
    }
}
