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

//! Conflict quarantine.  When the remote wins, the loser's changes are not
//! thrown away: they're appended as a textual changeset under the conflict
//! directory, and that file is itself journaled so it eventually reaches the
//! remote.  The format is line-oriented and replayable by an interpreter
//! (future work); treat it as a wire format and don't "improve" it.

use crate::cache::lockpool::PathLocks;
use crate::cache::store::CacheStore;
use crate::common::conflict_file_name;
use crate::common::err::TetherResult;
use crate::meta::types::{ChangeKind, FileChange, FileRecord, SyncChange};
use crate::meta::{get_now_secs, MetaStore};
use crate::synclog::{region, SyncLog};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TAG: &str = "conflict";

const CONFLICT_PREAMBLE_HEADER: &str = "# New changeset at";

const CONFLICT_POSTAMBLE: &str = "
try:
  changesets.append(set)
except NameError:
  changesets = [set]
changesets

";

/// Renders bytes as a quoted literal the changeset interpreter can eval:
/// printable ascii stays itself, everything else becomes a \xNN escape
fn data_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('\'');
    for b in bytes {
        match b {
            b'\'' => out.push_str("\\'"),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(*b as char),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('\'');
    out
}

pub struct ConflictHandler {
    conflict_dir: PathBuf,
    meta: Arc<MetaStore>,
    store: Arc<CacheStore>,
    locks: Arc<PathLocks>,
}

impl ConflictHandler {
    pub fn new(
        conflict_dir: PathBuf,
        meta: Arc<MetaStore>,
        store: Arc<CacheStore>,
        locks: Arc<PathLocks>,
    ) -> Self {
        Self {
            conflict_dir,
            meta,
            store,
            locks,
        }
    }

    pub fn conflict_dir(&self) -> &Path {
        &self.conflict_dir
    }

    /// The quarantine path a conflicted overlay path maps to
    pub fn conflict_path_for(&self, loser: &Path) -> PathBuf {
        self.conflict_dir.join(conflict_file_name(loser))
    }

    fn ensure_conflict_dir(&self, log: &SyncLog) -> TetherResult<()> {
        let _guard = self.locks.lock(&self.conflict_dir);

        if self.meta.try_get(&self.conflict_dir)?.is_some() {
            debug!(target: TAG, "Conflict dir already existed -- not recreating");
            return Ok(());
        }

        info!(
            target: TAG,
            "Conflict dir missing -- creating {}",
            self.conflict_dir.display()
        );
        self.store.mkdir(&self.conflict_dir, 0o700)?;

        let now = get_now_secs();
        let mut rec = FileRecord {
            id: 0,
            path: self.conflict_dir.clone(),
            mode: libc::S_IFDIR | 0o700,
            uid: 0,
            gid: 0,
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

        log.append_new(
            &self.conflict_dir,
            crate::common::types::FileType::Directory,
            None,
        )?;
        Ok(())
    }

    /// Writes the loser's changes out as an appended changeset, journals the
    /// conflict file, and evicts the loser's cached copy so the next read
    /// refetches the remote's winning content.  Returns the conflict file's
    /// overlay path.
    pub fn quarantine(
        &self,
        log: &SyncLog,
        item: &SyncChange,
        change: Option<&FileChange>,
    ) -> TetherResult<PathBuf> {
        let loser = match item.kind {
            ChangeKind::Rename => item.old_path.clone().unwrap_or_else(|| item.path.clone()),
            _ => item.path.clone(),
        };

        info!(
            target: TAG,
            "Quarantining {} change on {}",
            item.kind,
            loser.display()
        );

        self.ensure_conflict_dir(log)?;

        let conflict_path = self.conflict_path_for(&loser);
        let _guard = self.locks.lock(&conflict_path);

        let was_new = self.meta.try_get(&conflict_path)?.is_none();
        if was_new {
            debug!(
                target: TAG,
                "Creating conflict file {}",
                conflict_path.display()
            );
            self.store.create_file(&conflict_path, 0o600)?;
        }

        let start_pos = self.store.size(&conflict_path)?;

        // assemble the whole changeset and append it in one write
        let ts = get_now_secs() as i64;
        let mut changeset = String::new();
        changeset.push_str(&format!(
            "\n{} {}\nset = ChangeSet({})\n",
            CONFLICT_PREAMBLE_HEADER, ts, ts
        ));

        match item.kind {
            ChangeKind::Change => {
                if let Some(change) = change {
                    for r in &change.regions {
                        // the loser's bytes live in the cache copy; pad a
                        // short read so the span is always fully described
                        let mut data = self.store.read(&loser, r.start, r.len() as usize)?;
                        data.resize(r.len() as usize, 0);

                        changeset.push_str(&format!(
                            "set.addChange(type_=\"patch\", start={}, end={}, data={})\n",
                            r.start,
                            r.end,
                            data_literal(&data)
                        ));
                    }
                }
            }
            ChangeKind::Unlink => {
                changeset.push_str("set.addUnlink()\n");
            }
            ChangeKind::New | ChangeKind::Link | ChangeKind::Rename => {
                // nothing sensible to record as a patch for these
                debug!(
                    target: TAG,
                    "No changeset body for a {} entry", item.kind
                );
            }
        }

        changeset.push_str(CONFLICT_POSTAMBLE);

        let blob = changeset.into_bytes();
        self.store.write(&conflict_path, start_pos, &blob)?;
        let end_pos = start_pos + blob.len() as u64;

        // the conflict file is an overlay citizen too, keep its record honest
        let now = get_now_secs();
        match self.meta.try_get(&conflict_path)? {
            Some(mut rec) => {
                rec.size = end_pos;
                rec.mtime = now;
                self.meta.put(&mut rec)?;
            }
            None => {
                let mut rec = FileRecord {
                    id: 0,
                    path: conflict_path.clone(),
                    mode: libc::S_IFREG | 0o600,
                    uid: 0,
                    gid: 0,
                    size: end_pos,
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
            }
        }

        // queue the conflict file itself for propagation
        if was_new {
            debug!(target: TAG, "Conflict file was new -- adding to synclog");
            log.append_new(
                &conflict_path,
                crate::common::types::FileType::Regular,
                None,
            )?;
        } else {
            debug!(target: TAG, "Conflict file existed -- adding change");
            // the changeset is appended past the file's previous end, so the
            // span's pre-write snapshot is all zeros
            let snapshot = vec![0u8; blob.len()];
            log.append_change(
                &conflict_path,
                region::new_region(start_pos, end_pos, blob, snapshot)?,
            )?;
        }

        // evict the loser: next read pulls the remote's winning copy
        if let Some(loser_rec) = self.meta.try_get(&loser)? {
            if self.store.exists(&loser) && !loser_rec.is_dir() {
                self.store.unlink(&loser)?;
            }
            self.meta.delete_cached_rev(loser_rec.id)?;
        } else if self.store.exists(&loser) {
            self.store.unlink(&loser)?;
        }

        Ok(conflict_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_literal_printable() {
        assert_eq!(data_literal(b"BB"), "'BB'");
    }

    #[test]
    fn test_data_literal_escapes() {
        assert_eq!(data_literal(b"a'b"), "'a\\'b'");
        assert_eq!(data_literal(b"a\\b"), "'a\\\\b'");
        assert_eq!(data_literal(b"\x00\x01"), "'\\x00\\x01'");
        assert_eq!(data_literal(b"line\n"), "'line\\n'");
    }
}
