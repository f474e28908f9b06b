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
use rusqlite::Result as SqliteResult;
use rusqlite::{Transaction, NO_PARAMS};

pub fn migrate(tx: &Transaction) -> SqliteResult<()> {
    // our metadata table for future proofing
    tx.execute(
        "CREATE TABLE IF NOT EXISTS tetherfs_meta (
            migration_version INTEGER NOT NULL DEFAULT 0,
            tetherfs_version TEXT NOT NULL
        )",
        NO_PARAMS,
    )?;

    tx.execute(
        "INSERT INTO tetherfs_meta
        (migration_version, tetherfs_version)
        VALUES (0, '0.0.0')",
        NO_PARAMS,
    )?;

    // one row per node the overlay knows about.  `path` is the overlay-side
    // absolute path and mutates on rename; `id` never does.  times are float
    // epoch seconds, xattrs/tags ride as json blobs
    tx.execute(
        "CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY NOT NULL,
            path TEXT NOT NULL UNIQUE,
            mode INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            atime FLOAT NOT NULL,
            mtime FLOAT NOT NULL,
            ctime FLOAT NOT NULL,
            remote_revision INTEGER NOT NULL DEFAULT 0,
            link_target TEXT,
            rdev INTEGER NOT NULL DEFAULT 0,
            xattrs TEXT NOT NULL DEFAULT '{}',
            tags TEXT NOT NULL DEFAULT '[]',
            acl TEXT
        )",
        NO_PARAMS,
    )?;

    // which remote revision the on-disk cache copy corresponds to.  a file
    // with no row here has never been cached
    tx.execute(
        "CREATE TABLE IF NOT EXISTS cached_revisions (
            file_id INTEGER PRIMARY KEY NOT NULL,
            revision INTEGER NOT NULL,
            mtime FLOAT NOT NULL,
            FOREIGN KEY (file_id) REFERENCES files (id) ON DELETE CASCADE
        )",
        NO_PARAMS,
    )?;

    // the sync log proper.  seq is the total order the worker drains in
    tx.execute(
        "CREATE TABLE IF NOT EXISTS sync_changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            ts FLOAT NOT NULL,
            kind TEXT NOT NULL,
            path TEXT,
            old_path TEXT,
            new_path TEXT,
            file_type TEXT,
            dev_major INTEGER,
            dev_minor INTEGER
        )",
        NO_PARAMS,
    )?;

    // at most one per 'change' entry
    tx.execute(
        "CREATE TABLE IF NOT EXISTS file_changes (
            change_seq INTEGER PRIMARY KEY NOT NULL,
            mode_changed INTEGER NOT NULL DEFAULT 0,
            uid_changed INTEGER NOT NULL DEFAULT 0,
            gid_changed INTEGER NOT NULL DEFAULT 0,
            times_changed INTEGER NOT NULL DEFAULT 0,
            acl_changed INTEGER NOT NULL DEFAULT 0,
            xattrs_changed TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (change_seq) REFERENCES sync_changes (seq)
                ON DELETE CASCADE ON UPDATE CASCADE
        )",
        NO_PARAMS,
    )?;

    // the pending byte spans of a file change, kept non-overlapping and
    // non-adjacent by the fusion pass on insert.  `bytes` is what the write
    // put there, `base` is what the span held before it, for the conflict
    // probe
    tx.execute(
        "CREATE TABLE IF NOT EXISTS data_regions (
            id INTEGER PRIMARY KEY NOT NULL,
            change_seq INTEGER NOT NULL,
            start INTEGER NOT NULL,
            end INTEGER NOT NULL,
            bytes BLOB NOT NULL,
            base BLOB NOT NULL,
            FOREIGN KEY (change_seq) REFERENCES file_changes (change_seq)
                ON DELETE CASCADE ON UPDATE CASCADE
        )",
        NO_PARAMS,
    )?;

    // where each log consumer has drained up to.  survives restart, which is
    // what makes crash recovery resume from the right entry
    tx.execute(
        "CREATE TABLE IF NOT EXISTS sync_checkpoints (
            consumer TEXT PRIMARY KEY NOT NULL,
            seq INTEGER NOT NULL
        )",
        NO_PARAMS,
    )?;

    Ok(())
}
