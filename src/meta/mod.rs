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

use rusqlite::{params, Connection, OptionalExtension, Row, NO_PARAMS};
use rusqlite::Result as SqliteResult;

use crate::common::constants::{META_CACHE_CAPACITY, META_CACHE_TTL_S};
use crate::common::err::{TetherError, TetherResult};
use libc::mode_t;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use ttl_cache::TtlCache;

pub mod migrations;
pub mod tpool;
pub mod types;

use tpool::ThreadConnPool;
use types::{CachedRevision, FileRecord};

pub const META_TAG: &str = "meta";
pub const MAX_CONN: u32 = 50;

// You'll see casting back and forth between u64 and i64.  This is because sqlite only natively
// supports i64.  Casting will change the interpretation of the bytes on u64 -> i64 overflow, but
// the bytes stay the same, so casting back to u64 gives us the original value, so it's fine.
// https://github.com/jgallagher/rusqlite/issues/250

/// Returns a correct connection with a very permissive contention handler
pub fn get_conn<P: AsRef<Path>>(db_path: P) -> SqliteResult<Connection> {
    trace!(target: META_TAG, "Opening {:?}", db_path.as_ref());
    let conn = Connection::open(&db_path)?;

    // so cached revisions and change details go away with their parent rows
    conn.execute("PRAGMA foreign_keys = 1", NO_PARAMS)?;

    // WAL lets the request threads read while the sync worker writes
    conn.pragma_update(None, "journal_mode", &"WAL".to_string())?;

    conn.busy_handler(Some(|num| -> bool {
        if num >= MAX_CONN as i32 {
            error!(target: META_TAG, "Timed out waiting for connection lock");
            false
        } else {
            warn!(
                target: META_TAG,
                "Sqlite database contention!  Tried {} times to acquire lock.  Trying again soon...",
                num + 1
            );
            std::thread::sleep(std::time::Duration::from_millis(100));
            true
        }
    }))?;
    Ok(conn)
}

pub fn get_now_secs() -> f64 {
    let now = std::time::SystemTime::now();
    let unix_ts = now.duration_since(std::time::UNIX_EPOCH).unwrap();
    unix_ts.as_secs_f64()
}

/// Synthesizes a revision token for backends with no native revisions.  The
/// token must be monotonic under ordinary remote activity, so the mtime (in
/// milliseconds) forms the high bits and a hash of (size, mtime) breaks ties
/// in the low bits.  Zero stays reserved for "never had a revision".
pub fn synthesize_revision(size: u64, mtime: f64) -> i64 {
    let mut hasher = metrohash::MetroHash64::default();
    hasher.write(&size.to_le_bytes());
    hasher.write(&mtime.to_bits().to_le_bytes());
    let tiebreak = hasher.finish() & 0xf_ffff;

    let millis = (mtime * 1000.0).max(0.0) as u64 & 0x3ff_ffff_ffff;
    let token = ((millis << 20) | tiebreak) as i64;
    if token == 0 {
        1
    } else {
        token
    }
}

fn to_file_record(row: &Row) -> SqliteResult<FileRecord> {
    let xattrs_json: String = row.get(12)?;
    let tags_json: String = row.get(13)?;
    let xattrs: HashMap<String, Vec<u8>> =
        serde_json::from_str(&xattrs_json).unwrap_or_default();
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let rec = FileRecord {
        id: row.get(0)?,
        path: PathBuf::from(row.get::<usize, String>(1)?),
        mode: row.get::<usize, i64>(2)? as mode_t,
        uid: row.get::<usize, i64>(3)? as libc::uid_t,
        gid: row.get::<usize, i64>(4)? as libc::gid_t,
        size: row.get::<usize, i64>(5)? as u64,
        atime: row.get(6)?,
        mtime: row.get(7)?,
        ctime: row.get(8)?,
        remote_revision: row.get(9)?,
        link_target: row
            .get::<usize, Option<String>>(10)?
            .map(PathBuf::from),
        rdev: row.get::<usize, i64>(11)? as u64,
        xattrs,
        tags,
        acl: row.get(14)?,
    };
    Ok(rec)
}

const RECORD_COLS: &str = "id, path, mode, uid, gid, size, atime, mtime, ctime, \
                           remote_revision, link_target, rdev, xattrs, tags, acl";

/// Escape a path for use in a LIKE pattern, since paths can legitimately
/// contain the LIKE metacharacters
fn like_escape(val: &str) -> String {
    val.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// The transactional store for file records and cached revisions, fronted by
/// a bounded TTL read cache.  Writes always go to sqlite first and then fix
/// up the read cache, which is what keeps reads-after-writes consistent
/// across the request threads and the sync worker.
pub struct MetaStore {
    pool: Arc<ThreadConnPool>,
    read_cache: Mutex<TtlCache<PathBuf, FileRecord>>,
}

impl MetaStore {
    pub fn new(db_path: &Path) -> TetherResult<Self> {
        let mut conn = get_conn(db_path)?;
        migrations::migrate(&mut conn, &crate::common::version_str())?;

        Ok(Self {
            pool: Arc::new(ThreadConnPool::new(db_path.to_owned())),
            read_cache: Mutex::new(TtlCache::new(META_CACHE_CAPACITY)),
        })
    }

    pub fn pool(&self) -> Arc<ThreadConnPool> {
        Arc::clone(&self.pool)
    }

    fn cache_ttl() -> Duration {
        Duration::from_secs(META_CACHE_TTL_S)
    }

    pub fn get(&self, path: &Path) -> TetherResult<FileRecord> {
        self.try_get(path)?
            .ok_or_else(|| TetherError::NotFound(path.to_owned()))
    }

    pub fn try_get(&self, path: &Path) -> TetherResult<Option<FileRecord>> {
        {
            let mut cache = self.read_cache.lock();
            if let Some(rec) = cache.get(&path.to_path_buf()) {
                trace!(target: META_TAG, "Read cache hit for {}", path.display());
                return Ok(Some(rec.clone()));
            }
        }

        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let query = format!("SELECT {} FROM files WHERE path=?1", RECORD_COLS);
        let maybe = real_conn
            .query_row(
                &query,
                params![path.to_string_lossy().to_string()],
                to_file_record,
            )
            .optional()?;

        if let Some(rec) = &maybe {
            let mut cache = self.read_cache.lock();
            cache.insert(path.to_owned(), rec.clone(), MetaStore::cache_ttl());
        }

        Ok(maybe)
    }

    /// Create or update the record for `rec.path`.  On create, `rec.id` is
    /// filled in with the assigned row id.
    pub fn put(&self, rec: &mut FileRecord) -> TetherResult<()> {
        let path_str = rec.path.to_string_lossy().to_string();
        let xattrs = serde_json::to_string(&rec.xattrs).unwrap();
        let tags = serde_json::to_string(&rec.tags).unwrap();

        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let existing: Option<i64> = real_conn
            .query_row(
                "SELECT id FROM files WHERE path=?1",
                params![path_str],
                |row| Ok(row.get(0)?),
            )
            .optional()?;

        match existing {
            Some(id) => {
                debug!(target: META_TAG, "Updating record for {}", rec.path.display());
                real_conn.execute(
                    "UPDATE files SET
                        mode=?1, uid=?2, gid=?3, size=?4, atime=?5, mtime=?6, ctime=?7,
                        remote_revision=?8, link_target=?9, rdev=?10, xattrs=?11, tags=?12,
                        acl=?13
                     WHERE id=?14",
                    params![
                        rec.mode as i64,
                        rec.uid as i64,
                        rec.gid as i64,
                        rec.size as i64,
                        rec.atime,
                        rec.mtime,
                        rec.ctime,
                        rec.remote_revision,
                        rec.link_target.as_ref().map(|t| t.to_string_lossy().to_string()),
                        rec.rdev as i64,
                        xattrs,
                        tags,
                        rec.acl,
                        id,
                    ],
                )?;
                rec.id = id;
            }
            None => {
                debug!(target: META_TAG, "Creating record for {}", rec.path.display());
                real_conn.execute(
                    "INSERT INTO files
                        (path, mode, uid, gid, size, atime, mtime, ctime, remote_revision,
                         link_target, rdev, xattrs, tags, acl)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        path_str,
                        rec.mode as i64,
                        rec.uid as i64,
                        rec.gid as i64,
                        rec.size as i64,
                        rec.atime,
                        rec.mtime,
                        rec.ctime,
                        rec.remote_revision,
                        rec.link_target.as_ref().map(|t| t.to_string_lossy().to_string()),
                        rec.rdev as i64,
                        xattrs,
                        tags,
                        rec.acl,
                    ],
                )?;
                rec.id = real_conn.last_insert_rowid();
            }
        }

        let mut cache = self.read_cache.lock();
        cache.insert(rec.path.clone(), rec.clone(), MetaStore::cache_ttl());
        Ok(())
    }

    pub fn delete(&self, path: &Path) -> TetherResult<()> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        real_conn.execute(
            "DELETE FROM files WHERE path=?1",
            params![path.to_string_lossy().to_string()],
        )?;

        let mut cache = self.read_cache.lock();
        cache.remove(&path.to_path_buf());
        Ok(())
    }

    /// The records whose paths are immediate children of `path`
    pub fn list_prefix(&self, path: &Path) -> TetherResult<Vec<FileRecord>> {
        let prefix = {
            let raw = path.to_string_lossy();
            if raw.ends_with('/') {
                raw.to_string()
            } else {
                format!("{}/", raw)
            }
        };
        let escaped = like_escape(&prefix);
        let children = format!("{}%", escaped);
        let grandchildren = format!("{}%/%", escaped);

        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let query = format!(
            "SELECT {} FROM files
             WHERE path LIKE ?1 ESCAPE '\\' AND path NOT LIKE ?2 ESCAPE '\\'
             ORDER BY path",
            RECORD_COLS
        );
        let mut stmt = real_conn.prepare(&query)?;
        let records = stmt
            .query_map(params![children, grandchildren], to_file_record)?
            .collect::<SqliteResult<Vec<FileRecord>>>()?;
        Ok(records)
    }

    /// Moves `old` to `new`, and when `old` was a directory, rewrites every
    /// descendant path in the same transaction so a crash can't leave the
    /// tree half-renamed
    pub fn rename_subtree(&self, old: &Path, new: &Path, is_dir: bool) -> TetherResult<()> {
        let old_str = old.to_string_lossy().to_string();
        let new_str = new.to_string_lossy().to_string();

        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let mut real_conn = conn.borrow_mut();
        let tx = real_conn.transaction()?;

        tx.execute(
            "UPDATE files SET path=?1 WHERE path=?2",
            params![new_str, old_str],
        )?;

        if is_dir {
            let prefix = format!("{}/", old_str);
            let pattern = format!("{}%", like_escape(&prefix));

            let descendants: Vec<(i64, String)> = {
                let mut stmt =
                    tx.prepare("SELECT id, path FROM files WHERE path LIKE ?1 ESCAPE '\\'")?;
                let rows = stmt
                    .query_map(params![pattern], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<SqliteResult<Vec<(i64, String)>>>()?;
                rows
            };

            for (id, desc_path) in descendants {
                let moved = format!("{}{}", new_str, &desc_path[old_str.len()..]);
                tx.execute("UPDATE files SET path=?1 WHERE id=?2", params![moved, id])?;
            }
        }

        tx.commit()?;

        // paths moved wholesale, the cheapest correct thing is to drop the lot
        let mut cache = self.read_cache.lock();
        cache.clear();
        Ok(())
    }

    pub fn get_cached_rev(&self, file_id: i64) -> TetherResult<Option<CachedRevision>> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let maybe = real_conn
            .query_row(
                "SELECT file_id, revision, mtime FROM cached_revisions WHERE file_id=?1",
                params![file_id],
                |row| {
                    Ok(CachedRevision {
                        file_id: row.get(0)?,
                        revision: row.get(1)?,
                        mtime: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(maybe)
    }

    pub fn put_cached_rev(&self, file_id: i64, revision: i64, mtime: f64) -> TetherResult<()> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        let updated = real_conn.execute(
            "UPDATE cached_revisions SET revision=?1, mtime=?2 WHERE file_id=?3",
            params![revision, mtime, file_id],
        )?;
        if updated == 0 {
            real_conn.execute(
                "INSERT INTO cached_revisions (file_id, revision, mtime) VALUES (?1, ?2, ?3)",
                params![file_id, revision, mtime],
            )?;
        }
        Ok(())
    }

    pub fn delete_cached_rev(&self, file_id: i64) -> TetherResult<()> {
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();

        real_conn.execute(
            "DELETE FROM cached_revisions WHERE file_id=?1",
            params![file_id],
        )?;
        Ok(())
    }

    /// Forces durability of everything written so far
    pub fn checkpoint(&self) -> TetherResult<()> {
        debug!(target: META_TAG, "Checkpointing metadata store");
        let conn_lock = self.pool.get_conn();
        let conn = conn_lock.lock();
        let real_conn = conn.borrow();
        real_conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}
