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

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::meta;
use log::trace;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::path::PathBuf;

// the pool is shared amongst the bridge request threads and the sync worker, hence Arc.
// most accesses are reads of the map, so RwLock.  the RefCell is because creating a
// transaction requires a mutable &Connection, and the Mutex guards the RefCell's interior
// mutability across the (theoretical) case of another thread holding a clone of the Arc
type ConnMap = Arc<RwLock<HashMap<ThreadId, Arc<Mutex<RefCell<Connection>>>>>>;

const TAG: &str = "meta_thread_pool";

/// Lazily creates database connections with strict thread-affinity.  Sqlite
/// connections must not hop threads, but every bridge request thread and the
/// sync worker all need one, so each thread gets its own, re-used across
/// requests.  This is also what gives the store read-your-writes within a
/// thread: a thread always talks to the same connection.
pub struct ThreadConnPool {
    pool: ConnMap,
    db_path: PathBuf,
}

impl ThreadConnPool {
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
            db_path,
        }
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn raw_conn(&self) -> Connection {
        meta::get_conn(&self.db_path).expect("Couldn't create db connection")
    }

    pub fn get_conn(&self) -> Arc<Mutex<RefCell<Connection>>> {
        let tid = std::thread::current().id();
        trace!(target: TAG, "Attempting to get a db connection");

        let read_guard = self.pool.read();

        match read_guard.get(&tid) {
            // we have one already?  just clone the Arc
            Some(val) => {
                trace!(target: TAG, "Found an existing db connection");
                Arc::clone(val)
            }
            None => {
                trace!(target: TAG, "No existing db connection, creating");

                // dropping the read lock before taking the write lock looks racy, but another
                // thread only ever inserts a Connection *for its own thread id*, so there's no
                // way this key gets inserted behind our back
                drop(read_guard);

                let new_raw_conn = self.raw_conn();
                let new_conn = Arc::new(Mutex::new(RefCell::new(new_raw_conn)));

                let mut write_guard = self.pool.write();
                write_guard.insert(tid, Arc::clone(&new_conn));
                new_conn
            }
        }
    }
}
