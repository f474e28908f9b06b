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

//! Disconnected operation end to end: create and mutate against the cache,
//! reconnect, drain, and check what the remote ends up with.

use crate::common::{TestHelper, TestResult};
use std::path::Path;
use tetherfs::fuse::Filesystem;

#[test]
fn test_offline_create_then_reconnect() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/a.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/a.txt"), b"hello", 0)?;
    th.fs.release(&req, Path::new("/a.txt"))?;

    // the journal knows about the birth and the bytes
    assert!(th.log.is_new(Path::new("/a.txt"))?);
    let (_item, change) = th
        .log
        .change_entry(Path::new("/a.txt"))?
        .expect("change entry expected");
    let regions = change.unwrap().regions;
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (0, 5));
    assert_eq!(regions[0].bytes, b"hello".to_vec());

    // nothing on the remote yet
    assert!(!th.remote_exists("/a.txt"));

    th.connect();
    th.drain();

    assert_eq!(th.read_remote_file("/a.txt"), b"hello".to_vec());
    assert_eq!(th.remote_mode("/a.txt"), 0o600);
    assert!(th.log.is_empty()?);

    // the cache copy now corresponds to a known remote revision
    let rec = th.meta.get(Path::new("/a.txt"))?;
    assert!(th.meta.get_cached_rev(rec.id)?.is_some());
    Ok(())
}

#[test]
fn test_offline_create_then_unlink_leaves_no_trace() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/ghost.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/ghost.txt"), b"boo", 0)?;
    th.fs.unlink(&req, Path::new("/ghost.txt"))?;

    assert!(th.log.is_empty()?);
    assert!(!th.cache.is_cached_to_disk(Path::new("/ghost.txt")));
    assert!(th.meta.try_get(Path::new("/ghost.txt"))?.is_none());

    // reconnecting and draining has nothing to say to the remote
    th.connect();
    th.drain();
    assert!(!th.remote_exists("/ghost.txt"));
    Ok(())
}

#[test]
fn test_rename_while_new_collapses() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs
        .open(&req, Path::new("/x"), libc::O_CREAT | libc::O_WRONLY, Some(0o600))?;
    th.fs.rename(&req, Path::new("/x"), Path::new("/y"))?;
    th.fs.write(&req, Path::new("/y"), b"Z", 0)?;

    // the log holds new(/y) and change(/y), no rename
    assert!(th.log.is_new(Path::new("/y"))?);
    assert!(!th.log.is_dirty(Path::new("/x"))?);
    assert!(!th.log.dump()?.contains("rename"));

    th.connect();
    th.drain();

    assert_eq!(th.read_remote_file("/y"), b"Z".to_vec());
    assert!(!th.remote_exists("/x"));
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_offline_write_replays_cleanly_when_remote_unchanged() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/doc.txt", b"0123456789");
    th.connect();

    // pull it into the cache
    let data = th.fs.read(&req, Path::new("/doc.txt"), 0, 10)?;
    assert_eq!(data, b"0123456789".to_vec());
    assert!(th.cache.is_cached_to_disk(Path::new("/doc.txt")));

    th.disconnect();
    th.fs.write(&req, Path::new("/doc.txt"), b"AB", 2)?;
    assert_eq!(
        th.fs.read(&req, Path::new("/doc.txt"), 0, 10)?,
        b"01AB456789".to_vec()
    );

    th.connect();
    th.drain();

    assert_eq!(th.read_remote_file("/doc.txt"), b"01AB456789".to_vec());
    assert!(th.log.is_empty()?);
    // no quarantine happened
    assert!(th.conflict_file_content("/doc.txt").is_none());
    Ok(())
}

#[test]
fn test_offline_metadata_change_propagates() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/perms.txt", b"content");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/perms.txt"), 0, 7)?;

    th.disconnect();
    th.fs.chmod(&req, Path::new("/perms.txt"), 0o640)?;

    th.connect();
    th.drain();

    assert_eq!(th.remote_mode("/perms.txt"), 0o640);
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_offline_mkdir_and_symlink_propagate() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.mkdir(&req, Path::new("/newdir"), 0o755)?;
    th.fs
        .symlink(&req, Path::new("/newdir"), Path::new("/alias"))?;

    th.connect();
    th.drain();

    assert!(th.remote_path("/newdir").is_dir());
    let target = std::fs::read_link(th.remote_path("/alias"))?;
    assert_eq!(target, Path::new("/newdir"));
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_disconnect_mid_drain_keeps_entry_and_resumes() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/later.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/later.txt"), b"data", 0)?;

    // the flag says available but the server is actually down, so the first
    // propagation attempt fails transiently
    th.remote.set_up(false);
    th.state.set_available(true);
    th.drain();

    // the entry survived and the worker noticed the disconnect
    assert!(!th.state.is_available());
    assert!(!th.log.is_empty()?);

    // once the server really is back, the same entry drains
    th.connect();
    th.drain();
    assert_eq!(th.read_remote_file("/later.txt"), b"data".to_vec());
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_offline_unlink_of_remote_file_propagates() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/victim.txt", b"bye");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/victim.txt"), 0, 3)?;

    th.disconnect();
    th.fs.unlink(&req, Path::new("/victim.txt"))?;

    // disconnected, the file is gone from the overlay's view
    assert!(th.fs.getattr(&req, Path::new("/victim.txt")).is_err());

    th.connect();
    th.drain();

    assert!(!th.remote_exists("/victim.txt"));
    assert!(th.log.is_empty()?);
    Ok(())
}
