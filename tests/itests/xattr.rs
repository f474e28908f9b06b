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

//! The tetherfs.* virtual attribute surface: reporting cache state and
//! driving the overlay through setxattr.

use crate::common::{TestHelper, TestResult};
use std::path::Path;
use tetherfs::fuse::Filesystem;

#[test]
fn test_in_cache_flag() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/f.txt", b"content");
    th.connect();

    let val = th
        .fs
        .getxattr(&req, Path::new("/f.txt"), "tetherfs.in-cache")?;
    assert_eq!(val, b"0".to_vec());

    let _ = th.fs.read(&req, Path::new("/f.txt"), 0, 7)?;

    let val = th
        .fs
        .getxattr(&req, Path::new("/f.txt"), "tetherfs.in-cache")?;
    assert_eq!(val, b"1".to_vec());
    Ok(())
}

#[test]
fn test_dirty_flag_is_recursive_for_dirs() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.mkdir(&req, Path::new("/d"), 0o755)?;
    th.fs.open(
        &req,
        Path::new("/d/f.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/d/f.txt"), b"x", 0)?;

    let val = th.fs.getxattr(&req, Path::new("/d/f.txt"), "tetherfs.dirty")?;
    assert_eq!(val, b"1".to_vec());

    // the directory reports dirt below it
    let val = th.fs.getxattr(&req, Path::new("/d"), "tetherfs.dirty")?;
    assert_eq!(val, b"1".to_vec());
    Ok(())
}

#[test]
fn test_should_cache_roundtrip() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.connect();

    let val = th
        .fs
        .getxattr(&req, Path::new("/media"), "tetherfs.should-cache")?;
    assert_eq!(val, b"= (+)".to_vec());

    th.fs
        .setxattr(&req, Path::new("/media"), "tetherfs.should-cache", b"-")?;
    let val = th
        .fs
        .getxattr(&req, Path::new("/media"), "tetherfs.should-cache")?;
    assert_eq!(val, b"-".to_vec());

    // children inherit
    let val = th
        .fs
        .getxattr(&req, Path::new("/media/sub"), "tetherfs.should-cache")?;
    assert_eq!(val, b"= (-)".to_vec());

    // back to inheriting
    th.fs
        .setxattr(&req, Path::new("/media"), "tetherfs.should-cache", b"=")?;
    let val = th
        .fs
        .getxattr(&req, Path::new("/media"), "tetherfs.should-cache")?;
    assert_eq!(val, b"= (+)".to_vec());
    Ok(())
}

#[test]
fn test_connected_flag_tracks_availability() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.disconnect();
    let val = th.fs.getxattr(&req, Path::new("/"), "tetherfs.connected")?;
    assert_eq!(val, b"0".to_vec());

    th.connect();
    let val = th.fs.getxattr(&req, Path::new("/"), "tetherfs.connected")?;
    assert_eq!(val, b"1".to_vec());

    // connected is read-only
    assert!(th
        .fs
        .setxattr(&req, Path::new("/"), "tetherfs.connected", b"0")
        .is_err());
    Ok(())
}

#[test]
fn test_pause_sync_blocks_draining() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/pending.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/pending.txt"), b"wait", 0)?;

    th.fs
        .setxattr(&req, Path::new("/"), "tetherfs.pause-sync", b"1")?;
    let val = th.fs.getxattr(&req, Path::new("/"), "tetherfs.pause-sync")?;
    assert_eq!(val, b"1".to_vec());

    // paused: connecting and draining moves nothing
    th.connect();
    th.drain();
    assert!(!th.remote_exists("/pending.txt"));
    assert!(!th.log.is_empty()?);

    th.fs
        .setxattr(&req, Path::new("/"), "tetherfs.pause-sync", b"0")?;
    th.drain();
    assert!(th.remote_exists("/pending.txt"));
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_force_disconnect_drops_availability() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.connect();

    th.fs
        .setxattr(&req, Path::new("/"), "tetherfs.force-disconnect", b"1")?;

    assert!(!th.state.is_available());
    let val = th
        .fs
        .getxattr(&req, Path::new("/"), "tetherfs.force-disconnect")?;
    assert_eq!(val, b"1".to_vec());

    th.fs
        .setxattr(&req, Path::new("/"), "tetherfs.force-disconnect", b"0")?;
    let val = th
        .fs
        .getxattr(&req, Path::new("/"), "tetherfs.force-disconnect")?;
    assert_eq!(val, b"0".to_vec());
    Ok(())
}

#[test]
fn test_synclog_dump_lists_entries() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/logged.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/logged.txt"), b"entry", 0)?;

    let dump = th.fs.getxattr(&req, Path::new("/"), "tetherfs.synclog")?;
    let dump = String::from_utf8(dump)?;
    assert!(dump.contains("new /logged.txt"), "dump was: {}", dump);
    assert!(dump.contains("change /logged.txt"), "dump was: {}", dump);
    Ok(())
}

#[test]
fn test_version_attribute() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    let val = th.fs.getxattr(&req, Path::new("/"), "tetherfs.version")?;
    assert_eq!(val, tetherfs::common::version_str().into_bytes());
    Ok(())
}

#[test]
fn test_root_attrs_absent_on_files() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/plain.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;

    // a root-scoped name on a file falls through to the real xattrs, where
    // it doesn't exist
    assert!(th
        .fs
        .getxattr(&req, Path::new("/plain.txt"), "tetherfs.synclog")
        .is_err());
    Ok(())
}

#[test]
fn test_user_xattrs_journal_and_propagate() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    // not every filesystem a tempdir lands on supports user xattrs
    let probe = th.td.path().join("xattr-probe");
    std::fs::write(&probe, b"probe")?;
    if xattr::set(&probe, "user.probe", b"1").is_err() {
        eprintln!("skipping: no user xattr support in the tempdir");
        return Ok(());
    }

    th.write_remote_file("/tagged.txt", b"data");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/tagged.txt"), 0, 4)?;

    th.disconnect();
    th.fs
        .setxattr(&req, Path::new("/tagged.txt"), "user.color", b"teal")?;

    let val = th.fs.getxattr(&req, Path::new("/tagged.txt"), "user.color")?;
    assert_eq!(val, b"teal".to_vec());

    th.connect();
    th.drain();

    let remote_val = xattr::get(th.remote_path("/tagged.txt"), "user.color")?;
    assert_eq!(remote_val, Some(b"teal".to_vec()));
    Ok(())
}

#[test]
fn test_listxattr_includes_overlay_names() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/listed.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;

    let names = th.fs.listxattr(&req, Path::new("/listed.txt"))?;
    assert!(names.contains(&"tetherfs.in-cache".to_string()));
    assert!(names.contains(&"tetherfs.dirty".to_string()));
    assert!(names.contains(&"tetherfs.should-cache".to_string()));
    // root-only names stay off regular files
    assert!(!names.contains(&"tetherfs.synclog".to_string()));
    Ok(())
}
