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

use crate::common::{TestHelper, TestResult};
use std::path::Path;
use tetherfs::fuse::Filesystem;

#[test]
fn test_read_pulls_into_cache() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/pull.txt", b"pulled content");
    th.connect();

    assert!(!th.cache.is_cached_to_disk(Path::new("/pull.txt")));
    let data = th.fs.read(&req, Path::new("/pull.txt"), 0, 14)?;
    assert_eq!(data, b"pulled content".to_vec());

    assert!(th.cache.is_cached_to_disk(Path::new("/pull.txt")));
    let rec = th.meta.get(Path::new("/pull.txt"))?;
    assert!(th.meta.get_cached_rev(rec.id)?.is_some());
    Ok(())
}

#[test]
fn test_stat_alone_does_not_pull() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/lazy.txt", b"not yet");
    th.connect();

    let attr = th.fs.getattr(&req, Path::new("/lazy.txt"))?;
    assert_eq!(attr.size, 7);
    assert!(!th.cache.is_cached_to_disk(Path::new("/lazy.txt")));
    Ok(())
}

#[test]
fn test_never_cache_policy_passes_through() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/scratch/junk.txt", b"junky");
    th.connect();
    th.cache.set_policy(Path::new("/scratch"), Some(false))?;

    let data = th.fs.read(&req, Path::new("/scratch/junk.txt"), 0, 5)?;
    assert_eq!(data, b"junky".to_vec());
    // policy inherited from /scratch kept it out of the cache
    assert!(!th.cache.is_cached_to_disk(Path::new("/scratch/junk.txt")));
    Ok(())
}

#[test]
fn test_banned_path_disappears_when_disconnected() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/scratch/junk.txt", b"junky");
    th.connect();
    th.cache.set_policy(Path::new("/scratch"), Some(false))?;
    let _ = th.fs.read(&req, Path::new("/scratch/junk.txt"), 0, 5)?;

    th.disconnect();
    assert!(th
        .fs
        .read(&req, Path::new("/scratch/junk.txt"), 0, 5)
        .is_err());
    Ok(())
}

#[test]
fn test_readdir_merges_cache_and_remote() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/remote-only.txt", b"r");
    th.connect();

    // a locally created file joins the listing
    th.fs.open(
        &req,
        Path::new("/local.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;

    let names: Vec<String> = th
        .fs
        .readdir(&req, Path::new("/"))?
        .into_iter()
        .map(|e| e.name)
        .collect();

    assert!(names.contains(&"remote-only.txt".to_string()), "{:?}", names);
    assert!(names.contains(&"local.txt".to_string()), "{:?}", names);
    Ok(())
}

#[test]
fn test_readdir_disconnected_hides_uncached() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/seen.txt", b"cached");
    th.write_remote_file("/unseen.txt", b"never cached");
    th.connect();

    // cache one of the two; the listing discovered records for both
    let _ = th.fs.read(&req, Path::new("/seen.txt"), 0, 6)?;
    let _ = th.fs.readdir(&req, Path::new("/"))?;

    th.disconnect();
    let names: Vec<String> = th
        .fs
        .readdir(&req, Path::new("/"))?
        .into_iter()
        .map(|e| e.name)
        .collect();

    assert!(names.contains(&"seen.txt".to_string()), "{:?}", names);
    assert!(!names.contains(&"unseen.txt".to_string()), "{:?}", names);
    Ok(())
}

#[test]
fn test_read_past_eof_returns_short() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/short.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/short.txt"), b"abc", 0)?;

    // never zero-filled past EOF
    let data = th.fs.read(&req, Path::new("/short.txt"), 0, 100)?;
    assert_eq!(data, b"abc".to_vec());
    let data = th.fs.read(&req, Path::new("/short.txt"), 3, 10)?;
    assert!(data.is_empty());
    Ok(())
}

#[test]
fn test_zero_byte_write_journals_nothing() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/empty-write.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    let written = th.fs.write(&req, Path::new("/empty-write.txt"), b"", 0)?;
    assert_eq!(written, 0);

    // no region, and in fact no change entry at all
    assert!(th.log.change_entry(Path::new("/empty-write.txt"))?.is_none());
    Ok(())
}

#[test]
fn test_truncate_to_current_size_is_a_noop_in_the_log() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/samesize.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/samesize.txt"), b"12345", 0)?;

    let before = th.log.dump()?;
    th.fs.truncate(&req, Path::new("/samesize.txt"), 5)?;
    let after = th.log.dump()?;

    assert_eq!(before, after);
    Ok(())
}

#[test]
fn test_sparse_write_reads_zeros_in_the_hole() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/sparse.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.write(&req, Path::new("/sparse.txt"), b"zz", 5)?;

    let data = th.fs.read(&req, Path::new("/sparse.txt"), 0, 7)?;
    assert_eq!(data, b"\x00\x00\x00\x00\x00zz".to_vec());

    // the journaled region carries exactly the written bytes
    let (_item, change) = th
        .log
        .change_entry(Path::new("/sparse.txt"))?
        .expect("change entry expected");
    let regions = change.unwrap().regions;
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (5, 7));
    assert_eq!(regions[0].bytes, b"zz".to_vec());
    Ok(())
}

#[test]
fn test_hardlinks_are_unsupported() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.connect();

    let err = th
        .fs
        .link(&req, Path::new("/a"), Path::new("/b"))
        .unwrap_err();
    assert_eq!(err.errno, nix::errno::Errno::EOPNOTSUPP);
    Ok(())
}

#[test]
fn test_access_denies_without_bits() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.open(
        &req,
        Path::new("/locked.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;
    th.fs.chmod(&req, Path::new("/locked.txt"), 0o000)?;

    // the owner lost every bit; only F_OK still passes
    assert!(th
        .fs
        .access(&req, Path::new("/locked.txt"), libc::F_OK)
        .is_ok());
    assert!(th
        .fs
        .access(&req, Path::new("/locked.txt"), libc::R_OK)
        .is_err());
    Ok(())
}

#[test]
fn test_rmdir_refuses_non_empty() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    th.disconnect();

    th.fs.mkdir(&req, Path::new("/full"), 0o755)?;
    th.fs.open(
        &req,
        Path::new("/full/kid.txt"),
        libc::O_CREAT | libc::O_WRONLY,
        Some(0o600),
    )?;

    let err = th.fs.rmdir(&req, Path::new("/full")).unwrap_err();
    assert_eq!(err.errno, nix::errno::Errno::ENOTEMPTY);
    Ok(())
}
