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
use tetherfs::common::types::FileType;
use tetherfs::meta::types::{ChangeKind, DataRegion};
use tetherfs::synclog::{region, MetaChanges, SyncLog};

/// A region over a span that previously held zeros, the way a write into a
/// hole or past EOF journals it
fn reg(start: u64, bytes: &[u8]) -> DataRegion {
    region::new_region(
        start,
        start + bytes.len() as u64,
        bytes.to_vec(),
        vec![0u8; bytes.len()],
    )
    .unwrap()
}

#[test]
fn test_new_then_unlink_leaves_empty_log() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/brand-new.txt");

    th.log.append_new(p, FileType::Regular, None)?;
    assert!(th.log.is_new(p)?);

    th.log.append_unlink(p, FileType::Regular)?;

    assert!(th.log.is_empty()?);
    assert!(!th.log.is_dirty(p)?);
    Ok(())
}

#[test]
fn test_new_change_rename_unlink_leaves_empty_log() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/p");
    let q = Path::new("/q");

    th.log.append_new(p, FileType::Regular, None)?;
    th.log
        .append_change(p, reg(0, b"Z"))?;
    th.log.append_rename(p, q, false)?;
    th.log.append_unlink(q, FileType::Regular)?;

    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_rename_of_new_file_rewrites_history() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/x");
    let q = Path::new("/y");

    th.log.append_new(p, FileType::Regular, None)?;
    th.log
        .append_change(p, reg(0, b"Z"))?;
    th.log.append_rename(p, q, false)?;

    // no rename entry; the new and the change just moved to the new name
    assert!(th.log.is_new(q)?);
    assert!(!th.log.is_dirty(p)?);
    let (_item, change) = th.log.change_entry(q)?.expect("no change entry for /y");
    assert_eq!(change.unwrap().regions[0].bytes, b"Z".to_vec());

    let dump = th.log.dump()?;
    assert!(!dump.contains("rename"), "unexpected rename in: {}", dump);
    Ok(())
}

#[test]
fn test_rename_of_existing_file_appends_entry() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/remote-born.txt");
    let q = Path::new("/moved.txt");

    th.log.append_rename(p, q, false)?;

    assert!(th.log.is_dirty(p)?);
    assert!(th.log.is_dirty(q)?);
    assert!(th.log.dump()?.contains("rename"));
    Ok(())
}

#[test]
fn test_unlink_follows_renames_back() -> TestResult {
    let th = TestHelper::new();
    let orig = Path::new("/original.txt");
    let moved = Path::new("/moved.txt");

    // the file predates the log (no `new`), gets renamed, then deleted
    th.log.append_rename(orig, moved, false)?;
    th.log
        .append_change(moved, reg(0, b"hi"))?;
    th.log.append_unlink(moved, FileType::Regular)?;

    // all that survives is one unlink, naming the file as the remote knows it
    let dump = th.log.dump()?;
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 1, "log was: {}", dump);
    assert!(lines[0].contains("unlink"));
    assert!(lines[0].contains("/original.txt"));
    Ok(())
}

#[test]
fn test_duplicate_new_rejected() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/dup");

    th.log.append_new(p, FileType::Regular, None)?;
    assert!(th.log.append_new(p, FileType::Regular, None).is_err());
    Ok(())
}

#[test]
fn test_regions_fuse_in_the_stored_change() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/fused.txt");

    th.log
        .append_change(p, reg(0, b"aaaa"))?;
    th.log
        .append_change(p, reg(4, b"bbbb"))?;
    th.log
        .append_change(p, reg(2, b"XXXX"))?;

    let (_item, change) = th.log.change_entry(p)?.expect("no change entry");
    let regions = change.unwrap().regions;
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].start, 0);
    assert_eq!(regions[0].end, 8);
    assert_eq!(regions[0].bytes, b"aaXXXXbb".to_vec());
    Ok(())
}

#[test]
fn test_metadata_changes_merge_into_one_entry() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/meta.txt");

    th.log.append_metadata_change(
        p,
        &MetaChanges {
            mode: true,
            ..Default::default()
        },
    )?;
    th.log.append_metadata_change(
        p,
        &MetaChanges {
            uid: true,
            gid: true,
            xattrs: vec!["user.color".to_string()],
            ..Default::default()
        },
    )?;

    let (_item, change) = th.log.change_entry(p)?.expect("no change entry");
    let change = change.unwrap();
    assert!(change.mode_changed);
    assert!(change.uid_changed);
    assert!(change.gid_changed);
    assert!(!change.times_changed);
    assert_eq!(change.xattrs_changed, vec!["user.color".to_string()]);

    // still exactly one entry
    assert_eq!(th.log.len()?, 1);
    Ok(())
}

#[test]
fn test_truncate_clips_pending_regions() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/clipped.txt");

    th.log
        .append_change(p, reg(0, b"aaaa"))?;
    th.log
        .append_change(p, reg(10, b"bbbb"))?;

    th.log.truncate_changes(p, 2)?;

    let (_item, change) = th.log.change_entry(p)?.expect("no change entry");
    let regions = change.unwrap().regions;
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].end, 2);
    assert_eq!(regions[0].bytes, b"aa".to_vec());
    Ok(())
}

#[test]
fn test_dirty_predicates() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/dir/file.txt");

    assert!(!th.log.is_dirty(p)?);

    th.log
        .append_change(p, reg(0, b"x"))?;

    assert!(th.log.is_dirty(p)?);
    assert!(!th.log.is_new(p)?);
    assert!(th.log.is_dirty_recursive(Path::new("/dir"))?);
    assert!(!th.log.is_dirty(Path::new("/dir"))?);
    Ok(())
}

#[test]
fn test_unlinked_set() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/doomed.txt");

    th.log.append_unlink(p, FileType::Regular)?;
    assert!(th.log.is_unlinked(p)?);

    // a later recreation takes it back out of the unlinked set
    th.log.append_new(p, FileType::Regular, None)?;
    assert!(!th.log.is_unlinked(p)?);
    Ok(())
}

#[test]
fn test_random_write_sequences_match_sequential_apply() -> TestResult {
    use rand::Rng;
    let th = TestHelper::new();
    let mut rng = rand::thread_rng();

    for round in 0..20 {
        let p = std::path::PathBuf::from(format!("/rand-{}", round));
        let mut expected: Vec<u8> = Vec::new();

        for _ in 0..8 {
            let start = rng.gen_range(0, 64) as u64;
            let len = rng.gen_range(1, 16) as usize;
            let fill: u8 = rng.gen();
            let bytes = vec![fill; len];
            let end = start + len as u64;

            if expected.len() < end as usize {
                expected.resize(end as usize, 0);
            }
            expected[start as usize..end as usize].copy_from_slice(&bytes);

            th.log
                .append_change(&p, reg(start, &bytes))?;
        }

        let (_item, change) = th.log.change_entry(&p)?.expect("change entry expected");
        let regions = change.unwrap().regions;

        // the stored set is always normalized
        for pair in regions.windows(2) {
            assert!(pair[0].end < pair[1].start, "{:?}", regions);
        }

        // and reads back byte-identical to replaying the writes in order
        assert_eq!(region::apply(&[], &regions), expected);
    }
    Ok(())
}

#[test]
fn test_pop_resumes_from_checkpoint_after_restart() -> TestResult {
    let th = TestHelper::new();

    for name in &["/one", "/two", "/three"] {
        th.log
            .append_new(Path::new(name), FileType::Regular, None)?;
    }

    // consume the first entry and checkpoint it away
    {
        let mut iter = th.log.pop_changes()?;
        let (first, _change) = iter.next().expect("log should have entries");
        assert_eq!(first.path, Path::new("/one"));
        assert_eq!(first.kind, ChangeKind::New);
        th.log.finish(&first, true)?;
    }

    // a fresh consumer over the same database picks up where the last one
    // left off
    let recovered = SyncLog::new(
        th.meta.pool(),
        std::sync::Arc::clone(&th.state),
        std::sync::Arc::clone(&th.locks),
    );
    let mut iter = recovered.pop_changes()?;

    let (second, _c) = iter.next().expect("second entry expected");
    assert_eq!(second.path, Path::new("/two"));
    recovered.finish(&second, true)?;

    let (third, _c) = iter.next().expect("third entry expected");
    assert_eq!(third.path, Path::new("/three"));
    recovered.finish(&third, true)?;

    assert!(recovered.is_empty()?);
    Ok(())
}

#[test]
fn test_finish_without_remove_keeps_entry() -> TestResult {
    let th = TestHelper::new();
    let p = Path::new("/kept");

    th.log.append_new(p, FileType::Regular, None)?;

    {
        let mut iter = th.log.pop_changes()?;
        let (item, _change) = iter.next().expect("entry expected");
        th.log.finish(&item, false)?;
    }

    // the entry survived, and a restarted consumer sees it again
    assert_eq!(th.log.len()?, 1);
    let mut iter = th.log.pop_changes()?;
    let (again, _change) = iter.next().expect("entry expected again");
    assert_eq!(again.path, p);
    th.log.finish(&again, true)?;
    Ok(())
}
