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

//! The remote always wins.  These tests diverge the two sides and check that
//! the loser's changes land in a quarantine changeset, the cache refetches
//! the winner, and the changeset file itself eventually reaches the remote.

use crate::common::{TestHelper, TestResult};
use std::path::Path;
use tetherfs::fuse::Filesystem;

/// Remote and cache both start as "AAAAA"; we write "BB" offline while the
/// remote moves to "CCAAA" behind our back
fn diverge(th: &TestHelper) -> TestResult {
    let req = th.req();

    th.write_remote_file("/b.txt", b"AAAAA");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/b.txt"), 0, 5)?;
    assert!(th.cache.is_cached_to_disk(Path::new("/b.txt")));

    th.disconnect();
    th.fs.write(&req, Path::new("/b.txt"), b"BB", 0)?;
    assert_eq!(
        th.fs.read(&req, Path::new("/b.txt"), 0, 5)?,
        b"BBAAA".to_vec()
    );

    // meanwhile the remote changes and its revision advances
    th.write_remote_file("/b.txt", b"CCAAA");
    th.bump_remote_mtime("/b.txt", 100.0);
    Ok(())
}

#[test]
fn test_diverged_write_quarantines() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    diverge(&th)?;

    th.connect();
    th.drain();

    // the loser's bytes are preserved in the changeset
    let changeset = th
        .conflict_file_content("/b.txt")
        .expect("conflict file expected");
    assert!(
        changeset.contains("set.addChange(type_=\"patch\", start=0, end=2, data='BB')"),
        "changeset was: {}",
        changeset
    );
    assert!(changeset.contains("# New changeset at"));
    assert!(changeset.contains("changesets"));

    // the loser's cache copy is gone; the next read serves the winner
    let data = th.fs.read(&req, Path::new("/b.txt"), 0, 5)?;
    assert_eq!(data, b"CCAAA".to_vec());

    // the conflict file itself propagated to the remote and the log drained
    assert!(th.remote_exists("/.conflicts/-b.txt"));
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_stat_during_reconnect_triggers_quarantine() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    diverge(&th)?;

    th.connect();

    // a plain stat is enough: cached + dirty + remote changed means the
    // planner emits merge-conflict, use-remote
    let attr = th.fs.getattr(&req, Path::new("/b.txt"))?;
    assert_eq!(attr.size, 5);

    assert!(th.conflict_file_content("/b.txt").is_some());
    // the pending change entry is gone from the log
    assert!(th.log.change_entry(Path::new("/b.txt"))?.is_none());
    Ok(())
}

#[test]
fn test_second_conflict_appends_to_same_changeset() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();
    diverge(&th)?;

    th.connect();
    th.drain();

    // pull the winner back into the cache, then diverge again
    let _ = th.fs.read(&req, Path::new("/b.txt"), 0, 5)?;
    th.disconnect();
    th.fs.write(&req, Path::new("/b.txt"), b"DD", 0)?;
    th.write_remote_file("/b.txt", b"EEAAA");
    th.bump_remote_mtime("/b.txt", 200.0);

    th.connect();
    th.drain();

    let changeset = th.conflict_file_content("/b.txt").expect("conflict file");
    let headers = changeset.matches("# New changeset at").count();
    assert_eq!(headers, 2, "changeset was: {}", changeset);
    assert!(changeset.contains("data='BB'"));
    assert!(changeset.contains("data='DD'"));
    Ok(())
}

#[test]
fn test_conflict_detected_when_size_and_mtime_are_unchanged() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/sneaky.txt", b"AAAAA");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/sneaky.txt"), 0, 5)?;
    let original_mtime = th.remote_mtime("/sneaky.txt");

    th.disconnect();
    th.fs.write(&req, Path::new("/sneaky.txt"), b"BB", 0)?;

    // the remote changes to content of the same length, and its mtime is
    // put back exactly where it was.  size and mtime now say nothing
    // happened; only reading the bytes back can tell
    th.write_remote_file("/sneaky.txt", b"CCAAA");
    th.set_remote_mtime("/sneaky.txt", original_mtime);

    th.connect();
    th.drain();

    // the probe still caught it: our bytes went to quarantine and the
    // remote's content survived untouched
    let changeset = th
        .conflict_file_content("/sneaky.txt")
        .expect("conflict file expected");
    assert!(changeset.contains("data='BB'"), "changeset was: {}", changeset);
    assert_eq!(th.read_remote_file("/sneaky.txt"), b"CCAAA".to_vec());
    assert!(!th.cache.is_cached_to_disk(Path::new("/sneaky.txt")));
    Ok(())
}

#[test]
fn test_file_type_change_conflicts() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/shape.txt", b"file");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/shape.txt"), 0, 4)?;

    th.disconnect();
    th.fs.write(&req, Path::new("/shape.txt"), b"FILE", 0)?;

    // the remote replaces the file with a directory of the same name
    std::fs::remove_file(th.remote_path("/shape.txt"))?;
    std::fs::create_dir(th.remote_path("/shape.txt"))?;

    th.connect();
    th.drain();

    assert!(th.conflict_file_content("/shape.txt").is_some());
    assert!(!th.cache.is_cached_to_disk(Path::new("/shape.txt")));
    Ok(())
}

#[test]
fn test_remote_deletion_conflicts_local_change() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/gone.txt", b"here");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/gone.txt"), 0, 4)?;

    th.disconnect();
    th.fs.write(&req, Path::new("/gone.txt"), b"HERE", 0)?;

    std::fs::remove_file(th.remote_path("/gone.txt"))?;

    th.connect();
    th.drain();

    // our bytes were preserved before the cache copy went away
    let changeset = th.conflict_file_content("/gone.txt").expect("conflict file");
    assert!(changeset.contains("data='HERE'"));
    assert!(th.log.change_entry(Path::new("/gone.txt"))?.is_none());
    Ok(())
}
