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
fn test_rename_of_remote_file_propagates() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/old-name.txt", b"payload");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/old-name.txt"), 0, 7)?;

    th.disconnect();
    th.fs
        .rename(&req, Path::new("/old-name.txt"), Path::new("/new-name.txt"))?;

    // the record moved with the file, and reads follow the new name
    assert_eq!(
        th.fs.read(&req, Path::new("/new-name.txt"), 0, 7)?,
        b"payload".to_vec()
    );
    assert!(th.fs.getattr(&req, Path::new("/old-name.txt")).is_err());
    assert!(th.log.dump()?.contains("rename"));

    th.connect();
    th.drain();

    assert!(th.remote_exists("/new-name.txt"));
    assert!(!th.remote_exists("/old-name.txt"));
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_dir_rename_with_dirty_child() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/dir/a", b"aaaa");
    th.write_remote_file("/dir/b", b"bbbb");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/dir/a"), 0, 4)?;
    let _ = th.fs.read(&req, Path::new("/dir/b"), 0, 4)?;

    th.disconnect();
    // /dir/a picks up a pending change, then the whole directory moves
    th.fs.write(&req, Path::new("/dir/a"), b"XX", 0)?;
    th.fs.rename(&req, Path::new("/dir"), Path::new("/dir2"))?;

    // the journaled child change follows the directory
    assert!(th.log.change_entry(Path::new("/dir2/a"))?.is_some());
    assert!(th.log.change_entry(Path::new("/dir/a"))?.is_none());

    // and it drains after the rename, so the replay targets the new path
    let dump = th.log.dump()?;
    let rename_line = dump.lines().position(|l| l.contains("rename"));
    let change_line = dump.lines().position(|l| l.contains("/dir2/a"));
    assert!(
        rename_line.unwrap() < change_line.unwrap(),
        "log was: {}",
        dump
    );

    th.connect();
    th.drain();

    assert_eq!(th.read_remote_file("/dir2/a"), b"XXaa".to_vec());
    assert_eq!(th.read_remote_file("/dir2/b"), b"bbbb".to_vec());
    assert!(!th.remote_exists("/dir"));
    assert!(th.log.is_empty()?);
    Ok(())
}

#[test]
fn test_rename_updates_descendant_records() -> TestResult {
    let th = TestHelper::new();
    let req = th.req();

    th.write_remote_file("/tree/leaf.txt", b"leaf");
    th.connect();
    let _ = th.fs.read(&req, Path::new("/tree/leaf.txt"), 0, 4)?;

    th.disconnect();
    th.fs.rename(&req, Path::new("/tree"), Path::new("/forest"))?;

    assert!(th.meta.try_get(Path::new("/forest/leaf.txt"))?.is_some());
    assert!(th.meta.try_get(Path::new("/tree/leaf.txt"))?.is_none());

    // the cache tree moved as one piece
    assert!(th.cache.is_cached_to_disk(Path::new("/forest/leaf.txt")));
    assert!(!th.cache.is_cached_to_disk(Path::new("/tree/leaf.txt")));
    Ok(())
}
