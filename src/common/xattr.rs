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

use log::debug;
use std::collections::HashMap;
use std::path::Path;

/// Reads every xattr present on `path`.  Missing values (racing removal) are
/// skipped rather than failing the whole read.
pub fn read_all<P: AsRef<Path>>(path: P) -> std::io::Result<HashMap<String, Vec<u8>>> {
    let mut xattr_map = HashMap::new();

    for xa in xattr::list(&path)? {
        if let Some(val) = xattr::get(path.as_ref(), &xa)? {
            debug!("got xattr {:?} with values {:?}", xa, val);
            xattr_map.insert(xa.to_string_lossy().into_owned(), val);
        }
    }

    Ok(xattr_map)
}

/// Copies every xattr on `from` over to `to`.  Used when a file is pulled
/// into the cache, so the cached copy carries the remote's attributes.
pub fn copy_all<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> std::io::Result<()> {
    for (k, v) in read_all(&from)? {
        debug!("setting xattr {:?} with values {:?}", k, v);
        xattr::set(&to, &k, v.as_slice())?;
    }
    Ok(())
}

/// Renames a file and preserves xattrs
pub fn rename<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> std::io::Result<()> {
    debug!(
        "Renaming {} to {} while preserving xattrs",
        from.as_ref().display(),
        to.as_ref().display()
    );
    let saved = read_all(&from)?;

    std::fs::rename(&from, &to)?;

    for (k, v) in saved {
        xattr::set(&to, &k, v.as_slice())?;
    }

    Ok(())
}
