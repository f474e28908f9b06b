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

//! The cache policy: which paths should live in the on-disk cache.  Users pin
//! or ban prefixes through the `tetherfs.should-cache` xattr; everything else
//! inherits from the deepest listed ancestor and defaults to cached.

use crate::common::err::{TetherError, TetherResult};
use log::debug;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const TAG: &str = "cache_policy";

pub struct CachePolicy {
    spec: HashMap<PathBuf, bool>,
    spec_file: PathBuf,
}

impl CachePolicy {
    pub fn new(spec_file: PathBuf) -> Self {
        Self {
            spec: HashMap::new(),
            spec_file,
        }
    }

    /// Loads the policy file, one `path:bool` per line.  A missing file is an
    /// empty policy, not an error.
    pub fn load(&mut self) -> TetherResult<()> {
        let file = match std::fs::File::open(&self.spec_file) {
            Ok(f) => f,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    target: TAG,
                    "No cache spec at {}, starting empty",
                    self.spec_file.display()
                );
                return Ok(());
            }
            Err(e) => return Err(TetherError::from_io(&self.spec_file, e)),
        };

        self.spec.clear();
        for maybe_line in BufReader::new(file).lines() {
            let line = maybe_line.map_err(|e| TetherError::from_io(&self.spec_file, e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            // split on the last colon, paths can contain colons themselves
            let split_at = match trimmed.rfind(':') {
                Some(idx) => idx,
                None => continue,
            };
            let (path, flag) = trimmed.split_at(split_at);
            let cache = match &flag[1..] {
                "true" => true,
                "false" => false,
                _ => continue,
            };
            self.spec.insert(PathBuf::from(path), cache);
        }

        debug!(
            target: TAG,
            "Loaded {} cache policy entries from {}",
            self.spec.len(),
            self.spec_file.display()
        );
        Ok(())
    }

    pub fn save(&self) -> TetherResult<()> {
        let mut file = std::fs::File::create(&self.spec_file)
            .map_err(|e| TetherError::from_io(&self.spec_file, e))?;
        for (path, cache) in &self.spec {
            writeln!(file, "{}:{}", path.display(), cache)
                .map_err(|e| TetherError::from_io(&self.spec_file, e))?;
        }
        Ok(())
    }

    /// Pin (`true`) or ban (`false`) a prefix, persisting immediately
    pub fn set(&mut self, path: &Path, cache: bool) -> TetherResult<()> {
        self.spec.insert(path.to_owned(), cache);
        self.save()
    }

    /// Back to inheriting from the parent
    pub fn clear(&mut self, path: &Path) -> TetherResult<()> {
        self.spec.remove(path);
        self.save()
    }

    /// The explicitly configured policy for exactly `path`, if any
    pub fn explicit(&self, path: &Path) -> Option<bool> {
        self.spec.get(path).copied()
    }

    /// Whether `path` should be cached: the deepest listed ancestor wins,
    /// the root is always cached, unlisted paths default to cached
    pub fn should_cache(&self, path: &Path) -> bool {
        if path == Path::new("/") {
            return true;
        }

        let mut cursor = Some(path);
        while let Some(p) = cursor {
            if p == Path::new("/") {
                break;
            }
            if let Some(cache) = self.spec.get(p) {
                debug!(
                    target: TAG,
                    "caching of {} is {} because of policy on {}",
                    path.display(),
                    cache,
                    p.display()
                );
                return *cache;
            }
            cursor = p.parent();
        }

        debug!(target: TAG, "default caching policy on {}", path.display());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_policy() -> CachePolicy {
        CachePolicy::new(PathBuf::from("/nonexistent/cachespec"))
    }

    #[test]
    fn test_default_is_cached() {
        let policy = empty_policy();
        assert!(policy.should_cache(Path::new("/some/deep/path")));
    }

    #[test]
    fn test_root_always_cached() {
        let mut policy = empty_policy();
        policy.spec.insert(PathBuf::from("/"), false);
        assert!(policy.should_cache(Path::new("/")));
    }

    #[test]
    fn test_inheritance_from_deepest_ancestor() {
        let mut policy = empty_policy();
        policy.spec.insert(PathBuf::from("/media"), false);
        policy.spec.insert(PathBuf::from("/media/keep"), true);

        assert!(!policy.should_cache(Path::new("/media/movies/big.mkv")));
        assert!(policy.should_cache(Path::new("/media/keep/notes.txt")));
        assert!(policy.should_cache(Path::new("/docs/report.txt")));
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec_file = dir.path().join("cachespec");

        let mut policy = CachePolicy::new(spec_file.clone());
        policy.set(Path::new("/media"), false).unwrap();
        policy.set(Path::new("/media/keep"), true).unwrap();

        let mut reloaded = CachePolicy::new(spec_file);
        reloaded.load().unwrap();
        assert_eq!(reloaded.explicit(Path::new("/media")), Some(false));
        assert_eq!(reloaded.explicit(Path::new("/media/keep")), Some(true));
        assert_eq!(reloaded.explicit(Path::new("/other")), None);
    }
}
