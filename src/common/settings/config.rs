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
use crate::common::constants;
use crate::common::types::file_perms::{Permissions, UMask};
use ::config::{ConfigError, Source, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct HashMapSource(pub HashMap<String, config::Value>);

impl config::Source for HashMapSource {
    fn clone_into_box(&self) -> Box<dyn Source + Send + std::marker::Sync> {
        Box::new((*self).clone())
    }

    fn collect(&self) -> Result<HashMap<String, Value>, ConfigError> {
        Ok(self.0.clone())
    }
}

/// Which protocol the remote speaks.  This only ever changes the mount
/// command line and the liveness probe; every backend is accessed through
/// its local mount point once it's up.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Nfs,
    Samba,
    Sshfs,
    Webdav,
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteType::Nfs => "nfs",
            RemoteType::Samba => "samba",
            RemoteType::Sshfs => "sshfs",
            RemoteType::Webdav => "webdav",
        };
        write!(f, "{}", name)
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Remote {
    #[serde(rename = "type")]
    pub kind: RemoteType,
    /// Backend-specific URI, e.g. `fileserver:/export/home` for nfs
    pub source: String,
    /// Verbatim option string handed to the mount command
    pub options: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Cache {
    /// Root of the mirrored cache tree
    pub base_dir: PathBuf,
    /// Where the cache policy file lives
    pub spec_dir: PathBuf,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Metadata {
    /// The single sqlite file holding file records, revisions and the sync log
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Conflict {
    /// Overlay-relative directory quarantined changesets land in
    pub dir: PathBuf,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Sync {
    /// Metadata flush interval in seconds
    pub checkpoint_s: u64,
    /// Start with syncing paused
    pub pause: bool,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Perms {
    pub default_mode_mask: UMask,
    pub default_cache_mode: Permissions,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    pub remote: Remote,
    pub cache: Cache,
    pub metadata: Metadata,
    pub conflict: Conflict,
    pub sync: Sync,
    pub perms: Perms,
    pub force_disconnect: bool,
}

/// Builds a merged config based off of our default toml, environment variables, and the
/// provided sources (config file, then cli overrides), in that precedence order
pub fn build(
    sources: Vec<Box<dyn config::Source + Send + std::marker::Sync>>,
    project_dirs: &dyn super::dirs::Dirs,
) -> ::config::Config {
    let mut merged_config = config::Config::new();

    merged_config
        .merge(config::File::from_str(
            constants::DEFAULT_CONFIG_TOML,
            config::FileFormat::Toml,
        ))
        .expect("Unable to merge default config")
        .merge(sources)
        .expect("Unable to merge app config")
        .merge(config::Environment::with_prefix(constants::ENV_PREFIX))
        .expect("Unable to merge settings from environment variables")
        .set_default(
            "cache.base_dir",
            project_dirs
                .cache_dir()
                .join(constants::CACHE_DIR_NAME)
                .to_str()
                .expect("Unable to determine platform cache dir"),
        )
        .expect("Couldn't set default for cache.base_dir")
        .set_default(
            "cache.spec_dir",
            project_dirs
                .data_dir()
                .to_str()
                .expect("Unable to determine platform data dir"),
        )
        .expect("Couldn't set default for cache.spec_dir")
        .set_default(
            "metadata.path",
            project_dirs
                .data_dir()
                .join(constants::DB_FILE_NAME)
                .to_str()
                .expect("Unable to determine platform data dir"),
        )
        .expect("Couldn't set default for metadata.path");

    merged_config
}
