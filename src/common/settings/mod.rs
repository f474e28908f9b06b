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

use super::constants;
use log::debug;
use parking_lot::RwLock;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod config;
pub mod dirs;

const TAG: &str = "settings";

/// Settings is the interface to everything configurable.  It combines the merged
/// `Config` (defaults + config file + cli + environment) with the platform
/// `Dirs`, and knows where every runtime file of the overlay lives.
pub struct Settings {
    config: RwLock<Option<config::Config>>,
    merged_config: ::config::Config,
    project_dirs: Arc<dyn dirs::Dirs>,
}

#[must_use]
fn ensure_dir(path: impl AsRef<Path>) -> std::io::Result<()> {
    debug!(
        target: TAG,
        "Ensuring dir {} exists",
        path.as_ref().display()
    );
    if !path.as_ref().exists() {
        debug!(
            target: TAG,
            "Dir {} doesn't exist, creating",
            path.as_ref().display()
        );
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[must_use]
fn ensure_file(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> std::io::Result<()> {
    debug!(
        target: TAG,
        "Ensuring file {} exists",
        path.as_ref().display()
    );
    if !path.as_ref().exists() {
        debug!(
            target: TAG,
            "File {} doesn't exist, creating",
            path.as_ref().display()
        );
        let mut f = std::fs::File::create(&path)?;
        f.write_all(contents.as_ref())?;
    }
    Ok(())
}

impl Settings {
    pub fn new(project_dirs: Arc<dyn dirs::Dirs>) -> Result<Self, Box<dyn std::error::Error>> {
        let settings = Settings {
            config: Default::default(),
            merged_config: Default::default(),
            project_dirs,
        };
        settings.ensure_config_files()?;
        Ok(settings)
    }

    fn ensure_config_files(&self) -> std::io::Result<()> {
        ensure_dir(self.config_dir())?;
        ensure_dir(self.project_dirs.data_dir())?;
        ensure_dir(self.project_dirs.data_local_dir())?;
        ensure_file(self.base_config_file(), constants::DEFAULT_CONFIG_TOML)?;
        Ok(())
    }

    /// Creates the directories the mount daemon needs at runtime.  Called
    /// once the config has been frozen, since the cache root is configurable.
    pub fn ensure_runtime_dirs(&self) -> std::io::Result<()> {
        let conf = self.get_config();
        ensure_dir(&conf.cache.base_dir)?;
        ensure_dir(&conf.cache.spec_dir)?;
        if let Some(parent) = conf.metadata.path.parent() {
            ensure_dir(parent)?;
        }
        ensure_dir(self.log_dir())?;
        Ok(())
    }

    pub fn update_config<T>(&mut self, merged_config: T)
    where
        T: ::config::Source + Send + Sync + 'static,
    {
        let mut guard = self.config.write();
        self.merged_config
            .merge(merged_config)
            .expect("Couldn't merge in new config");
        let frozen = self.merged_config.clone().try_into().unwrap();
        *guard = Some(frozen);
    }

    pub fn get_config(&self) -> config::Config {
        let guard = self.config.read();
        guard.as_ref().expect("Config not set!").clone()
    }

    pub fn config_dir(&self) -> &Path {
        self.project_dirs.config_dir()
    }

    pub fn base_config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    /// Root of the on-disk cache tree that mirrors the mount
    pub fn cache_dir(&self) -> PathBuf {
        self.get_config().cache.base_dir
    }

    /// The cache policy file, `path:bool` lines
    pub fn cache_spec_file(&self) -> PathBuf {
        self.get_config()
            .cache
            .spec_dir
            .join(constants::CACHE_SPEC_FILE_NAME)
    }

    pub fn db_file(&self) -> PathBuf {
        self.get_config().metadata.path
    }

    /// Overlay-relative path of the conflict quarantine directory
    pub fn conflict_dir(&self) -> PathBuf {
        self.get_config().conflict.dir
    }

    /// Where the remote backend gets mounted.  Private to the daemon; users
    /// only ever see the overlay mountpoint.
    pub fn remote_mount_dir(&self) -> PathBuf {
        self.project_dirs.data_local_dir().join("remote")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.project_dirs.data_local_dir().join("logs")
    }

    pub fn notify_socket_file(&self) -> PathBuf {
        self.project_dirs.data_local_dir().join("notify.sock")
    }
}
