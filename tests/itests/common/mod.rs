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

#![allow(dead_code)]

use libc::{gid_t, mode_t, uid_t};
use parking_lot::Mutex;
use std::error::Error;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tetherfs::cache::lockpool::PathLocks;
use tetherfs::cache::store::CacheStore;
use tetherfs::cache::CacheManager;
use tetherfs::common::err::{TetherError, TetherResult};
use tetherfs::common::notify::uds::UDSNotifier;
use tetherfs::common::settings::config as tether_config;
use tetherfs::common::settings::dirs::Dirs;
use tetherfs::common::settings::Settings;
use tetherfs::common::types::{DirEntry, FileAttr};
use tetherfs::fuse::fs::{OverlayContext, OverlayFilesystem};
use tetherfs::fuse::Request;
use tetherfs::meta::MetaStore;
use tetherfs::remote::fs::FsRemote;
use tetherfs::remote::{Remote, RemoteHandle};
use tetherfs::sync::state::OverlayState;
use tetherfs::sync::SyncWorker;
use tetherfs::synclog::SyncLog;

pub type TestResult = Result<(), Box<dyn Error>>;

/// Platform dirs all pointed into one tempdir
pub struct TestDirectories {
    project: PathBuf,
    cache: PathBuf,
    config: PathBuf,
    data: PathBuf,
    data_local: PathBuf,
}

impl TestDirectories {
    pub fn new(base: &Path) -> Self {
        Self {
            project: base.to_owned(),
            cache: base.join("cache-root"),
            config: base.join("config"),
            data: base.join("data"),
            data_local: base.join("data-local"),
        }
    }
}

impl Dirs for TestDirectories {
    fn project_path(&self) -> &Path {
        &self.project
    }
    fn cache_dir(&self) -> &Path {
        &self.cache
    }
    fn config_dir(&self) -> &Path {
        &self.config
    }
    fn data_dir(&self) -> &Path {
        &self.data
    }
    fn data_local_dir(&self) -> &Path {
        &self.data_local
    }
}

/// A remote whose server can be switched off.  Filesystem operations hit a
/// plain directory through the real mounted-tree backend; liveness is a flag,
/// and operations against a downed server fail the way a dead network mount
/// does.
pub struct TestRemote {
    inner: FsRemote,
    up: AtomicBool,
}

impl TestRemote {
    pub fn new(inner: FsRemote) -> Self {
        Self {
            inner,
            up: AtomicBool::new(false),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    fn check(&self) -> TetherResult<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TetherError::IoTransient("remote server is down".into()))
        }
    }
}

impl Remote for TestRemote {
    fn ping(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn mount(&self) -> TetherResult<()> {
        self.check()
    }

    fn unmount(&self) -> TetherResult<()> {
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn open(&self, path: &Path, flags: i32) -> TetherResult<RemoteHandle> {
        self.check()?;
        self.inner.open(path, flags)
    }

    fn read(&self, handle: &mut RemoteHandle, offset: u64, size: usize) -> TetherResult<Vec<u8>> {
        self.check()?;
        self.inner.read(handle, offset, size)
    }

    fn write(&self, handle: &mut RemoteHandle, offset: u64, data: &[u8]) -> TetherResult<usize> {
        self.check()?;
        self.inner.write(handle, offset, data)
    }

    fn close(&self, handle: RemoteHandle) -> TetherResult<()> {
        self.inner.close(handle)
    }

    fn read_region(&self, path: &Path, start: u64, end: u64) -> TetherResult<Vec<u8>> {
        self.check()?;
        self.inner.read_region(path, start, end)
    }

    fn write_region(&self, path: &Path, start: u64, data: &[u8]) -> TetherResult<()> {
        self.check()?;
        self.inner.write_region(path, start, data)
    }

    fn copy_from(
        &self,
        path: &Path,
        src: &mut dyn std::io::Read,
        mode: mode_t,
    ) -> TetherResult<u64> {
        self.check()?;
        self.inner.copy_from(path, src, mode)
    }

    fn copy_to(&self, path: &Path, dst: &mut dyn std::io::Write) -> TetherResult<u64> {
        self.check()?;
        self.inner.copy_to(path, dst)
    }

    fn truncate(&self, path: &Path, size: u64) -> TetherResult<()> {
        self.check()?;
        self.inner.truncate(path, size)
    }

    fn lstat(&self, path: &Path) -> TetherResult<FileAttr> {
        self.check()?;
        self.inner.lstat(path)
    }

    fn readdir(&self, path: &Path) -> TetherResult<Vec<DirEntry>> {
        self.check()?;
        self.inner.readdir(path)
    }

    fn mkdir(&self, path: &Path, mode: mode_t) -> TetherResult<()> {
        self.check()?;
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&self, path: &Path) -> TetherResult<()> {
        self.check()?;
        self.inner.rmdir(path)
    }

    fn unlink(&self, path: &Path) -> TetherResult<()> {
        self.check()?;
        self.inner.unlink(path)
    }

    fn symlink(&self, target: &Path, link: &Path) -> TetherResult<()> {
        self.check()?;
        self.inner.symlink(target, link)
    }

    fn readlink(&self, path: &Path) -> TetherResult<PathBuf> {
        self.check()?;
        self.inner.readlink(path)
    }

    fn rename(&self, old: &Path, new: &Path) -> TetherResult<()> {
        self.check()?;
        self.inner.rename(old, new)
    }

    fn chmod(&self, path: &Path, mode: mode_t) -> TetherResult<()> {
        self.check()?;
        self.inner.chmod(path, mode)
    }

    fn chown(&self, path: &Path, uid: uid_t, gid: gid_t) -> TetherResult<()> {
        self.check()?;
        self.inner.chown(path, uid, gid)
    }

    fn utime(&self, path: &Path, atime: f64, mtime: f64) -> TetherResult<()> {
        self.check()?;
        self.inner.utime(path, atime, mtime)
    }

    fn getxattr(&self, path: &Path, name: &str) -> TetherResult<Vec<u8>> {
        self.check()?;
        self.inner.getxattr(path, name)
    }

    fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> TetherResult<()> {
        self.check()?;
        self.inner.setxattr(path, name, value)
    }

    fn listxattr(&self, path: &Path) -> TetherResult<Vec<String>> {
        self.check()?;
        self.inner.listxattr(path)
    }

    fn removexattr(&self, path: &Path, name: &str) -> TetherResult<()> {
        self.check()?;
        self.inner.removexattr(path, name)
    }
}

/// The whole overlay wired up against a tempdir, plus a hand on every knob a
/// test could want to turn
pub struct TestHelper {
    pub td: tempfile::TempDir,
    pub settings: Arc<Settings>,
    pub meta: Arc<MetaStore>,
    pub log: Arc<SyncLog>,
    pub cache: Arc<CacheManager>,
    pub store: Arc<CacheStore>,
    pub remote: Arc<TestRemote>,
    pub state: Arc<OverlayState>,
    pub locks: Arc<PathLocks>,
    pub fs: OverlayFilesystem<UDSNotifier>,
    pub worker: SyncWorker<UDSNotifier>,
    remote_root: PathBuf,
}

impl TestHelper {
    pub fn new() -> Self {
        let td = tempfile::tempdir().expect("Couldn't create tempdir");
        let dirs = Arc::new(TestDirectories::new(td.path()));

        let mut settings = Settings::new(dirs.clone()).expect("Couldn't build settings");
        let conf = tether_config::build(vec![], &*dirs);
        settings.update_config(conf);
        let settings = Arc::new(settings);
        settings
            .ensure_runtime_dirs()
            .expect("Couldn't create runtime dirs");

        let remote_root = td.path().join("remote");
        std::fs::create_dir_all(&remote_root).expect("Couldn't create remote root");

        let state = Arc::new(OverlayState::new(false, false));
        let locks = Arc::new(PathLocks::new());

        let meta = Arc::new(MetaStore::new(&settings.db_file()).expect("Couldn't open meta store"));
        let log = Arc::new(SyncLog::new(
            meta.pool(),
            Arc::clone(&state),
            Arc::clone(&locks),
        ));
        let store =
            Arc::new(CacheStore::new(settings.cache_dir()).expect("Couldn't create cache store"));

        let remote_conf = settings.get_config().remote;
        let remote = Arc::new(TestRemote::new(FsRemote::new(
            remote_conf,
            remote_root.clone(),
        )));
        let remote_dyn: Arc<dyn Remote> = remote.clone();

        let cache = Arc::new(
            CacheManager::new(
                Arc::clone(&settings),
                Arc::clone(&meta),
                Arc::clone(&store),
                Arc::clone(&remote_dyn),
                Arc::clone(&log),
                Arc::clone(&locks),
                Arc::clone(&state),
            )
            .expect("Couldn't build cache manager"),
        );

        let notifier = Arc::new(Mutex::new(
            UDSNotifier::new(settings.notify_socket_file(), true)
                .expect("Couldn't bind notifier socket"),
        ));

        let ctx = Arc::new(OverlayContext {
            settings: Arc::clone(&settings),
            meta: Arc::clone(&meta),
            log: Arc::clone(&log),
            cache: Arc::clone(&cache),
            remote: Arc::clone(&remote_dyn),
            state: Arc::clone(&state),
        });

        let fs = OverlayFilesystem::new(Arc::clone(&ctx), Arc::clone(&notifier));

        let worker = SyncWorker::new(
            Arc::clone(&cache),
            Arc::clone(&log),
            Arc::clone(&meta),
            Arc::clone(&remote_dyn),
            Arc::clone(&state),
            Arc::clone(&notifier),
        );

        Self {
            td,
            settings,
            meta,
            log,
            cache,
            store,
            remote,
            state,
            locks,
            fs,
            worker,
            remote_root,
        }
    }

    pub fn req(&self) -> Request {
        Request {
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            pid: 0,
            umask: 0o022,
        }
    }

    pub fn connect(&self) {
        self.remote.set_up(true);
        self.state.set_available(true);
    }

    pub fn disconnect(&self) {
        self.remote.set_up(false);
        self.state.set_available(false);
    }

    /// One synchronous pass of the reconciler
    pub fn drain(&self) {
        self.worker.drain();
    }

    pub fn remote_path(&self, path: &str) -> PathBuf {
        self.remote_root.join(path.trim_start_matches('/'))
    }

    pub fn write_remote_file(&self, path: &str, content: &[u8]) {
        let full = self.remote_path(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, content).unwrap();
    }

    pub fn read_remote_file(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.remote_path(path)).unwrap()
    }

    pub fn remote_exists(&self, path: &str) -> bool {
        self.remote_path(path).symlink_metadata().is_ok()
    }

    pub fn remote_mode(&self, path: &str) -> mode_t {
        (self.remote_path(path)
            .symlink_metadata()
            .unwrap()
            .permissions()
            .mode()
            & 0o7777) as mode_t
    }

    /// Pushes the remote copy's mtime into the future, making its
    /// synthesized revision advance past whatever the cache recorded
    pub fn bump_remote_mtime(&self, path: &str, ahead_secs: f64) {
        let future = tetherfs::meta::get_now_secs() + ahead_secs;
        tetherfs::fuse::util::utimes(&self.remote_path(path), future, future).unwrap();
    }

    /// The remote copy's mtime as float epoch seconds
    pub fn remote_mtime(&self, path: &str) -> f64 {
        self.remote_path(path)
            .symlink_metadata()
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
    }

    /// Restores the remote copy's mtime to an exact earlier value, hiding a
    /// content change from anything that only looks at size and mtime
    pub fn set_remote_mtime(&self, path: &str, mtime: f64) {
        tetherfs::fuse::util::utimes(&self.remote_path(path), mtime, mtime).unwrap();
    }

    /// The changeset file a conflicted path quarantines into, if it exists
    pub fn conflict_file_content(&self, loser: &str) -> Option<String> {
        let name = loser.replace('/', "-");
        let overlay_path = self.settings.conflict_dir().join(name);
        let cache_path = self.store.cache_path_of(&overlay_path);
        std::fs::read_to_string(cache_path).ok()
    }
}
