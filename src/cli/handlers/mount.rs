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

use super::TAG;
use crate::cache::lockpool::PathLocks;
use crate::cache::store::CacheStore;
use crate::cache::CacheManager;
use crate::common::notify::uds::UDSNotifier;
use crate::common::notify::Notifier;
use crate::common::settings::Settings;
use crate::fuse::fs::{OverlayContext, OverlayFilesystem};
use crate::meta::MetaStore;
use crate::remote::fs::FsRemote;
use crate::remote::Remote;
use crate::sync::availability::AvailabilityWorker;
use crate::sync::state::OverlayState;
use crate::sync::SyncWorker;
use crate::synclog::SyncLog;
use clap::ArgMatches;
use log::{debug, info};
use nix::unistd::{fork, ForkResult};
use parking_lot::Mutex;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

pub fn handle(args: &ArgMatches, settings: Settings) -> Result<(), Box<dyn Error>> {
    info!(target: TAG, "Running mount");

    let mountpoint = PathBuf::from(args.value_of("mountpoint").expect("Mountpoint required!"));
    println!("Mounting to {:?}", mountpoint);

    if !mountpoint.exists() {
        return Err(format!("Mount dir {:?} doesn't exist", mountpoint).into());
    }

    settings.ensure_runtime_dirs()?;

    let background = !args.is_present("foreground");
    if background {
        debug!(target: TAG, "Forking into the background...");
        match fork().expect("Fork failed") {
            ForkResult::Parent { child } => {
                debug!(target: TAG, "Forked PID {}, now exiting", child);
                println!("Forked into background PID {}", child);
                return Ok(());
            }
            ForkResult::Child => {}
        }
    }

    serve(settings)
}

/// Builds the whole overlay, runs it until a signal, tears it down.  This is
/// the one place everything is constructed; there are no global singletons to
/// reach for.
fn serve(settings: Settings) -> Result<(), Box<dyn Error>> {
    let settings = Arc::new(settings);
    let conf = settings.get_config();

    let state = Arc::new(OverlayState::new(conf.sync.pause, conf.force_disconnect));
    let locks = Arc::new(PathLocks::new());

    debug!(target: TAG, "Opening metadata store {:?}", settings.db_file());
    let meta = Arc::new(MetaStore::new(&settings.db_file())?);

    let log = Arc::new(SyncLog::new(
        meta.pool(),
        Arc::clone(&state),
        Arc::clone(&locks),
    ));

    let store = Arc::new(CacheStore::new(settings.cache_dir())?);

    let remote: Arc<dyn Remote> = Arc::new(FsRemote::new(
        conf.remote.clone(),
        settings.remote_mount_dir(),
    ));

    let cache = Arc::new(CacheManager::new(
        Arc::clone(&settings),
        Arc::clone(&meta),
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::clone(&log),
        Arc::clone(&locks),
        Arc::clone(&state),
    )?);

    let notifier_socket = settings.notify_socket_file();
    let notifier = Arc::new(Mutex::new(UDSNotifier::new(notifier_socket, true)?));

    let ctx = Arc::new(OverlayContext {
        settings: Arc::clone(&settings),
        meta: Arc::clone(&meta),
        log: Arc::clone(&log),
        cache: Arc::clone(&cache),
        remote: Arc::clone(&remote),
        state: Arc::clone(&state),
    });

    // the kernel bridge takes this and drives it from its request threads.
    // it stays alive (and so does the control xattr surface) for the life of
    // the daemon
    let _fsh = OverlayFilesystem::new(Arc::clone(&ctx), Arc::clone(&notifier));

    let sync_handle = SyncWorker::new(
        Arc::clone(&cache),
        Arc::clone(&log),
        Arc::clone(&meta),
        Arc::clone(&remote),
        Arc::clone(&state),
        Arc::clone(&notifier),
    )
    .spawn();

    let avail_handle = AvailabilityWorker::new(
        Arc::clone(&remote),
        Arc::clone(&state),
        Arc::clone(&notifier),
    )
    .spawn();

    let checkpoint_handle = crate::sync::spawn_checkpoint_timer(
        Arc::clone(&meta),
        Arc::clone(&log),
        Arc::clone(&state),
        conf.sync.checkpoint_s,
    );

    let sigint = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::SIGINT, Arc::clone(&sigint))?;
    signal_hook::flag::register(signal_hook::SIGTERM, Arc::clone(&sigint))?;

    info!(target: TAG, "Overlay up");
    while !sigint.load(Ordering::Relaxed) {
        thread::sleep(std::time::Duration::from_millis(100));
    }

    info!(target: TAG, "Signal received, shutting down");
    state.set_unmounted();

    let _ = sync_handle.join();
    let _ = avail_handle.join();
    let _ = checkpoint_handle.join();

    let _ = notifier.lock().unmounted();
    info!(target: TAG, "Shutdown complete");
    Ok(())
}
