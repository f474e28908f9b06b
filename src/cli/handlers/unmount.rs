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
use crate::common::settings::Settings;
use clap::ArgMatches;
use log::info;
use std::error::Error;
use std::process::Command;

pub fn handle(args: &ArgMatches, _settings: Settings) -> Result<(), Box<dyn Error>> {
    info!(target: TAG, "Running unmount");
    let mountpoint = args.value_of("mountpoint").expect("Mountpoint required!");

    // the bridge mount is a fuse mount; fusermount tears it down, and the
    // daemon shuts itself down when its mount disappears
    let status = Command::new("fusermount").arg("-u").arg(mountpoint).status()?;

    if !status.success() {
        return Err(format!("fusermount exited with {}", status).into());
    }
    Ok(())
}
