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

use super::ArgDefaults;
use clap::{App, Arg, SubCommand};

pub fn subcommand<'a, 'b>(defaults: &'a ArgDefaults) -> App<'a, 'b> {
    SubCommand::with_name("mount")
        .about("Mounts the overlay")
        .arg(
            Arg::with_name("mountpoint")
                .required(true)
                .help("Where the overlay appears"),
        )
        .arg(
            Arg::with_name("type")
                .long("type")
                .short("t")
                .takes_value(true)
                .possible_values(&["nfs", "samba", "sshfs", "webdav"])
                .help("Remote protocol, overriding the config file"),
        )
        .arg(
            Arg::with_name("source")
                .long("source")
                .short("s")
                .takes_value(true)
                .help("Remote source URI, overriding the config file"),
        )
        .arg(
            Arg::with_name("options")
                .long("options")
                .short("o")
                .takes_value(true)
                .help("Backend-specific mount options"),
        )
        .arg(
            Arg::with_name("uid")
                .long("uid")
                .takes_value(true)
                .default_value(&defaults.uid)
                .help("Uid owning files of unknown ownership"),
        )
        .arg(
            Arg::with_name("gid")
                .long("gid")
                .takes_value(true)
                .default_value(&defaults.gid)
                .help("Gid owning files of unknown ownership"),
        )
        .arg(
            Arg::with_name("pause")
                .long("pause")
                .help("Start with syncing paused"),
        )
        .arg(
            Arg::with_name("foreground")
                .long("foreground")
                .short("f")
                .help("Don't fork into the background"),
        )
}
