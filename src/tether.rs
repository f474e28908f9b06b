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

//! This is the entrypoint for the commandline interface to the overlay

#![warn(
    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(
    clippy::expect_used,
    clippy::multiple_crate_versions,
    clippy::implicit_return,
    clippy::missing_docs_in_private_items,
    clippy::missing_inline_in_public_items,
    clippy::shadow_reuse,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::wildcard_enum_match_arm
)]

use std::error::Error;

use clap::{App, Arg};

use common::constants;
use common::settings::config::HashMapSource;
use common::settings::Settings;
use std::sync::Arc;
use tetherfs::cli::commands::ArgDefaults;
use tetherfs::cli::handlers;
use tetherfs::{cli, common};

fn main() -> Result<(), Box<dyn Error>> {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let defaults = ArgDefaults {
        uid: uid.to_string(),
        gid: gid.to_string(),
    };

    let version_str = common::version_str();
    let app = App::new("TetherFS")
        .version(&*version_str)
        .author(constants::AUTHOR)
        .about("Disconnected, offline-caching overlay filesystem")
        .settings(&[clap::AppSettings::ArgRequiredElseHelp])
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        );

    let attached_app = cli::commands::add_subcommands(app, &defaults);
    let matches = attached_app.get_matches();

    let pd =
        Arc::new(directories::ProjectDirs::from("", constants::ORG, constants::APP_NAME).unwrap());

    let mut settings = Settings::new(pd.clone())?;
    let conf_file = settings.base_config_file();

    let mut config_sources: Vec<Box<dyn config::Source + Send + Sync>> =
        vec![Box::new(config::File::from(conf_file))];

    let maybe_log = match matches.occurrences_of("verbosity") {
        0 => None,
        1 => Some(log::LevelFilter::Info),
        2 => Some(log::LevelFilter::Debug),
        _ => Some(log::LevelFilter::Trace),
    };

    // the mount daemon logs to a rotating file in the data dir; everything
    // else logs to stdout only when asked
    if let Some(args) = matches.subcommand_matches("mount") {
        let mut log_outputs: Vec<fern::Output> = vec![];

        std::fs::create_dir_all(settings.log_dir())?;
        let rotating_log = common::log::RotatingLogger::new(
            settings.log_dir(),
            "%Y-%m-%d-%H-tetherfs.log".to_string(),
            6,
            100,
        )?;

        log_outputs.push(From::<Box<dyn log::Log>>::from(Box::new(rotating_log)));
        if args.is_present("foreground") {
            log_outputs.push(std::io::stdout().into());
        }
        if let Some(log_level) = maybe_log {
            common::log::setup_logger(log_level, log_outputs)?;
        }

        let mut cli_source = HashMapSource(Default::default());
        if let Some(kind) = args.value_of("type") {
            cli_source
                .0
                .insert("remote.type".to_string(), kind.into());
        }
        if let Some(source) = args.value_of("source") {
            cli_source
                .0
                .insert("remote.source".to_string(), source.into());
        }
        if let Some(options) = args.value_of("options") {
            cli_source
                .0
                .insert("remote.options".to_string(), options.into());
        }
        if args.is_present("pause") {
            cli_source.0.insert("sync.pause".to_string(), true.into());
        }

        config_sources.push(Box::new(cli_source));
    } else if let Some(log_level) = maybe_log {
        common::log::setup_logger(log_level, vec![std::io::stdout().into()])?;
    }

    let conf = common::settings::config::build(config_sources, &*pd);
    settings.update_config(conf);

    match matches.subcommand() {
        ("mount", Some(args)) => handlers::mount::handle(args, settings),
        ("unmount", Some(args)) => handlers::unmount::handle(args, settings),
        _ => Err("Command not found".into()),
    }
}
