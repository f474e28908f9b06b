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

use clap::App;

pub mod mount;
pub mod unmount;

/// Stringified defaults for arguments whose values come from the running
/// process (clap wants &str, so the strings live here)
pub struct ArgDefaults {
    pub uid: String,
    pub gid: String,
}

pub fn add_subcommands<'a, 'b>(app: App<'a, 'b>, defaults: &'a ArgDefaults) -> App<'a, 'b> {
    app.subcommand(mount::subcommand(defaults))
        .subcommand(unmount::subcommand())
}
