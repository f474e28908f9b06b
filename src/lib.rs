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

//! TetherFS is an overlay filesystem that keeps a remote filesystem usable
//! while the connection to it is down.  Reads and writes land in a local
//! on-disk cache, mutations are journaled in a sync log, and a background
//! worker replays the journal against the remote once it comes back.  On
//! disagreement the remote always wins and the loser is quarantined into a
//! conflict changeset file.

#![warn(
    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(
    clippy::option_expect_used,
    clippy::multiple_crate_versions,
    clippy::implicit_return,
    clippy::result_expect_used,
    clippy::missing_docs_in_private_items,
    clippy::missing_inline_in_public_items,
    clippy::shadow_reuse,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::wildcard_enum_match_arm
)]

pub mod cache;
pub mod cli;
pub mod common;
pub mod fuse;
pub mod meta;
pub mod remote;
pub mod sync;
pub mod synclog;
