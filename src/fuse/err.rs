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

use crate::common::err::TetherError;
use core::fmt;
use nix::errno::Errno;
use rusqlite::Error as SqlError;
use std::borrow::Borrow;
use std::error::Error;
use std::fmt::Formatter;
use std::io::ErrorKind;

/// The error type crossing the kernel-bridge boundary.  The bridge only cares
/// about the errno; `original` rides along so the failure can be logged with
/// its real cause before it's flattened into an integer.
pub struct FuseErrno {
    pub errno: Errno,
    pub original: Option<Box<dyn Error>>,
}

impl FuseErrno {
    /// The negative errno convention the bridge returns to the kernel
    pub fn raw(&self) -> i32 {
        -(self.errno as i32)
    }
}

impl fmt::Display for FuseErrno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.errno, self.original)
    }
}

impl fmt::Debug for FuseErrno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Error for FuseErrno {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.original {
            Some(e) => Some(e.borrow()),
            None => None,
        }
    }
}

fn map_io_err(e: &std::io::Error) -> Errno {
    match e.kind() {
        ErrorKind::InvalidData => Errno::EIO,
        ErrorKind::PermissionDenied => Errno::EPERM,
        _ => Errno::from_i32(e.raw_os_error().unwrap_or(Errno::EIO as i32)),
    }
}

impl From<Errno> for FuseErrno {
    fn from(errno: Errno) -> Self {
        Self {
            errno,
            original: None,
        }
    }
}

impl From<std::io::Error> for FuseErrno {
    fn from(e: std::io::Error) -> Self {
        Self {
            errno: map_io_err(&e),
            original: Some(Box::new(e)),
        }
    }
}

impl From<SqlError> for FuseErrno {
    fn from(e: SqlError) -> Self {
        Self {
            errno: Errno::EIO,
            original: Some(Box::new(e)),
        }
    }
}

impl From<TetherError> for FuseErrno {
    fn from(e: TetherError) -> Self {
        Self {
            errno: e.errno(),
            original: Some(Box::new(e)),
        }
    }
}
