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

use nix::errno::Errno;
use std::error::Error;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub type TetherResult<T> = Result<T, TetherError>;

/// Every error the overlay can produce, bucketed by how it propagates.  The
/// `IoTransient` bucket is special: any remote operation that lands there
/// knocks the availability flag down and sends the sync worker back to its
/// disconnected state.  `IoFatal` is the local disk or the metadata store
/// going bad underneath us, which we report but never retry.
pub enum TetherError {
    NotFound(PathBuf),
    Permission(PathBuf),
    Exists(PathBuf),
    NotEmpty(PathBuf),
    Unsupported(&'static str),
    InvalidPath(PathBuf),
    BadRegion(String),
    Conflicted(PathBuf),
    IoTransient(Box<dyn Error + Send + Sync>),
    IoFatal(Box<dyn Error + Send + Sync>),
    DatabaseError(rusqlite::Error),
}

impl TetherError {
    /// Classify an io error raised while operating on `path`.  EIO and ESTALE
    /// are the two errnos the kernel hands back when a network filesystem
    /// goes away underneath an open mount.
    pub fn from_io(path: &Path, e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(raw) if raw == libc::ENOENT => TetherError::NotFound(path.to_owned()),
            Some(raw) if raw == libc::EACCES || raw == libc::EPERM => {
                TetherError::Permission(path.to_owned())
            }
            Some(raw) if raw == libc::EEXIST => TetherError::Exists(path.to_owned()),
            Some(raw) if raw == libc::ENOTEMPTY => TetherError::NotEmpty(path.to_owned()),
            Some(raw) if raw == libc::EIO || raw == libc::ESTALE => {
                TetherError::IoTransient(Box::new(e))
            }
            _ => match e.kind() {
                ErrorKind::NotFound => TetherError::NotFound(path.to_owned()),
                ErrorKind::PermissionDenied => TetherError::Permission(path.to_owned()),
                ErrorKind::AlreadyExists => TetherError::Exists(path.to_owned()),
                _ => TetherError::IoFatal(Box::new(e)),
            },
        }
    }

    pub fn from_nix(path: &Path, e: nix::Error) -> Self {
        match e.as_errno() {
            Some(Errno::ENOENT) => TetherError::NotFound(path.to_owned()),
            Some(Errno::EACCES) | Some(Errno::EPERM) => TetherError::Permission(path.to_owned()),
            Some(Errno::EEXIST) => TetherError::Exists(path.to_owned()),
            Some(Errno::ENOTEMPTY) => TetherError::NotEmpty(path.to_owned()),
            Some(Errno::EIO) | Some(Errno::ESTALE) => TetherError::IoTransient(Box::new(e)),
            _ => TetherError::IoFatal(Box::new(e)),
        }
    }

    pub fn errno(&self) -> Errno {
        match self {
            TetherError::NotFound(_) => Errno::ENOENT,
            TetherError::Permission(_) => Errno::EACCES,
            TetherError::Exists(_) => Errno::EEXIST,
            TetherError::NotEmpty(_) => Errno::ENOTEMPTY,
            TetherError::Unsupported(_) => Errno::EOPNOTSUPP,
            TetherError::InvalidPath(_) => Errno::EINVAL,
            TetherError::BadRegion(_) => Errno::EINVAL,
            TetherError::Conflicted(_) => Errno::EIO,
            TetherError::IoTransient(_) => Errno::EIO,
            TetherError::IoFatal(_) => Errno::EIO,
            TetherError::DatabaseError(_) => Errno::EIO,
        }
    }

    /// True for the errors that mean the remote itself is gone, as opposed to
    /// the operation merely failing.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TetherError::IoTransient(_) => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for TetherError {
    fn from(e: rusqlite::Error) -> Self {
        TetherError::DatabaseError(e)
    }
}

impl Error for TetherError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TetherError::DatabaseError(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for TetherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            TetherError::NotFound(path) => write!(f, "No such path {}", path.display()),
            TetherError::Permission(path) => write!(f, "Permission denied on {}", path.display()),
            TetherError::Exists(path) => write!(f, "Path {:?} already exists", path),
            TetherError::NotEmpty(path) => write!(f, "Directory {:?} not empty", path),
            TetherError::Unsupported(what) => write!(f, "Unsupported operation: {}", what),
            TetherError::InvalidPath(path) => write!(f, "Invalid path {}", path.display()),
            TetherError::BadRegion(why) => write!(f, "Bad data region: {}", why),
            TetherError::Conflicted(path) => write!(f, "Conflict on {}", path.display()),
            TetherError::IoTransient(e) => write!(f, "Transient remote IO error: {:?}", e),
            TetherError::IoFatal(e) => write!(f, "Fatal IO error: {:?}", e),
            TetherError::DatabaseError(dbe) => write!(f, "Database error: {:?}", dbe),
        }
    }
}

impl std::fmt::Debug for TetherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        std::fmt::Display::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct ParseOctalError;

impl std::fmt::Display for ParseOctalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Bad octal value")
    }
}
impl Error for ParseOctalError {}
