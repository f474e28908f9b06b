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

//! The overlay's own extended attributes.  `tetherfs.*` names are virtual:
//! reads report cache and sync state, writes drive the overlay (pinning
//! paths, pausing sync, forcing disconnect).  Handlers live in an explicit
//! registry keyed by name, populated once at startup.

use super::OverlayContext;
use crate::common::constants;
use crate::fuse::err::FuseErrno;
use crate::fuse::FuseResult;
use nix::errno::Errno::EOPNOTSUPP;
use std::collections::HashMap;
use std::path::Path;

/// Which paths an attribute shows up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrScope {
    /// Only the mount root; these control or report on the whole overlay
    Root,
    /// Every path
    Any,
}

type GetFn = fn(&OverlayContext, &Path) -> FuseResult<Vec<u8>>;
type SetFn = fn(&OverlayContext, &Path, &[u8]) -> FuseResult<()>;

pub struct XattrHandler {
    pub scope: XattrScope,
    pub get: GetFn,
    /// None means the attribute is read-only
    pub set: Option<SetFn>,
}

pub struct XattrRegistry {
    handlers: HashMap<&'static str, XattrHandler>,
}

fn flag_bytes(val: bool) -> Vec<u8> {
    if val {
        b"1".to_vec()
    } else {
        b"0".to_vec()
    }
}

fn parse_flag(value: &[u8]) -> FuseResult<bool> {
    match value {
        b"1" => Ok(true),
        b"0" => Ok(false),
        _ => Err(EOPNOTSUPP.into()),
    }
}

fn get_in_cache(ctx: &OverlayContext, path: &Path) -> FuseResult<Vec<u8>> {
    Ok(flag_bytes(ctx.cache.is_cached_to_disk(path)))
}

fn get_dirty(ctx: &OverlayContext, path: &Path) -> FuseResult<Vec<u8>> {
    let is_dir = ctx
        .meta
        .try_get(path)
        .map_err(FuseErrno::from)?
        .map(|rec| rec.is_dir())
        .unwrap_or(false);

    let dirty = if is_dir {
        ctx.log.is_dirty_recursive(path)
    } else {
        ctx.log.is_dirty(path)
    }
    .map_err(FuseErrno::from)?;

    Ok(flag_bytes(dirty))
}

fn get_should_cache(ctx: &OverlayContext, path: &Path) -> FuseResult<Vec<u8>> {
    let out = match ctx.cache.policy_entry(path) {
        Some(true) => "+",
        Some(false) => "-",
        None => {
            // not explicitly named, report what the lookup decides
            if ctx.cache.should_cache(path) {
                "= (+)"
            } else {
                "= (-)"
            }
        }
    };
    Ok(out.as_bytes().to_vec())
}

fn set_should_cache(ctx: &OverlayContext, path: &Path, value: &[u8]) -> FuseResult<()> {
    let entry = match value {
        b"+" => Some(true),
        b"-" => Some(false),
        b"=" => None,
        _ => return Err(EOPNOTSUPP.into()),
    };
    ctx.cache.set_policy(path, entry).map_err(FuseErrno::from)
}

fn get_pause_sync(ctx: &OverlayContext, _path: &Path) -> FuseResult<Vec<u8>> {
    Ok(flag_bytes(ctx.state.is_sync_paused()))
}

fn set_pause_sync(ctx: &OverlayContext, _path: &Path, value: &[u8]) -> FuseResult<()> {
    ctx.state.set_sync_paused(parse_flag(value)?);
    Ok(())
}

fn get_force_disconnect(ctx: &OverlayContext, _path: &Path) -> FuseResult<Vec<u8>> {
    Ok(flag_bytes(ctx.state.is_force_disconnected()))
}

fn set_force_disconnect(ctx: &OverlayContext, _path: &Path, value: &[u8]) -> FuseResult<()> {
    let forced = parse_flag(value)?;
    ctx.state.set_force_disconnect(forced);
    if forced {
        // the mount comes down right now, not at the next heartbeat
        ctx.state.set_available(false);
        let _ = ctx.remote.unmount();
    }
    Ok(())
}

fn get_connected(ctx: &OverlayContext, _path: &Path) -> FuseResult<Vec<u8>> {
    Ok(flag_bytes(ctx.state.is_available()))
}

fn get_synclog(ctx: &OverlayContext, _path: &Path) -> FuseResult<Vec<u8>> {
    let dump = ctx.log.dump().map_err(FuseErrno::from)?;
    Ok(dump.into_bytes())
}

fn get_version(_ctx: &OverlayContext, _path: &Path) -> FuseResult<Vec<u8>> {
    Ok(crate::common::version_str().into_bytes())
}

impl XattrRegistry {
    /// The standard set of overlay attributes
    pub fn standard() -> Self {
        let mut handlers: HashMap<&'static str, XattrHandler> = HashMap::new();

        handlers.insert(
            constants::XATTR_IN_CACHE,
            XattrHandler {
                scope: XattrScope::Any,
                get: get_in_cache,
                set: None,
            },
        );
        handlers.insert(
            constants::XATTR_DIRTY,
            XattrHandler {
                scope: XattrScope::Any,
                get: get_dirty,
                set: None,
            },
        );
        handlers.insert(
            constants::XATTR_SHOULD_CACHE,
            XattrHandler {
                scope: XattrScope::Any,
                get: get_should_cache,
                set: Some(set_should_cache),
            },
        );
        handlers.insert(
            constants::XATTR_PAUSE_SYNC,
            XattrHandler {
                scope: XattrScope::Root,
                get: get_pause_sync,
                set: Some(set_pause_sync),
            },
        );
        handlers.insert(
            constants::XATTR_FORCE_DISCONNECT,
            XattrHandler {
                scope: XattrScope::Root,
                get: get_force_disconnect,
                set: Some(set_force_disconnect),
            },
        );
        handlers.insert(
            constants::XATTR_CONNECTED,
            XattrHandler {
                scope: XattrScope::Root,
                get: get_connected,
                set: None,
            },
        );
        handlers.insert(
            constants::XATTR_SYNCLOG,
            XattrHandler {
                scope: XattrScope::Root,
                get: get_synclog,
                set: None,
            },
        );
        handlers.insert(
            constants::XATTR_VERSION,
            XattrHandler {
                scope: XattrScope::Root,
                get: get_version,
                set: None,
            },
        );

        Self { handlers }
    }

    fn applies(scope: XattrScope, path: &Path) -> bool {
        match scope {
            XattrScope::Root => path == Path::new("/"),
            XattrScope::Any => true,
        }
    }

    /// Dispatch a get.  None means the name isn't ours and should fall
    /// through to the real xattr machinery.
    pub fn get(
        &self,
        ctx: &OverlayContext,
        path: &Path,
        name: &str,
    ) -> Option<FuseResult<Vec<u8>>> {
        let handler = self.handlers.get(name)?;
        if !Self::applies(handler.scope, path) {
            return None;
        }
        Some((handler.get)(ctx, path))
    }

    /// Dispatch a set.  Read-only attributes report EOPNOTSUPP.
    pub fn set(
        &self,
        ctx: &OverlayContext,
        path: &Path,
        name: &str,
        value: &[u8],
    ) -> Option<FuseResult<()>> {
        let handler = self.handlers.get(name)?;
        if !Self::applies(handler.scope, path) {
            return None;
        }
        match handler.set {
            Some(set) => Some(set(ctx, path, value)),
            None => Some(Err(EOPNOTSUPP.into())),
        }
    }

    /// Every overlay attribute visible on `path`
    pub fn names_for(&self, path: &Path) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .filter(|(_name, handler)| Self::applies(handler.scope, path))
            .map(|(name, _handler)| name.to_string())
            .collect();
        names.sort();
        names
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}
