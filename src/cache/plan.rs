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

//! The opcode planner.  Every operation starts by reducing the world to six
//! predicates and looking up the one plan that applies.  The planner is a
//! pure function; executing the opcodes (and re-checking the world under the
//! path lock) is the cache manager's job.

/// A primitive instruction of a plan, executed in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// The path doesn't exist anywhere reachable
    Enoent,
    /// Perform the operation against the remote
    UseRemote,
    /// Perform the operation against the cached copy
    UseCache,
    /// Pull the remote copy into the cache first, clobbering what's there
    CacheFile,
    /// Drop the cached copy first
    RemoveCache,
    /// Local dirt and remote changes collide; quarantine before going on
    MergeConflict,
}

/// The state of the world, as sampled under the path lock
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanInput {
    /// A cached copy exists on disk
    pub cached: bool,
    /// The cache policy wants this path cached
    pub should_cache: bool,
    /// The availability flag is up
    pub remote_up: bool,
    /// The remote's revision has moved past what we cached
    pub remote_changed: bool,
    /// The sync log holds an undrained entry for this path
    pub cached_dirty: bool,
    /// This is a stat-only operation, content isn't needed
    pub for_stat: bool,
    /// The path sits in the log's unlinked set
    pub unlinked: bool,
}

pub fn gen_opcodes(input: &PlanInput) -> Vec<Opcode> {
    // not cached and no remote, there's nothing anywhere
    if !input.cached && !input.remote_up {
        return vec![Opcode::Enoent];
    }

    if !input.cached && !input.should_cache {
        // remote_up is implied here.  a path we unlinked locally must stay
        // dead even though the remote still shows it
        if input.unlinked {
            return vec![Opcode::UseCache];
        }
        return vec![Opcode::UseRemote];
    }

    if !input.cached && input.should_cache {
        // stat doesn't need the content, skip the pull
        if input.for_stat {
            return vec![Opcode::UseRemote];
        }
        return vec![Opcode::CacheFile, Opcode::UseCache];
    }

    if input.cached && !input.should_cache {
        if input.remote_up {
            return vec![Opcode::RemoveCache, Opcode::UseRemote];
        }
        return vec![Opcode::RemoveCache, Opcode::Enoent];
    }

    // cached && should_cache
    if input.remote_up && input.remote_changed {
        if input.cached_dirty {
            return vec![Opcode::MergeConflict, Opcode::UseRemote];
        }
        return vec![Opcode::CacheFile, Opcode::UseCache];
    }

    vec![Opcode::UseCache]
}

/// O_CREAT means a missing path isn't an error, it's a creation in the
/// cache.  A pass-through plan becomes a cache plan too: the new file has to
/// be journaled, so it must be born locally.
pub fn rewrite_for_create(plan: &mut Vec<Opcode>) {
    if plan.contains(&Opcode::Enoent) {
        plan.retain(|op| *op != Opcode::Enoent && *op != Opcode::UseRemote);
        plan.push(Opcode::UseCache);
    }
}

/// Which side actually serves the operation, after the side effects run
pub fn serve_side(plan: &[Opcode]) -> Option<Opcode> {
    plan.iter()
        .find(|op| matches!(op, Opcode::Enoent | Opcode::UseRemote | Opcode::UseCache))
        .copied()
}
