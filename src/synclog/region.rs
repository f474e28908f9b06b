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

//! Data-region fusion.  A file's pending writes are kept as a set of byte
//! spans that is always non-overlapping and non-adjacent; installing a new
//! write folds every span it touches into one, with the new bytes winning
//! wherever they overlap.  Each span also remembers the bytes it replaced
//! (its base snapshot), and fusion keeps the oldest snapshot for every
//! offset, so the set always describes one jump from pre-disconnect content
//! to current content.

use crate::common::err::{TetherError, TetherResult};
use crate::meta::types::DataRegion;

/// Validates the region invariants before anything gets near the log.
/// `bytes` is the written content, `base` the snapshot of the same span from
/// just before the write.  Empty regions are rejected here; a zero-byte
/// write must never reach the log in the first place.
pub fn new_region(start: u64, end: u64, bytes: Vec<u8>, base: Vec<u8>) -> TetherResult<DataRegion> {
    if end < start {
        return Err(TetherError::BadRegion(format!(
            "end of range is before start ({}, {})",
            start, end
        )));
    }
    if end == start {
        return Err(TetherError::BadRegion(format!(
            "empty range at offset {}",
            start
        )));
    }
    if (end - start) as usize != bytes.len() {
        return Err(TetherError::BadRegion(format!(
            "range {}-{} does not match the length of the data ({})",
            start,
            end,
            bytes.len()
        )));
    }
    if base.len() != bytes.len() {
        return Err(TetherError::BadRegion(format!(
            "snapshot length {} does not match the data length {}",
            base.len(),
            bytes.len()
        )));
    }
    Ok(DataRegion {
        start,
        end,
        bytes,
        base,
    })
}

/// Overlapping or touching, endpoint equality included.  Two spans that
/// merely share an endpoint fuse into one contiguous span.
fn touches(a: &DataRegion, b: &DataRegion) -> bool {
    a.start <= b.end && b.start <= a.end
}

/// Fuses two touching regions.  For the written bytes, `newer` wins wherever
/// the byte ranges properly overlap, which is what makes replay
/// order-independent: the merged content equals applying `older` then
/// `newer`.  For the snapshots it is the other way around: `older` captured
/// the span first, so its base is the true pre-disconnect content, while
/// `newer`'s snapshot of the overlap saw `older`'s bytes already applied.
fn merge(older: &DataRegion, newer: &DataRegion) -> DataRegion {
    let start = older.start.min(newer.start);
    let end = older.end.max(newer.end);
    let len = (end - start) as usize;

    let older_off = (older.start - start) as usize;
    let newer_off = (newer.start - start) as usize;

    let mut bytes = vec![0u8; len];
    bytes[older_off..older_off + older.bytes.len()].copy_from_slice(&older.bytes);
    bytes[newer_off..newer_off + newer.bytes.len()].copy_from_slice(&newer.bytes);

    let mut base = vec![0u8; len];
    base[newer_off..newer_off + newer.base.len()].copy_from_slice(&newer.base);
    base[older_off..older_off + older.base.len()].copy_from_slice(&older.base);

    DataRegion {
        start,
        end,
        bytes,
        base,
    }
}

/// Installs `incoming` into a normalized region set, returning a set that is
/// again non-overlapping and non-adjacent, sorted by start offset
pub fn install(regions: Vec<DataRegion>, incoming: DataRegion) -> Vec<DataRegion> {
    let mut acc = incoming;
    let mut out: Vec<DataRegion> = Vec::with_capacity(regions.len() + 1);

    for r in regions {
        if touches(&r, &acc) {
            // the set members never touch each other, so everything already
            // folded into acc came either from the incoming write or from
            // spans disjoint with r.  acc's bytes stay the winners, r's
            // snapshot stays the oldest
            acc = merge(&r, &acc);
        } else {
            out.push(r);
        }
    }

    out.push(acc);
    out.sort_by_key(|r| r.start);
    out
}

/// Rewrites a region set for a truncate to `new_size`: regions fully beyond
/// are dropped, straddling ones are clipped
pub fn clip(regions: Vec<DataRegion>, new_size: u64) -> Vec<DataRegion> {
    regions
        .into_iter()
        .filter_map(|r| {
            if r.start >= new_size {
                None
            } else if r.end > new_size {
                let keep = (new_size - r.start) as usize;
                let mut bytes = r.bytes;
                bytes.truncate(keep);
                let mut base = r.base;
                base.truncate(keep);
                Some(DataRegion {
                    start: r.start,
                    end: new_size,
                    bytes,
                    base,
                })
            } else {
                Some(r)
            }
        })
        .collect()
}

/// Lays a region set over base content.  The result is what a read of the
/// whole file must observe before the log drains.
pub fn apply(base: &[u8], regions: &[DataRegion]) -> Vec<u8> {
    let needed = regions
        .iter()
        .map(|r| r.end as usize)
        .max()
        .unwrap_or(0)
        .max(base.len());

    let mut out = vec![0u8; needed];
    out[..base.len()].copy_from_slice(base);

    for r in regions {
        out[r.start as usize..r.end as usize].copy_from_slice(&r.bytes);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(start: u64, bytes: &[u8]) -> DataRegion {
        new_region(
            start,
            start + bytes.len() as u64,
            bytes.to_vec(),
            vec![0u8; bytes.len()],
        )
        .unwrap()
    }

    fn reg_with_base(start: u64, bytes: &[u8], base: &[u8]) -> DataRegion {
        new_region(
            start,
            start + bytes.len() as u64,
            bytes.to_vec(),
            base.to_vec(),
        )
        .unwrap()
    }

    /// Installs a sequence of writes one at a time, the way append_change does
    fn install_all(writes: &[DataRegion]) -> Vec<DataRegion> {
        let mut set = Vec::new();
        for w in writes {
            set = install(set, w.clone());
        }
        set
    }

    fn assert_normalized(set: &[DataRegion]) {
        for pair in set.windows(2) {
            assert!(
                pair[0].end < pair[1].start,
                "{} and {} overlap or touch",
                pair[0],
                pair[1]
            );
        }
        for r in set {
            assert_eq!((r.end - r.start) as usize, r.bytes.len());
            assert_eq!(r.bytes.len(), r.base.len());
        }
    }

    #[test]
    fn test_empty_region_rejected() {
        assert!(new_region(5, 5, vec![], vec![]).is_err());
    }

    #[test]
    fn test_backwards_region_rejected() {
        assert!(new_region(5, 3, vec![0, 0], vec![0, 0]).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert!(new_region(0, 5, vec![0, 0], vec![0, 0]).is_err());
    }

    #[test]
    fn test_snapshot_length_mismatch_rejected() {
        assert!(new_region(0, 2, vec![0, 0], vec![0]).is_err());
    }

    #[test]
    fn test_disjoint_regions_stay_separate() {
        let set = install_all(&[reg(0, b"aa"), reg(10, b"bb")]);
        assert_eq!(set.len(), 2);
        assert_normalized(&set);
    }

    #[test]
    fn test_adjacent_regions_fuse() {
        let set = install_all(&[reg(0, b"aa"), reg(2, b"bb")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0], reg(0, b"aabb"));
    }

    #[test]
    fn test_later_write_wins_in_overlap() {
        let set = install_all(&[reg(0, b"aaaa"), reg(2, b"BB")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0], reg(0, b"aaBB"));
    }

    #[test]
    fn test_outer_overwrite_wins() {
        let set = install_all(&[reg(2, b"xx"), reg(0, b"BBBBBB")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0], reg(0, b"BBBBBB"));
    }

    #[test]
    fn test_inner_overwrite_wins() {
        let set = install_all(&[reg(0, b"aaaaaa"), reg(2, b"BB")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0], reg(0, b"aaBBaa"));
    }

    #[test]
    fn test_bridging_write_fuses_neighbors() {
        // two islands, then a write spanning the gap folds all three
        let set = install_all(&[reg(0, b"aa"), reg(4, b"cc"), reg(1, b"BBBB")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0], reg(0, b"aBBBBc"));
    }

    #[test]
    fn test_oldest_snapshot_wins_in_overlap() {
        // the file held "wxyz"; the first write put NNNN over it, so the
        // second write's snapshot of the overlap saw N's, not the original
        let first = reg_with_base(0, b"NNNN", b"wxyz");
        let second = reg_with_base(2, b"MMMM", b"NNop");

        let set = install_all(&[first, second]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].bytes, b"NNMMMM".to_vec());
        // the fused snapshot is the true pre-write content everywhere
        assert_eq!(set[0].base, b"wxyzop".to_vec());
    }

    #[test]
    fn test_apply_matches_sequential_writes() {
        // the fused set must read back exactly like replaying the writes in
        // order over the base content
        let base = b"0123456789".to_vec();
        let writes = vec![reg(2, b"ab"), reg(3, b"CDE"), reg(8, b"zz"), reg(0, b"Q")];

        let mut expected = base.clone();
        for w in &writes {
            let end = w.end as usize;
            if expected.len() < end {
                expected.resize(end, 0);
            }
            expected[w.start as usize..end].copy_from_slice(&w.bytes);
        }

        let set = install_all(&writes);
        assert_normalized(&set);
        assert_eq!(apply(&base, &set), expected);
    }

    #[test]
    fn test_apply_extends_past_eof() {
        let base = b"abc".to_vec();
        let set = install_all(&[reg(5, b"zz")]);
        let result = apply(&base, &set);
        // the hole between EOF and the write reads back as zeros
        assert_eq!(result, b"abc\x00\x00zz".to_vec());
    }

    #[test]
    fn test_clip_drops_and_trims() {
        let set = install_all(&[reg(0, b"aa"), reg(4, b"bbbb"), reg(10, b"cc")]);
        let clipped = clip(set, 6);
        assert_eq!(clipped.len(), 2);
        assert_eq!(clipped[0], reg(0, b"aa"));
        assert_eq!(clipped[1], reg(4, b"bb"));
    }

    #[test]
    fn test_clip_to_zero_empties() {
        let set = install_all(&[reg(0, b"aa")]);
        assert!(clip(set, 0).is_empty());
    }
}
