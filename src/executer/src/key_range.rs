// Copyright 2025 Tidewave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Key-range sets addressed to a single shard.

use std::cmp::Ordering;

use enum_as_inner::EnumAsInner;
use itertools::Itertools;
use tidewave_common::types::CellVec;
use tidewave_pb::task::{KeyRange, KeyRanges, SerializedRange};

/// A range over key tuples. `point` marks a degenerate range built from a
/// single key; such ranges only appear as the full-range form.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedTableRange {
    pub from: CellVec,
    pub to: CellVec,
    pub from_inclusive: bool,
    pub to_inclusive: bool,
    pub point: bool,
}

impl SerializedTableRange {
    pub fn new(from: CellVec, to: CellVec, from_inclusive: bool, to_inclusive: bool) -> Self {
        Self {
            from,
            to,
            from_inclusive,
            to_inclusive,
            point: false,
        }
    }

    fn to_proto(&self) -> SerializedRange {
        SerializedRange {
            from: self.from.encode(),
            to: self.to.encode(),
            from_inclusive: self.from_inclusive,
            to_inclusive: self.to_inclusive,
        }
    }
}

#[derive(Clone, Debug, PartialEq, EnumAsInner)]
pub enum PointOrRange {
    Point(CellVec),
    Range(SerializedTableRange),
}

/// The set of key points and ranges one shard task reads or writes.
///
/// Invariant: the `ranges` list never holds a degenerate `Point`-tagged
/// range; single keys live in the `Point` variant, and a full-range state
/// supersedes the list entirely.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShardKeyRanges {
    full_range: Option<SerializedTableRange>,
    ranges: Vec<PointOrRange>,
}

impl ShardKeyRanges {
    pub fn is_full_range(&self) -> bool {
        self.full_range.is_some()
    }

    pub fn full_range(&self) -> Option<&SerializedTableRange> {
        self.full_range.as_ref()
    }

    pub fn ranges(&self) -> &[PointOrRange] {
        &self.ranges
    }

    pub fn add_point(&mut self, point: CellVec) {
        if !self.is_full_range() {
            self.ranges.push(PointOrRange::Point(point));
        }
    }

    pub fn add_range(&mut self, range: SerializedTableRange) {
        debug_assert!(!range.point);
        if !self.is_full_range() {
            self.ranges.push(PointOrRange::Range(range));
        }
    }

    pub fn add(&mut self, point_or_range: PointOrRange) {
        if !self.is_full_range() {
            if let PointOrRange::Range(range) = &point_or_range {
                debug_assert!(!range.point);
            }
            self.ranges.push(point_or_range);
        }
    }

    pub fn copy_from(&mut self, ranges: &[PointOrRange]) {
        if !self.is_full_range() {
            self.ranges = ranges.to_vec();
            for item in &self.ranges {
                if let PointOrRange::Range(range) = item {
                    debug_assert!(!range.point);
                }
            }
        }
    }

    pub fn make_full_range(&mut self, range: SerializedTableRange) {
        self.ranges.clear();
        self.full_range = Some(range);
    }

    pub fn make_full_point(&mut self, point: CellVec) {
        self.ranges.clear();
        self.full_range = Some(SerializedTableRange {
            from: point,
            to: CellVec::default(),
            from_inclusive: true,
            to_inclusive: true,
            point: true,
        });
    }

    pub fn make_full(&mut self, point_or_range: PointOrRange) {
        match point_or_range {
            PointOrRange::Range(range) => self.make_full_range(range),
            PointOrRange::Point(point) => self.make_full_point(point),
        }
    }

    /// Ordered union of two point sets via a two-pointer merge, deduplicating
    /// equal keys. Assumes both sides hold only points; a full range on
    /// either side short-circuits.
    pub fn merge_write_points(&mut self, mut other: ShardKeyRanges) {
        if self.is_full_range() {
            return;
        }

        if other.is_full_range() {
            std::mem::swap(&mut self.ranges, &mut other.ranges);
            std::mem::swap(&mut self.full_range, &mut other.full_range);
            return;
        }

        let mut result = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        let mut left = std::mem::take(&mut self.ranges).into_iter().peekable();
        let mut right = other.ranges.into_iter().peekable();

        loop {
            let cmp = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(x), Some(y)) => {
                    // Common case for multi-effects transactions: both sides
                    // are write points.
                    let x = x
                        .as_point()
                        .unwrap_or_else(|| panic!("merge_write_points: left side holds a range"));
                    let y = y
                        .as_point()
                        .unwrap_or_else(|| panic!("merge_write_points: right side holds a range"));
                    x.cmp_with(y)
                }
            };

            match cmp {
                Ordering::Less => result.push(left.next().unwrap()),
                Ordering::Greater => result.push(right.next().unwrap()),
                Ordering::Equal => {
                    result.push(left.next().unwrap());
                    right.next();
                }
            }
        }

        self.ranges = result;
    }

    pub fn has_ranges(&self) -> bool {
        if self.is_full_range() {
            return true;
        }
        self.ranges.iter().any(|item| item.as_range().is_some())
    }

    /// Serialization for data-shard task meta: points stay points, ranges
    /// stay ranges.
    pub fn serialize_to_data_task(&self) -> KeyRange {
        use tidewave_pb::task::key_range::Kind;

        if let Some(full) = &self.full_range {
            return KeyRange {
                kind: Some(Kind::FullRange(full.to_proto())),
            };
        }

        let mut ranges = KeyRanges::default();
        for item in &self.ranges {
            match item {
                PointOrRange::Point(point) => ranges.key_points.push(point.encode()),
                PointOrRange::Range(range) => {
                    debug_assert!(!range.point);
                    ranges.key_ranges.push(range.to_proto());
                }
            }
        }
        KeyRange {
            kind: Some(Kind::Ranges(ranges)),
        }
    }

    /// Serialization for scan task meta: everything becomes a range; points
    /// are re-encoded as inclusive `[x, x]`.
    pub fn serialize_to_scan_task(&self) -> Vec<SerializedRange> {
        if let Some(full) = &self.full_range {
            return vec![full.to_proto()];
        }

        self.ranges
            .iter()
            .map(|item| match item {
                PointOrRange::Range(range) => {
                    debug_assert!(!range.point);
                    range.to_proto()
                }
                PointOrRange::Point(point) => {
                    let encoded = point.encode();
                    SerializedRange {
                        from: encoded.clone(),
                        to: encoded,
                        from_inclusive: true,
                        to_inclusive: true,
                    }
                }
            })
            .collect()
    }

    /// Serialization for read-ranges source settings. Points are emitted as
    /// points only when the target allows it and every element is a point.
    pub fn serialize_to_source(&self, allow_points: bool) -> KeyRanges {
        let mut proto = KeyRanges::default();

        if let Some(full) = &self.full_range {
            proto.key_ranges.push(full.to_proto());
            return proto;
        }

        let use_points =
            allow_points && self.ranges.iter().all(|item| item.as_point().is_some());

        for item in &self.ranges {
            match item {
                PointOrRange::Point(point) if use_points => {
                    proto.key_points.push(point.encode());
                }
                PointOrRange::Point(point) => {
                    let encoded = point.encode();
                    proto.key_ranges.push(SerializedRange {
                        from: encoded.clone(),
                        to: encoded,
                        from_inclusive: true,
                        to_inclusive: true,
                    });
                }
                PointOrRange::Range(range) => {
                    debug_assert!(!range.point);
                    proto.key_ranges.push(range.to_proto());
                }
            }
        }
        proto
    }

    /// The upper bound of the set and whether it is inclusive.
    pub fn right_border(&self) -> Option<(&CellVec, bool)> {
        if let Some(full) = &self.full_range {
            return if full.point {
                Some((&full.from, true))
            } else {
                Some((&full.to, true))
            };
        }

        match self.ranges.last()? {
            PointOrRange::Point(point) => Some((point, true)),
            PointOrRange::Range(range) => {
                if range.point {
                    Some((&range.from, true))
                } else {
                    Some((&range.to, range.to_inclusive))
                }
            }
        }
    }

    pub fn display_text(&self) -> String {
        if let Some(full) = &self.full_range {
            return format!("full {}..{}", full.from.display_text(), full.to.display_text());
        }
        if self.ranges.is_empty() {
            return "<empty>".to_owned();
        }
        self.ranges
            .iter()
            .map(|item| match item {
                PointOrRange::Point(p) => p.display_text(),
                PointOrRange::Range(r) => {
                    format!("{}..{}", r.from.display_text(), r.to.display_text())
                }
            })
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use tidewave_common::types::ScalarImpl;

    use super::*;

    fn point(v: i64) -> CellVec {
        CellVec::new(vec![Some(ScalarImpl::Int64(v))])
    }

    fn points(values: &[i64]) -> ShardKeyRanges {
        let mut ranges = ShardKeyRanges::default();
        for v in values {
            ranges.add_point(point(*v));
        }
        ranges
    }

    #[test]
    fn test_merge_write_points_ordered_dedup() {
        let mut a = points(&[1, 3, 5]);
        let b = points(&[2, 3, 7]);
        a.merge_write_points(b);
        assert_eq!(a, points(&[1, 2, 3, 5, 7]));
    }

    #[test]
    fn test_merge_full_range_short_circuits() {
        let full = SerializedTableRange::new(CellVec::default(), CellVec::default(), true, true);

        let mut a = points(&[1]);
        let mut b = ShardKeyRanges::default();
        b.make_full_range(full.clone());
        a.merge_write_points(b);
        assert!(a.is_full_range());

        let mut c = ShardKeyRanges::default();
        c.make_full_range(full);
        c.merge_write_points(points(&[1, 2]));
        assert!(c.is_full_range());
    }

    #[test]
    fn test_add_is_noop_on_full_range() {
        let mut ranges = ShardKeyRanges::default();
        ranges.make_full_point(point(9));
        ranges.add_point(point(1));
        ranges.add_range(SerializedTableRange::new(point(1), point(2), true, false));
        assert!(ranges.is_full_range());
        assert!(ranges.ranges().is_empty());
    }

    #[test]
    fn test_right_border() {
        let mut ranges = points(&[1, 4]);
        let (border, inclusive) = ranges.right_border().unwrap();
        assert_eq!(border, &point(4));
        assert!(inclusive);

        ranges.add_range(SerializedTableRange::new(point(5), point(8), true, false));
        let (border, inclusive) = ranges.right_border().unwrap();
        assert_eq!(border, &point(8));
        assert!(!inclusive);

        ranges.make_full_point(point(2));
        let (border, inclusive) = ranges.right_border().unwrap();
        assert_eq!(border, &point(2));
        assert!(inclusive);
    }

    #[test]
    fn test_serialize_source_points_or_ranges() {
        let only_points = points(&[1, 2]);
        let proto = only_points.serialize_to_source(true);
        assert_eq!(proto.key_points.len(), 2);
        assert!(proto.key_ranges.is_empty());

        // Points are downgraded to `[x, x]` ranges when not allowed.
        let proto = only_points.serialize_to_source(false);
        assert!(proto.key_points.is_empty());
        assert_eq!(proto.key_ranges.len(), 2);
        assert!(proto.key_ranges[0].from_inclusive && proto.key_ranges[0].to_inclusive);
        assert_eq!(proto.key_ranges[0].from, proto.key_ranges[0].to);

        // A single range in the mix forces the range form for everything.
        let mut mixed = points(&[1]);
        mixed.add_range(SerializedTableRange::new(point(3), point(4), true, true));
        let proto = mixed.serialize_to_source(true);
        assert!(proto.key_points.is_empty());
        assert_eq!(proto.key_ranges.len(), 2);
    }

    #[test]
    fn test_serialize_data_task_keeps_points() {
        use tidewave_pb::task::key_range::Kind;

        let mut ranges = points(&[7]);
        ranges.add_range(SerializedTableRange::new(point(9), point(12), true, true));
        match ranges.serialize_to_data_task().kind.unwrap() {
            Kind::Ranges(r) => {
                assert_eq!(r.key_points.len(), 1);
                assert_eq!(r.key_ranges.len(), 1);
            }
            Kind::FullRange(_) => panic!("expected ranges"),
        }
    }
}
