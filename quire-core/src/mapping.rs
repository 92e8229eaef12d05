//! Position mapping through document changes.
//!
//! A [`StepMap`] describes how one step moved positions around: a list of
//! `(start, old_size, new_size)` ranges in ascending order. A [`Mapping`]
//! chains step maps and records *mirror* pairs: a map and the map that
//! undoes it. When a position falls inside content deleted by one half of a
//! mirror pair, mapping jumps straight to the other half and recovers the
//! exact offset, instead of collapsing the position to the edge of the
//! deleted range.

const DEL_BEFORE: u8 = 1;
const DEL_AFTER: u8 = 2;
const DEL_ACROSS: u8 = 4;
const DEL_SIDE: u8 = 8;

/// Which side a position sticks to when content is inserted exactly at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Before,
    After,
}

impl Assoc {
    fn is_before(self) -> bool {
        self == Assoc::Before
    }
}

/// Token identifying a position inside a replaced range, usable with
/// [`StepMap::recover`] on the mirror map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recover {
    pub index: usize,
    pub offset: usize,
}

/// Detailed result of mapping a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    del_info: u8,
    pub recover: Option<Recover>,
}

impl MapResult {
    fn new(pos: usize, del_info: u8, recover: Option<Recover>) -> Self {
        Self {
            pos,
            del_info,
            recover,
        }
    }

    /// The content on the side the position is associated with was deleted.
    pub fn deleted(&self) -> bool {
        self.del_info & DEL_SIDE > 0
    }

    pub fn deleted_before(&self) -> bool {
        self.del_info & (DEL_BEFORE | DEL_ACROSS) > 0
    }

    pub fn deleted_after(&self) -> bool {
        self.del_info & (DEL_AFTER | DEL_ACROSS) > 0
    }

    /// The position was strictly inside a deleted range.
    pub fn deleted_across(&self) -> bool {
        self.del_info & DEL_ACROSS > 0
    }
}

/// Anything positions can be mapped through.
pub trait Mappable {
    fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult;

    fn map(&self, pos: usize, assoc: Assoc) -> usize {
        self.map_result(pos, assoc).pos
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    start: usize,
    old_size: usize,
    new_size: usize,
}

/// Position map of a single step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMap {
    ranges: Vec<Range>,
    inverted: bool,
}

impl StepMap {
    /// Build a map from `(start, old_size, new_size)` triples.
    pub fn new(ranges: &[(usize, usize, usize)]) -> Self {
        Self {
            ranges: ranges
                .iter()
                .filter(|(_, old, new)| *old > 0 || *new > 0)
                .map(|&(start, old_size, new_size)| Range {
                    start,
                    old_size,
                    new_size,
                })
                .collect(),
            inverted: false,
        }
    }

    /// The identity map.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn sizes(&self, range: &Range) -> (usize, usize) {
        if self.inverted {
            (range.new_size, range.old_size)
        } else {
            (range.old_size, range.new_size)
        }
    }

    /// Map a position lying inside a range of this map, identified by the
    /// recover token of the mirrored map.
    pub fn recover(&self, value: Recover) -> usize {
        let mut diff: isize = 0;
        if !self.inverted {
            for range in self.ranges.iter().take(value.index) {
                diff += range.new_size as isize - range.old_size as isize;
            }
        }
        let start = self.ranges.get(value.index).map_or(0, |r| r.start);
        offset(start, diff) + value.offset
    }

    /// Call `f(old_start, old_end, new_start, new_end)` for each changed range.
    pub fn for_each(&self, mut f: impl FnMut(usize, usize, usize, usize)) {
        let mut diff: isize = 0;
        for range in &self.ranges {
            let (old_size, new_size) = self.sizes(range);
            let start = range.start;
            let old_start = if self.inverted { offset(start, -diff) } else { start };
            let new_start = offset(old_start, diff);
            f(old_start, old_start + old_size, new_start, new_start + new_size);
            diff += new_size as isize - old_size as isize;
        }
    }

    pub fn invert(&self) -> StepMap {
        StepMap {
            ranges: self.ranges.clone(),
            inverted: !self.inverted,
        }
    }
}

fn offset(pos: usize, diff: isize) -> usize {
    pos.saturating_add_signed(diff)
}

impl Mappable for StepMap {
    fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut diff: isize = 0;
        for (index, range) in self.ranges.iter().enumerate() {
            let start = if self.inverted {
                offset(range.start, -diff)
            } else {
                range.start
            };
            if start > pos {
                break;
            }
            let (old_size, new_size) = self.sizes(range);
            let end = start + old_size;
            if pos <= end {
                let before = if old_size == 0 {
                    assoc.is_before()
                } else if pos == start {
                    true
                } else if pos == end {
                    false
                } else {
                    assoc.is_before()
                };
                let result = offset(start, diff) + if before { 0 } else { new_size };
                let edge = if assoc.is_before() { start } else { end };
                let recover = if pos == edge {
                    None
                } else {
                    Some(Recover {
                        index,
                        offset: pos - start,
                    })
                };
                let mut del = if pos == start {
                    DEL_AFTER
                } else if pos == end {
                    DEL_BEFORE
                } else {
                    DEL_ACROSS
                };
                if if assoc.is_before() { pos != start } else { pos != end } {
                    del |= DEL_SIDE;
                }
                return MapResult::new(result, del, recover);
            }
            diff += new_size as isize - old_size as isize;
        }
        MapResult::new(offset(pos, diff), 0, None)
    }
}

/// A chain of step maps with mirror information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    maps: Vec<StepMap>,
    mirror: Vec<(usize, usize)>,
    from: usize,
    to: usize,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_maps(maps: Vec<StepMap>) -> Self {
        let to = maps.len();
        Self {
            maps,
            mirror: Vec::new(),
            from: 0,
            to,
        }
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// A mapping over the maps in `from..`, sharing mirror information.
    pub fn slice(&self, from: usize) -> Mapping {
        self.slice_range(from, self.maps.len())
    }

    pub fn slice_range(&self, from: usize, to: usize) -> Mapping {
        let to = to.min(self.maps.len());
        Mapping {
            maps: self.maps.clone(),
            mirror: self.mirror.clone(),
            from: from.min(to),
            to,
        }
    }

    /// Add a step map to the end. `mirror` is the index of the map it undoes.
    pub fn append_map(&mut self, map: StepMap, mirror: Option<usize>) {
        self.maps.push(map);
        self.to = self.maps.len();
        if let Some(mirror) = mirror {
            self.set_mirror(self.maps.len() - 1, mirror);
        }
    }

    /// Append all maps of another mapping, keeping its internal mirrors.
    pub fn append_mapping(&mut self, other: &Mapping) {
        let start_size = self.maps.len();
        for (i, map) in other.maps.iter().enumerate() {
            let mirror = other.get_mirror(i).filter(|m| *m < i).map(|m| start_size + m);
            self.append_map(map.clone(), mirror);
        }
    }

    /// Append the inverse of every map of another mapping, last map first.
    pub fn append_mapping_inverted(&mut self, other: &Mapping) {
        let total = self.maps.len() + other.maps.len();
        for i in (0..other.maps.len()).rev() {
            let mirror = other
                .get_mirror(i)
                .filter(|m| *m > i)
                .map(|m| total - m - 1);
            self.append_map(other.maps[i].invert(), mirror);
        }
    }

    pub fn invert(&self) -> Mapping {
        let mut inverse = Mapping::new();
        inverse.append_mapping_inverted(self);
        inverse
    }

    /// Record that map `n` and map `m` undo each other.
    pub fn set_mirror(&mut self, n: usize, m: usize) {
        self.mirror.push((n, m));
    }

    pub fn get_mirror(&self, n: usize) -> Option<usize> {
        self.mirror.iter().find_map(|&(a, b)| {
            if a == n {
                Some(b)
            } else if b == n {
                Some(a)
            } else {
                None
            }
        })
    }
}

impl Mappable for Mapping {
    fn map_result(&self, pos: usize, assoc: Assoc) -> MapResult {
        let mut pos = pos;
        let mut del_info = 0;
        let mut i = self.from;
        while i < self.to {
            let result = self.maps[i].map_result(pos, assoc);
            if let Some(recover) = result.recover {
                if let Some(corr) = self.get_mirror(i).filter(|c| *c > i && *c < self.to) {
                    pos = self.maps[corr].recover(recover);
                    i = corr + 1;
                    continue;
                }
            }
            del_info |= result.del_info;
            pos = result.pos;
            i += 1;
        }
        MapResult::new(pos, del_info, None)
    }
}
