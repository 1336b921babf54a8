//! Key-space regions and region-keyed maps.
//!
//! A table's key space is ordered bytewise over UTF-8 keys. A [`Region`] is a
//! half-open interval `[left, right)` whose right end may be unbounded.
//! [`RegionMap`] assigns values to non-overlapping regions; it backs both
//! the Raft state's branch map and the executor's shard status report.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A key in the table's key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(pub String);

impl StoreKey {
    /// The smallest key.
    pub fn min() -> Self {
        Self(String::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Exclusive right end of a region. `Unbounded` sorts after every key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<StoreKey>", into = "Option<StoreKey>")]
pub enum RightBound {
    Key(StoreKey),
    Unbounded,
}

impl RightBound {
    /// True if `key` lies strictly below this bound.
    pub fn is_above(&self, key: &StoreKey) -> bool {
        match self {
            RightBound::Key(k) => key < k,
            RightBound::Unbounded => true,
        }
    }
}

impl From<Option<StoreKey>> for RightBound {
    fn from(key: Option<StoreKey>) -> Self {
        key.map_or(RightBound::Unbounded, RightBound::Key)
    }
}

impl From<RightBound> for Option<StoreKey> {
    fn from(bound: RightBound) -> Self {
        match bound {
            RightBound::Key(k) => Some(k),
            RightBound::Unbounded => None,
        }
    }
}

/// Half-open key interval `[left, right)`.
///
/// Ordered by `(left, right)` so it can be part of a map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region {
    pub left: StoreKey,
    pub right: RightBound,
}

impl Region {
    pub fn new(left: impl Into<StoreKey>, right: RightBound) -> Self {
        Self {
            left: left.into(),
            right,
        }
    }

    /// `[left, right)` with a bounded right end.
    pub fn bounded(left: &str, right: &str) -> Self {
        Self::new(left, RightBound::Key(right.into()))
    }

    /// `[left, +inf)`.
    pub fn from_key(left: &str) -> Self {
        Self::new(left, RightBound::Unbounded)
    }

    /// The whole key space.
    pub fn universe() -> Self {
        Self::new(StoreKey::min(), RightBound::Unbounded)
    }

    pub fn is_empty(&self) -> bool {
        !self.right.is_above(&self.left)
    }

    pub fn contains_key(&self, key: &StoreKey) -> bool {
        key >= &self.left && self.right.is_above(key)
    }

    /// The non-empty intersection of two regions, if any.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let left = self.left.clone().max(other.left.clone());
        let right = self.right.clone().min(other.right.clone());
        let region = Region { left, right };
        (!region.is_empty()).then_some(region)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.right {
            RightBound::Key(k) => write!(f, "[{}, {})", self.left, k),
            RightBound::Unbounded => write!(f, "[{}, +inf)", self.left),
        }
    }
}

/// Values assigned to sorted, non-overlapping regions.
///
/// Gaps are allowed; a lookup that touches a gap finds nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionMap<V> {
    entries: Vec<(Region, V)>,
}

impl<V> RegionMap<V> {
    /// A map assigning `value` to all of `domain`.
    pub fn new(domain: Region, value: V) -> Self {
        Self {
            entries: vec![(domain, value)],
        }
    }

    /// Build from entries. Entries are sorted by region; callers must not
    /// pass overlapping regions.
    pub fn from_entries(mut entries: Vec<(Region, V)>) -> Self {
        entries.retain(|(r, _)| !r.is_empty());
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Region, &V)> {
        self.entries.iter().map(|(r, v)| (r, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Call `f` on each piece of `region`, split wherever the covering value
    /// changes. Pieces that fall in a gap are visited with `None`; adjacent
    /// entries holding equal values are visited as one piece.
    pub fn visit(&self, region: &Region, mut f: impl FnMut(&Region, Option<&V>))
    where
        V: PartialEq,
    {
        let mut pieces: Vec<(Region, Option<&V>)> = Vec::new();
        // `None` once the cursor has passed an unbounded right end.
        let mut cursor = Some(region.left.clone());
        for (r, v) in &self.entries {
            let Some(left) = cursor.clone() else { break };
            let rest = Region::new(left, region.right.clone());
            let Some(inner) = r.intersection(&rest) else {
                continue;
            };
            if inner.left > rest.left {
                let gap = Region::new(rest.left, RightBound::Key(inner.left.clone()));
                push_piece(&mut pieces, gap, None);
            }
            cursor = match &inner.right {
                RightBound::Key(k) => Some(k.clone()),
                RightBound::Unbounded => None,
            };
            push_piece(&mut pieces, inner, Some(v));
        }
        if let Some(left) = cursor {
            let tail = Region::new(left, region.right.clone());
            if !tail.is_empty() {
                push_piece(&mut pieces, tail, None);
            }
        }
        for (piece, value) in &pieces {
            f(piece, *value);
        }
    }

    /// Call `f` on every part of the map inside `region`, splitting entries
    /// at the region's boundaries first.
    pub fn visit_mut(&mut self, region: &Region, mut f: impl FnMut(&Region, &mut V))
    where
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.entries.len() + 2);
        for (r, v) in self.entries.drain(..) {
            let Some(inner) = r.intersection(region) else {
                out.push((r, v));
                continue;
            };
            if r.left < inner.left {
                let head = Region::new(r.left.clone(), RightBound::Key(inner.left.clone()));
                out.push((head, v.clone()));
            }
            let tail = match &inner.right {
                RightBound::Key(k) if inner.right < r.right => {
                    Some(Region::new(k.clone(), r.right.clone()))
                }
                _ => None,
            };
            let mut inner_value = v.clone();
            f(&inner, &mut inner_value);
            out.push((inner, inner_value));
            if let Some(tail) = tail {
                out.push((tail, v));
            }
        }
        self.entries = out;
    }
}

fn push_piece<'a, V: PartialEq>(
    pieces: &mut Vec<(Region, Option<&'a V>)>,
    piece: Region,
    value: Option<&'a V>,
) {
    if let Some((last, last_value)) = pieces.last_mut() {
        if *last_value == value && last.right == RightBound::Key(piece.left.clone()) {
            last.right = piece.right;
            return;
        }
    }
    pieces.push((piece, value));
}

impl<V> Default for RegionMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V: Serialize> Serialize for RegionMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for RegionMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<(Region, V)>::deserialize(deserializer)?;
        Ok(Self::from_entries(entries))
    }
}
