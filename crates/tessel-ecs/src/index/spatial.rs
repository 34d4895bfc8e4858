//! Spatial index over entity positions.
//!
//! Entities come in two flavours:
//!
//! - **Point entries** (a position and no size) are bucketed into a uniform
//!   grid of cubic cells, so a query only visits the cells its bounds touch.
//! - **Bounded entries** (a position plus a size) are kept in a separate map
//!   and tested exactly against every query. They are rare compared to
//!   points, and bucketing a large box would smear it across many cells.
//!
//! By default the shape comes from two components: `position {"v": [x, y, z]}`
//! and an optional `size {"v": [w, h, d]}`. The box is anchored at its base:
//! centered on `position` in x and z, extending upward from `position` in y.
//! An entity without a usable position is simply absent from the index.
//!
//! Query semantics:
//!
//! - [`scan_sphere`](SpatialIndex::scan_sphere): points within `radius`
//!   (inclusive); boxes whose closest point is within `radius`.
//! - [`scan_aabb`](SpatialIndex::scan_aabb): points in `[min, max)`; boxes
//!   overlapping the query box.
//! - [`scan_point`](SpatialIndex::scan_point): points at exactly that spot;
//!   boxes containing it.
//!
//! Results are sorted by id.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::ComponentMatcher;
use crate::entity::{Entity, EntityId};
use crate::index::SecondaryIndex;

pub type Vec3 = [f64; 3];

type Cell = [i64; 3];

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// A box of `size` standing on `base`: centered in x and z, rising in y.
    pub fn from_base(base: Vec3, size: Vec3) -> Self {
        Self {
            min: [base[0] - size[0] / 2.0, base[1], base[2] - size[2] / 2.0],
            max: [base[0] + size[0] / 2.0, base[1] + size[1], base[2] + size[2] / 2.0],
        }
    }

    /// Closed containment.
    pub fn contains(&self, p: Vec3) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] <= self.max[i])
    }

    /// Containment in `[min, max)`.
    pub fn contains_half_open(&self, p: Vec3) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] < self.max[i])
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.min[i] <= other.max[i] && other.min[i] <= self.max[i])
    }

    /// Squared distance from `p` to the nearest point of the box.
    pub fn distance_sq_to(&self, p: Vec3) -> f64 {
        (0..3)
            .map(|i| {
                let d = if p[i] < self.min[i] {
                    self.min[i] - p[i]
                } else if p[i] > self.max[i] {
                    p[i] - self.max[i]
                } else {
                    0.0
                };
                d * d
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Point(Vec3),
    Bounded(Aabb),
}

/// Extracts an entity's shape; `None` means "not spatial".
pub type ShapeExtractor = Box<dyn Fn(&Entity) -> Option<Shape> + Send + Sync>;

fn read_vec3(value: &serde_json::Value) -> Option<Vec3> {
    let v = value.get("v")?.as_array()?;
    if v.len() != 3 {
        return None;
    }
    let mut out = [0.0; 3];
    for (slot, n) in out.iter_mut().zip(v) {
        let n = n.as_f64()?;
        if !n.is_finite() {
            return None;
        }
        *slot = n;
    }
    Some(out)
}

/// The default extractor over `position` and optional `size`.
pub fn position_shape(entity: &Entity) -> Option<Shape> {
    let position = read_vec3(entity.get("position")?)?;
    match entity.get("size").and_then(read_vec3) {
        Some(size) => Some(Shape::Bounded(Aabb::from_base(position, size))),
        None => Some(Shape::Point(position)),
    }
}

// ---------------------------------------------------------------------------
// SpatialIndexConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialIndexConfig {
    /// Edge length of a grid cell. Must be positive and finite.
    pub cell_size: f64,
}

impl Default for SpatialIndexConfig {
    /// 32-unit cells.
    fn default() -> Self {
        Self { cell_size: 32.0 }
    }
}

// ---------------------------------------------------------------------------
// SpatialIndex
// ---------------------------------------------------------------------------

pub struct SpatialIndex {
    cell_size: f64,
    matcher: ComponentMatcher,
    extract: ShapeExtractor,
    cells: HashMap<Cell, BTreeSet<EntityId>>,
    points: HashMap<EntityId, Vec3>,
    bounded: BTreeMap<EntityId, Aabb>,
}

impl SpatialIndex {
    /// Index `position`/`size` components.
    pub fn new(config: SpatialIndexConfig) -> Self {
        Self::with_extractor(config, ComponentMatcher::new(["position"]), position_shape)
    }

    /// Index entities matching `matcher` by a custom shape.
    pub fn with_extractor(
        config: SpatialIndexConfig,
        matcher: ComponentMatcher,
        extract: impl Fn(&Entity) -> Option<Shape> + Send + Sync + 'static,
    ) -> Self {
        let cell_size = if config.cell_size.is_finite() && config.cell_size > 0.0 {
            config.cell_size
        } else {
            tracing::warn!(
                cell_size = config.cell_size,
                "invalid spatial cell size, using default"
            );
            SpatialIndexConfig::default().cell_size
        };
        Self {
            cell_size,
            matcher,
            extract: Box::new(extract),
            cells: HashMap::new(),
            points: HashMap::new(),
            bounded: BTreeMap::new(),
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.points.contains_key(&id) || self.bounded.contains_key(&id)
    }

    pub fn shape_of(&self, id: EntityId) -> Option<Shape> {
        if let Some(p) = self.points.get(&id) {
            return Some(Shape::Point(*p));
        }
        self.bounded.get(&id).map(|b| Shape::Bounded(*b))
    }

    /// Number of occupied grid cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn scan_sphere(&self, center: Vec3, radius: f64) -> Vec<EntityId> {
        if radius.is_nan() || radius < 0.0 {
            return Vec::new();
        }
        let r2 = radius * radius;
        let lo = [center[0] - radius, center[1] - radius, center[2] - radius];
        let hi = [center[0] + radius, center[1] + radius, center[2] + radius];
        let mut out = BTreeSet::new();
        self.scan_points(lo, hi, |p| dist_sq(p, center) <= r2, &mut out);
        for (id, b) in &self.bounded {
            if b.distance_sq_to(center) <= r2 {
                out.insert(*id);
            }
        }
        out.into_iter().collect()
    }

    pub fn scan_aabb(&self, query: Aabb) -> Vec<EntityId> {
        let mut out = BTreeSet::new();
        self.scan_points(query.min, query.max, |p| query.contains_half_open(p), &mut out);
        for (id, b) in &self.bounded {
            if b.intersects(&query) {
                out.insert(*id);
            }
        }
        out.into_iter().collect()
    }

    pub fn scan_point(&self, point: Vec3) -> Vec<EntityId> {
        let mut out = BTreeSet::new();
        self.scan_points(point, point, |p| p == point, &mut out);
        for (id, b) in &self.bounded {
            if b.contains(point) {
                out.insert(*id);
            }
        }
        out.into_iter().collect()
    }

    fn cell_of(&self, p: Vec3) -> Cell {
        [
            (p[0] / self.cell_size).floor() as i64,
            (p[1] / self.cell_size).floor() as i64,
            (p[2] / self.cell_size).floor() as i64,
        ]
    }

    /// Visit point entries in the cells covering `[lo, hi]`, falling back to a
    /// linear scan when the cell range outnumbers the points.
    fn scan_points(
        &self,
        lo: Vec3,
        hi: Vec3,
        keep: impl Fn(Vec3) -> bool,
        out: &mut BTreeSet<EntityId>,
    ) {
        let lo_cell = self.cell_of(lo);
        let hi_cell = self.cell_of(hi);
        let span: f64 = (0..3)
            .map(|i| (hi_cell[i] as f64 - lo_cell[i] as f64 + 1.0).max(0.0))
            .product();

        if span > self.points.len() as f64 {
            for (id, p) in &self.points {
                if keep(*p) {
                    out.insert(*id);
                }
            }
            return;
        }

        for x in lo_cell[0]..=hi_cell[0] {
            for y in lo_cell[1]..=hi_cell[1] {
                for z in lo_cell[2]..=hi_cell[2] {
                    let Some(ids) = self.cells.get(&[x, y, z]) else {
                        continue;
                    };
                    for id in ids {
                        if let Some(p) = self.points.get(id) {
                            if keep(*p) {
                                out.insert(*id);
                            }
                        }
                    }
                }
            }
        }
    }

    fn remove(&mut self, id: EntityId) {
        if let Some(p) = self.points.remove(&id) {
            let cell = self.cell_of(p);
            if let Some(ids) = self.cells.get_mut(&cell) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.cells.remove(&cell);
                }
            }
        }
        self.bounded.remove(&id);
    }
}

fn dist_sq(a: Vec3, b: Vec3) -> f64 {
    (0..3).map(|i| (a[i] - b[i]) * (a[i] - b[i])).sum()
}

impl SecondaryIndex for SpatialIndex {
    fn update(&mut self, _old: Option<&Entity>, new: &Entity) {
        let id = new.id;
        self.remove(id);
        if !self.matcher.matches(new) {
            return;
        }
        match (self.extract)(new) {
            Some(Shape::Point(p)) => {
                let cell = self.cell_of(p);
                self.cells.entry(cell).or_default().insert(id);
                self.points.insert(id, p);
            }
            Some(Shape::Bounded(b)) => {
                self.bounded.insert(id, b);
            }
            None => {}
        }
    }

    fn delete(&mut self, id: EntityId) {
        self.remove(id);
    }

    fn clear(&mut self) {
        self.cells.clear();
        self.points.clear();
        self.bounded.clear();
    }

    fn len(&self) -> usize {
        self.points.len() + self.bounded.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("cell_size", &self.cell_size)
            .field("points", &self.points.len())
            .field("bounded", &self.bounded.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: u64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn placed(raw: u64, p: Vec3, size: Option<Vec3>) -> Entity {
        let e = Entity::new(id(raw)).with("position", json!({ "v": p }));
        match size {
            Some(s) => e.with("size", json!({ "v": s })),
            None => e,
        }
    }

    /// Index with the given entries plus far-away filler so queries take the
    /// cell-walking path rather than the linear fallback.
    fn index_with(entries: &[(Vec3, Option<Vec3>)]) -> SpatialIndex {
        let mut index = SpatialIndex::new(SpatialIndexConfig::default());
        for (i, (p, s)) in entries.iter().enumerate() {
            index.update(None, &placed(i as u64 + 1, *p, *s));
        }
        for i in 0..500 {
            index.update(None, &placed(10_000 + i, [20000.0; 3], None));
        }
        index
    }

    fn ids(raw: &[u64]) -> Vec<EntityId> {
        raw.iter().map(|r| id(*r)).collect()
    }

    #[test]
    fn sphere_radius_is_inclusive() {
        let index = index_with(&[([0.0, 0.0, 2.0], None), ([0.0, 0.0, 3.0], None)]);
        assert!(index.scan_sphere([0.0; 3], 1.0).is_empty());
        assert_eq!(index.scan_sphere([0.0; 3], 2.0), ids(&[1]));
        assert_eq!(index.scan_sphere([0.0; 3], 3.0), ids(&[1, 2]));
    }

    #[test]
    fn aabb_scan_is_half_open() {
        let index = index_with(&[
            ([0.0, 0.0, 2.0], None),
            ([0.0, 0.0, 4.0], None),
            ([0.0, 0.0, -5.0], None),
        ]);
        let q = |lo: f64, hi: f64| Aabb::new([lo; 3], [hi; 3]);
        assert!(index.scan_aabb(q(-2.0, 2.0)).is_empty());
        assert_eq!(index.scan_aabb(q(-3.0, 3.0)), ids(&[1]));
        assert_eq!(index.scan_aabb(q(-4.0, 4.0)), ids(&[1]));
        assert_eq!(
            index.scan_aabb(Aabb::new([-4.0; 3], [4.0, 4.0, 4.0001])),
            ids(&[1, 2])
        );
        assert_eq!(index.scan_aabb(q(-5.0, 5.0)), ids(&[1, 2, 3]));
    }

    #[test]
    fn crosses_cell_boundaries() {
        let index = index_with(&[([33.0, 33.0, 33.0], None), ([0.0, 0.0, 65.0], None)]);
        let diag = (3.0f64 * 4.0).sqrt();
        assert!(index.scan_sphere([31.0; 3], diag - 0.1).is_empty());
        assert_eq!(index.scan_sphere([31.0; 3], diag + 0.1), ids(&[1]));
        assert!(index.scan_sphere([0.0; 3], 57.0).is_empty());
        assert_eq!(index.scan_sphere([0.0; 3], 65.0), ids(&[1, 2]));
    }

    #[test]
    fn bounded_entries_use_exact_distance() {
        // Box standing on z=4..6 after centering in z.
        let index = index_with(&[([0.0, 0.0, 5.0], Some([1.0, 1.0, 2.0]))]);
        assert_eq!(index.scan_sphere([0.0; 3], 4.0), ids(&[1]));
        assert_eq!(index.scan_sphere([0.0, 0.0, 8.0], 2.0), ids(&[1]));
        assert!(index.scan_sphere([0.0, 0.0, 8.0], 1.0).is_empty());
        assert_eq!(index.scan_sphere([0.0, 0.0, 5.0], 0.1), ids(&[1]));
        assert_eq!(index.scan_point([0.0, 0.5, 5.0]), ids(&[1]));
    }

    #[test]
    fn moving_a_box_moves_its_hits() {
        let mut index = index_with(&[([0.0, -0.5, 0.0], Some([1.0; 3]))]);
        assert_eq!(index.scan_sphere([0.0, 0.0, -1.0], 0.5), ids(&[1]));

        let before = placed(1, [0.0, -0.5, 0.0], Some([1.0; 3]));
        let after = placed(1, [0.0, -0.5, 1.0], Some([1.0; 3]));
        index.update(Some(&before), &after);
        assert!(index.scan_sphere([0.0, 0.0, -1.0], 0.5).is_empty());
        assert_eq!(index.scan_sphere([0.0, 0.0, 1.5], 0.5), ids(&[1]));

        index.delete(id(1));
        assert!(index.scan_sphere([0.0; 3], 1.0).is_empty());
    }

    #[test]
    fn losing_position_is_a_delete() {
        let mut index = SpatialIndex::new(SpatialIndexConfig::default());
        let placed_e = placed(1, [1.0, 1.0, 1.0], None);
        index.update(None, &placed_e);
        assert_eq!(index.scan_point([1.0; 3]), ids(&[1]));

        let unplaced = Entity::new(id(1)).with("hp", json!(3));
        index.update(Some(&placed_e), &unplaced);
        assert!(index.scan_sphere([1.0; 3], 5.0).is_empty());
        assert_eq!(index.cell_count(), 0);
        assert!(!index.contains(id(1)));
    }

    #[test]
    fn malformed_position_is_absent_not_an_error() {
        let mut index = SpatialIndex::new(SpatialIndexConfig::default());
        let e = Entity::new(id(1)).with("position", json!({ "v": [1, 2] }));
        index.update(None, &e);
        assert!(index.is_empty());
    }

    #[test]
    fn linear_fallback_agrees_with_cell_walk() {
        let mut sparse = SpatialIndex::new(SpatialIndexConfig { cell_size: 1.0 });
        sparse.update(None, &placed(1, [0.0, 0.0, 10.0], None));
        // Radius 50 with 1-unit cells covers far more cells than points.
        assert_eq!(sparse.scan_sphere([0.0; 3], 50.0), ids(&[1]));
    }
}
