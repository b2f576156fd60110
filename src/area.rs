//! Administrative and ecological area lookup.
//!
//! [`AreaIndex`] keeps every area's bounding box in an R-tree so a point
//! query only tests the polygons whose boxes touch the point. The index is
//! immutable after [`AreaIndex::load`] and is shared between harmonization
//! workers without locking.

use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::geometry::{self, Coordinate, Polygon, METERS_PER_DEGREE};

pub type AreaId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaType {
    Country,
    CountryPart,
    Province,
    County,
    Municipality,
    Parish,
    EcologicalRegion,
    ProtectedArea,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub area_type: AreaType,
    pub feature_id: String,
    pub name: String,
    pub geometry: Polygon,
    #[serde(default)]
    pub parent_id: Option<AreaId>,
}

/// Bounding box of one indexed area, `[longitude, latitude]` corners.
#[derive(Debug, Clone)]
struct AreaEnvelope {
    slot: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for AreaEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

#[derive(Debug, Clone)]
pub struct AreaIndex {
    areas: Vec<Area>,
    by_id: HashMap<AreaId, usize>,
    tree: RTree<AreaEnvelope>,
    skipped: usize,
}

impl Default for AreaIndex {
    fn default() -> Self {
        Self {
            areas: Vec::new(),
            by_id: HashMap::new(),
            tree: RTree::new(),
            skipped: 0,
        }
    }
}

impl AreaIndex {
    /// Builds the index. Degenerate polygons and repeated ids are logged and
    /// left out rather than failing the load.
    pub fn load(areas: Vec<Area>) -> Self {
        let mut index = AreaIndex::default();
        let mut envelopes = Vec::with_capacity(areas.len());

        for area in areas {
            if let Some(reason) = geometry::degeneracy(&area.geometry) {
                warn!(
                    area_id = area.id,
                    feature_id = %area.feature_id,
                    reason,
                    "Skipping degenerate area polygon"
                );
                index.skipped += 1;
                continue;
            }
            if index.by_id.contains_key(&area.id) {
                warn!(area_id = area.id, "Skipping area with repeated id");
                index.skipped += 1;
                continue;
            }
            let Some(bbox) = geometry::bbox(&area.geometry) else {
                index.skipped += 1;
                continue;
            };

            let slot = index.areas.len();
            envelopes.push(AreaEnvelope {
                slot,
                envelope: AABB::from_corners(
                    [bbox.min().x, bbox.min().y],
                    [bbox.max().x, bbox.max().y],
                ),
            });
            index.by_id.insert(area.id, slot);
            index.areas.push(area);
        }
        index.tree = RTree::bulk_load(envelopes);

        debug!(
            areas = index.areas.len(),
            skipped = index.skipped,
            "Area index loaded"
        );
        index
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Number of input areas left out of the index.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn get(&self, id: AreaId) -> Option<&Area> {
        self.by_id.get(&id).map(|&slot| &self.areas[slot])
    }

    pub fn parent(&self, area: &Area) -> Option<&Area> {
        area.parent_id.and_then(|id| self.get(id))
    }

    /// Every area, of every type, whose polygon contains `point`, ordered by
    /// type then id.
    pub fn areas_containing(&self, point: &Coordinate) -> Vec<&Area> {
        let at_point = AABB::from_point([point.longitude, point.latitude]);
        let mut hits: Vec<&Area> = self
            .tree
            .locate_in_envelope_intersecting(&at_point)
            .map(|entry| &self.areas[entry.slot])
            .filter(|area| geometry::contains(&area.geometry, point))
            .collect();
        hits.sort_by_key(|a| (a.area_type, a.id));
        hits
    }

    /// The closest area of `area_type` within `max_distance_m`, counting
    /// containment as distance zero. Ties go to the lowest id.
    pub fn nearest_area(
        &self,
        point: &Coordinate,
        area_type: AreaType,
        max_distance_m: f64,
    ) -> Option<&Area> {
        let lat_span = max_distance_m / METERS_PER_DEGREE;
        let lon_span = (max_distance_m
            / (METERS_PER_DEGREE * point.latitude.to_radians().cos().max(0.01)))
        .min(360.0);
        let search = AABB::from_corners(
            [point.longitude - lon_span, point.latitude - lat_span],
            [point.longitude + lon_span, point.latitude + lat_span],
        );

        self.tree
            .locate_in_envelope_intersecting(&search)
            .map(|entry| &self.areas[entry.slot])
            .filter(|area| area.area_type == area_type)
            .map(|area| (geometry::distance_m(&area.geometry, point), area))
            .filter(|(d, _)| *d <= max_distance_m)
            .min_by(|(da, a), (db, b)| da.total_cmp(db).then(a.id.cmp(&b.id)))
            .map(|(_, area)| area)
    }
}
