//! Sensitivity classification and coordinate generalization.
//!
//! A sensitive observation keeps its true coordinate internally, but the
//! coordinate it exposes publicly is the centre of a coarse grid cell chosen
//! so that it lies at least the taxon's disturbance radius (or the
//! category's minimum buffer, whichever is larger) away from the true point.
//! Categories above the configured maximum expose no location at all.
//!
//! Generalization is a pure function of its inputs: the grid is anchored at a
//! fixed origin and candidate cells are scanned in a fixed order, so repeated
//! harvests of an unchanged observation produce the identical public point.

use serde::{Deserialize, Serialize};
use std::f64::consts::SQRT_2;

use crate::config::SensitivitySettings;
use crate::geometry::{Coordinate, METERS_PER_DEGREE};
use crate::taxon::TaxonNode;

/// 0 is public; higher is more protected.
pub type SensitivityCategory = u8;

/// How far out from the true cell candidate centres are searched.
const MAX_RING: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disclosure {
    Exact,
    Generalized { cell_size_m: u32 },
    Withheld,
}

/// The location a record may show to non-privileged consumers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublicLocation {
    pub coordinate: Option<Coordinate>,
    pub uncertainty_m: Option<u32>,
    pub disclosure: Disclosure,
}

impl PublicLocation {
    fn withheld() -> Self {
        Self {
            coordinate: None,
            uncertainty_m: None,
            disclosure: Disclosure::Withheld,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapped {
    center: Coordinate,
    distance_m: f64,
    ring: i64,
    cell_m: f64,
}

#[derive(Debug, Clone)]
pub struct SensitivityGeneralizer {
    buffers_m: Vec<u32>,
    max_generalized_category: SensitivityCategory,
    origin: Coordinate,
}

impl SensitivityGeneralizer {
    pub fn new(settings: &SensitivitySettings) -> Self {
        Self {
            buffers_m: settings.category_buffers_m.clone(),
            max_generalized_category: settings.max_generalized_category,
            origin: settings.grid_origin,
        }
    }

    /// The taxon's effective protection level, raised by the provider's hint
    /// when the provider asks for more protection. A hint can never lower it.
    pub fn classify(
        &self,
        taxon: &TaxonNode,
        provider_hint: Option<SensitivityCategory>,
    ) -> SensitivityCategory {
        taxon.protection_level().max(provider_hint.unwrap_or(0))
    }

    pub fn max_generalized_category(&self) -> SensitivityCategory {
        self.max_generalized_category
    }

    /// Computes the public location for `true_coordinate`.
    ///
    /// Category `c` is reached by applying steps `1..=c` in turn, each step
    /// requiring at least the distance the previous one produced, so a higher
    /// category never lands closer to the true point than a lower one.
    pub fn generalize(
        &self,
        true_coordinate: &Coordinate,
        uncertainty_m: Option<u32>,
        taxon: &TaxonNode,
        category: SensitivityCategory,
    ) -> PublicLocation {
        if category == 0 {
            return PublicLocation {
                coordinate: Some(*true_coordinate),
                uncertainty_m,
                disclosure: Disclosure::Exact,
            };
        }
        if category > self.max_generalized_category {
            return PublicLocation::withheld();
        }

        let radius = f64::from(taxon.disturbance_radius_m().unwrap_or(0));
        let mut required = 0.0_f64;
        let mut snapped = None;
        for step in 1..=category {
            let floor_m = self.buffer_m(step).max(radius).max(1.0);
            required = required.max(floor_m);
            match self.snap(true_coordinate, 2.0 * floor_m, required) {
                Some(s) => {
                    required = s.distance_m;
                    snapped = Some(s);
                }
                None => return PublicLocation::withheld(),
            }
        }

        let Some(s) = snapped else {
            return PublicLocation::withheld();
        };
        let covering = (s.cell_m * SQRT_2 * (s.ring + 1) as f64).ceil() as u32;
        PublicLocation {
            coordinate: Some(s.center),
            uncertainty_m: Some(uncertainty_m.unwrap_or(0).max(covering)),
            disclosure: Disclosure::Generalized {
                cell_size_m: s.cell_m.round() as u32,
            },
        }
    }

    fn buffer_m(&self, category: SensitivityCategory) -> f64 {
        let index = usize::from(category.saturating_sub(1));
        self.buffers_m
            .get(index)
            .or(self.buffers_m.last())
            .map_or(0.0, |&b| f64::from(b))
    }

    /// Closest cell centre at least `required_m` from `point`, searching ring
    /// by ring outwards from the point's own cell.
    fn snap(&self, point: &Coordinate, cell_m: f64, required_m: f64) -> Option<Snapped> {
        let row_height = cell_m / METERS_PER_DEGREE;
        let row = ((point.latitude - self.origin.latitude) / row_height).floor() as i64;

        for ring in 0..=MAX_RING {
            let mut best: Option<(f64, Coordinate)> = None;
            for dr in -ring..=ring {
                for dc in -ring..=ring {
                    if dr.abs().max(dc.abs()) != ring {
                        continue;
                    }
                    let Some(center) = self.cell_center(point, row + dr, dc, cell_m, row_height)
                    else {
                        continue;
                    };
                    let d = point.distance_m(&center);
                    if d >= required_m && best.map_or(true, |(bd, _)| d < bd) {
                        best = Some((d, center));
                    }
                }
            }
            if let Some((distance_m, center)) = best {
                return Some(Snapped {
                    center,
                    distance_m,
                    ring,
                    cell_m,
                });
            }
        }
        None
    }

    /// Centre of the cell in `row`, `col_offset` columns from the column
    /// containing `point`. Column width is fixed per row from the row's
    /// centre latitude.
    fn cell_center(
        &self,
        point: &Coordinate,
        row: i64,
        col_offset: i64,
        cell_m: f64,
        row_height: f64,
    ) -> Option<Coordinate> {
        let latitude = self.origin.latitude + (row as f64 + 0.5) * row_height;
        if latitude.abs() >= 90.0 {
            return None;
        }
        let width = cell_m / (METERS_PER_DEGREE * latitude.to_radians().cos());
        if !width.is_finite() || width >= 360.0 {
            return None;
        }
        let col = ((point.longitude - self.origin.longitude) / width).floor() as i64 + col_offset;
        let longitude = self.origin.longitude + (col as f64 + 0.5) * width;
        let longitude = (longitude + 180.0).rem_euclid(360.0) - 180.0;
        Some(Coordinate::new(latitude, longitude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxon::{Taxon, TaxonGraph};
    use proptest::prelude::*;

    fn generalizer() -> SensitivityGeneralizer {
        SensitivityGeneralizer::new(&SensitivitySettings::default())
    }

    fn taxon(protection_level: u8, disturbance_radius_m: Option<u32>) -> TaxonNode {
        let graph = TaxonGraph::build(
            vec![Taxon {
                id: 1,
                scientific_name: "Haliaeetus albicilla".into(),
                rank: "species".into(),
                protection_level,
                disturbance_radius_m,
            }],
            &[],
        )
        .unwrap();
        graph.get(1).unwrap().clone()
    }

    #[test]
    fn test_public_category_is_exact() {
        let point = Coordinate::new(59.0, 18.0);
        let public = generalizer().generalize(&point, Some(25), &taxon(0, None), 0);
        assert_eq!(public.coordinate, Some(point));
        assert_eq!(public.uncertainty_m, Some(25));
        assert_eq!(public.disclosure, Disclosure::Exact);
    }

    #[test]
    fn test_generalization_is_deterministic_and_far_enough() {
        let g = generalizer();
        let t = taxon(1, Some(1000));
        let point = Coordinate::new(59.0, 18.0);

        let first = g.generalize(&point, None, &t, 1);
        let second = g.generalize(&point, None, &t, 1);
        assert_eq!(first, second);

        let public = first.coordinate.unwrap();
        assert_eq!(
            public.latitude.to_bits(),
            second.coordinate.unwrap().latitude.to_bits()
        );
        assert!(point.distance_m(&public) >= 1000.0);
        assert!(first.uncertainty_m.unwrap() >= (2000.0 * SQRT_2) as u32);
        assert_eq!(first.disclosure, Disclosure::Generalized { cell_size_m: 2000 });
    }

    #[test]
    fn test_disturbance_radius_overrides_smaller_buffer() {
        let g = generalizer();
        let point = Coordinate::new(62.5, 15.25);
        let public = g.generalize(&point, Some(10), &taxon(1, Some(8000)), 1);
        assert!(point.distance_m(&public.coordinate.unwrap()) >= 8000.0);
    }

    #[test]
    fn test_category_above_maximum_is_withheld() {
        let g = generalizer();
        let public = g.generalize(&Coordinate::new(59.0, 18.0), Some(10), &taxon(5, None), 5);
        assert_eq!(public.coordinate, None);
        assert_eq!(public.uncertainty_m, None);
        assert_eq!(public.disclosure, Disclosure::Withheld);
    }

    #[test]
    fn test_provider_hint_only_raises() {
        let g = generalizer();
        let t = taxon(3, None);
        assert_eq!(g.classify(&t, None), 3);
        assert_eq!(g.classify(&t, Some(1)), 3);
        assert_eq!(g.classify(&t, Some(4)), 4);
    }

    proptest! {
        #[test]
        fn provider_hint_never_lowers_taxon_baseline(level in 0_u8..6, hint in proptest::option::of(0_u8..6)) {
            let g = generalizer();
            let category = g.classify(&taxon(level, None), hint);
            prop_assert!(category >= level);
            prop_assert!(category >= hint.unwrap_or(0));
        }

        #[test]
        fn higher_category_is_never_closer(
            lat in -60.0_f64..60.0,
            lon in -170.0_f64..170.0,
            radius in proptest::option::of(0_u32..20_000),
            low in 0_u8..5,
            bump in 1_u8..5,
        ) {
            let g = generalizer();
            let t = taxon(0, radius);
            let point = Coordinate::new(lat, lon);
            let high = low.saturating_add(bump);

            let lower = g.generalize(&point, None, &t, low);
            let higher = g.generalize(&point, None, &t, high);
            match (lower.coordinate, higher.coordinate) {
                (Some(a), Some(b)) => prop_assert!(point.distance_m(&b) >= point.distance_m(&a)),
                (None, Some(_)) => prop_assert!(false, "lower category withheld but higher disclosed"),
                _ => {}
            }
            if let Some(c) = lower.coordinate {
                if low > 0 {
                    let floor = f64::from(radius.unwrap_or(0).max(1000));
                    prop_assert!(point.distance_m(&c) >= floor);
                }
            }
        }
    }
}
