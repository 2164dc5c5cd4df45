//! Uniform bucket grid for bounded-radius neighbor queries.

use std::collections::HashMap;

use crate::OsmCandidate;

/// Anything with a planar position.
pub trait Located {
    fn xy(&self) -> (f64, f64);
}

impl Located for OsmCandidate {
    fn xy(&self) -> (f64, f64) {
        (self.cx, self.cy)
    }
}

impl Located for (f64, f64) {
    fn xy(&self) -> (f64, f64) {
        *self
    }
}

type Cell = (i64, i64);

/// Read-only bucket index over a borrowed candidate slice.
///
/// Built once per tile; there is no insert or delete after construction.
#[derive(Debug)]
pub struct GridIndex<'a, T> {
    cell_m: f64,
    buckets: HashMap<Cell, Vec<&'a T>>,
    /// Min and max occupied cell, `None` when empty.
    extent: Option<(Cell, Cell)>,
}

impl<'a, T: Located> GridIndex<'a, T> {
    /// `cell_m` must be finite and positive; callers validate it upfront.
    pub fn build(items: &'a [T], cell_m: f64) -> Self {
        let mut buckets: HashMap<Cell, Vec<&'a T>> = HashMap::new();
        let mut extent: Option<(Cell, Cell)> = None;
        for item in items {
            let (x, y) = item.xy();
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            let cell = cell_of(x, y, cell_m);
            extent = Some(match extent {
                None => (cell, cell),
                Some((lo, hi)) => (
                    (lo.0.min(cell.0), lo.1.min(cell.1)),
                    (hi.0.max(cell.0), hi.1.max(cell.1)),
                ),
            });
            buckets.entry(cell).or_default().push(item);
        }
        Self {
            cell_m,
            buckets,
            extent,
        }
    }

    pub fn cell_m(&self) -> f64 {
        self.cell_m
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of Chebyshev rings around the query cell needed so the visited
    /// block covers `radius` in every direction.
    pub fn rings_for(&self, radius: f64) -> i64 {
        if !radius.is_finite() || radius <= 0.0 {
            return 1;
        }
        ((radius / self.cell_m).ceil() as i64).max(1)
    }

    /// Every item in the cells covering a disc of `radius` around `(x, y)`.
    ///
    /// Cells are visited ring by ring (own cell, then the 3x3 block, ...).
    /// The result is a superset; callers filter by true distance. Rings
    /// beyond the farthest occupied cell are not visited.
    pub fn neighbors(&self, x: f64, y: f64, radius: f64) -> impl Iterator<Item = &'a T> + '_ {
        let (cx, cy) = cell_of(x, y, self.cell_m);
        let rings = match self.extent {
            Some(((min_x, min_y), (max_x, max_y))) => {
                let farthest = (cx - min_x)
                    .abs()
                    .max((max_x - cx).abs())
                    .max((cy - min_y).abs())
                    .max((max_y - cy).abs());
                self.rings_for(radius).min(farthest)
            }
            None => -1,
        };
        (0..=rings)
            .flat_map(move |k| ring_cells(cx, cy, k))
            .filter_map(move |cell| self.buckets.get(&cell))
            .flat_map(|bucket| bucket.iter().copied())
    }
}

fn cell_of(x: f64, y: f64, cell_m: f64) -> Cell {
    ((x / cell_m).floor() as i64, (y / cell_m).floor() as i64)
}

/// Perimeter cells of ring `k`, column by column.
fn ring_cells(cx: i64, cy: i64, k: i64) -> impl Iterator<Item = Cell> {
    (-k..=k).flat_map(move |dx| {
        let step = if dx.abs() == k { 1 } else { (2 * k).max(1) as usize };
        (-k..=k).step_by(step).map(move |dy| (cx + dx, cy + dy))
    })
}
