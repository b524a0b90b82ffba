//! Piecewise-linear time tables.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValuePoint {
    pub x: f64,
    pub y: f64,
    /// Forces an integrator restart when the table reaches this point.
    #[serde(default)]
    pub restart_solver: bool,
}

impl ValuePoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            restart_solver: false,
        }
    }

    pub fn with_restart(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            restart_solver: true,
        }
    }
}

/// Table of `(x, y)` points over time.
///
/// With `use_derived_values` the table yields the slope of the active segment (0 outside
/// the table), so that a species fed by it follows the tabulated curve. Otherwise it
/// interpolates linearly and clamps at both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFormula {
    points: Vec<ValuePoint>,
    use_derived_values: bool,
    #[serde(skip)]
    slopes: Vec<f64>,
    #[serde(skip)]
    restart_times: Vec<f64>,
}

impl TableFormula {
    pub fn new(points: Vec<ValuePoint>, use_derived_values: bool) -> Result<Self> {
        let mut table = Self {
            points,
            use_derived_values,
            slopes: Vec::new(),
            restart_times: Vec::new(),
        };
        table.cache_values()?;
        Ok(table)
    }

    fn cache_values(&mut self) -> Result<()> {
        let n = self.points.len();
        if self.use_derived_values && n < 2 {
            bail!("Table formula must have at least 2 value points");
        }
        if n == 0 {
            bail!("Table formula must have at least 1 value point");
        }
        if self.points.windows(2).any(|w| !(w[0].x < w[1].x)) {
            bail!("X values of table formula must be strictly increasing");
        }

        self.slopes = self
            .points
            .windows(2)
            .map(|w| (w[1].y - w[0].y) / (w[1].x - w[0].x))
            .collect();

        self.restart_times.clear();
        self.restart_times.push(self.points[0].x);
        for point in &self.points[1..] {
            if point.restart_solver {
                self.restart_times.push(point.x);
            }
        }
        if self.use_derived_values {
            // a slope switching on from zero is a discontinuity of the derived values
            for i in 1..n.saturating_sub(1) {
                if self.slopes[i - 1] != 0.0 || self.slopes[i] == 0.0 {
                    continue;
                }
                if self.points[i].restart_solver {
                    continue;
                }
                self.restart_times.push(self.points[i].x);
            }
        }
        Ok(())
    }

    pub fn points(&self) -> &[ValuePoint] {
        &self.points
    }

    pub fn set_points(&mut self, points: Vec<ValuePoint>) -> Result<()> {
        self.points = points;
        self.cache_values()
    }

    pub fn use_derived_values(&self) -> bool {
        self.use_derived_values
    }

    pub(crate) fn slopes(&self) -> &[f64] {
        &self.slopes
    }

    pub fn restart_times(&self) -> &[f64] {
        &self.restart_times
    }

    pub fn value(&self, time: f64) -> f64 {
        let n = self.points.len();
        if self.use_derived_values {
            if time < self.points[0].x || time >= self.points[n - 1].x {
                return 0.0;
            }
            let segment = self.points.partition_point(|p| p.x <= time);
            return self.slopes[segment - 1];
        }
        if time <= self.points[0].x {
            return self.points[0].y;
        }
        if time >= self.points[n - 1].x {
            return self.points[n - 1].y;
        }
        let segment = self.points.partition_point(|p| p.x <= time);
        let start = &self.points[segment - 1];
        start.y + (time - start.x) * self.slopes[segment - 1]
    }

    /// Slope of the interpolated curve at `x`, 0 outside the table and for derived values.
    pub fn slope_at(&self, x: f64) -> f64 {
        let n = self.points.len();
        if self.use_derived_values || n < 2 || x < self.points[0].x || x >= self.points[n - 1].x {
            return 0.0;
        }
        let segment = self.points.partition_point(|p| p.x <= x);
        self.slopes[segment - 1]
    }

    /// The derived-values table over the same points, i.e. the derivative of this table.
    /// `None` when that derivative vanishes everywhere.
    pub(crate) fn slope_table(&self) -> Option<TableFormula> {
        if self.use_derived_values || self.points.len() < 2 {
            return None;
        }
        TableFormula::new(self.points.clone(), true).ok()
    }

    /// Constant when every slope vanishes (derived values) or every y is equal.
    pub fn is_constant(&self) -> bool {
        if self.use_derived_values {
            return self.slopes.iter().all(|s| *s == 0.0);
        }
        self.points.windows(2).all(|w| w[0].y == w[1].y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn rejects_invalid_point_lists() {
        assert_err_contains(TableFormula::new(vec![], false), "at least 1");
        assert_err_contains(
            TableFormula::new(vec![ValuePoint::new(0.0, 1.0)], true),
            "at least 2",
        );
        assert_err_contains(
            TableFormula::new(
                vec![ValuePoint::new(1.0, 1.0), ValuePoint::new(1.0, 2.0)],
                false,
            ),
            "strictly increasing",
        );
    }

    #[test]
    fn interpolates_and_clamps() {
        let table = TableFormula::new(
            vec![
                ValuePoint::new(0.0, 0.0),
                ValuePoint::new(2.0, 4.0),
                ValuePoint::new(4.0, 0.0),
            ],
            false,
        )
        .unwrap();
        assert_eq!(table.value(-1.0), 0.0);
        assert_eq!(table.value(1.0), 2.0);
        assert_eq!(table.value(2.0), 4.0);
        assert_eq!(table.value(3.0), 2.0);
        assert_eq!(table.value(10.0), 0.0);
        assert!(!table.is_constant());
    }

    #[test]
    fn derived_values_return_segment_slopes() {
        let table = TableFormula::new(
            vec![
                ValuePoint::new(0.0, 0.0),
                ValuePoint::new(1.0, 0.0),
                ValuePoint::new(3.0, 4.0),
                ValuePoint::new(4.0, 4.0),
            ],
            true,
        )
        .unwrap();
        assert_eq!(table.value(-0.5), 0.0);
        assert_eq!(table.value(0.5), 0.0);
        assert_eq!(table.value(1.0), 2.0);
        assert_eq!(table.value(2.0), 2.0);
        assert_eq!(table.value(3.5), 0.0);
        assert_eq!(table.value(4.0), 0.0);
    }

    #[test]
    fn restart_times_include_flagged_points_and_slope_onsets() {
        let table = TableFormula::new(
            vec![
                ValuePoint::new(0.0, 0.0),
                ValuePoint::new(1.0, 0.0),
                ValuePoint::with_restart(3.0, 4.0),
                ValuePoint::new(4.0, 4.0),
            ],
            true,
        )
        .unwrap();
        assert_eq!(table.restart_times(), &[0.0, 3.0, 1.0]);

        let plain = TableFormula::new(
            vec![ValuePoint::new(0.5, 1.0), ValuePoint::new(2.0, 3.0)],
            false,
        )
        .unwrap();
        assert_eq!(plain.restart_times(), &[0.5]);
    }

    #[test]
    fn slopes_follow_the_active_segment() {
        let points = vec![
            ValuePoint::new(0.0, 0.0),
            ValuePoint::new(2.0, 4.0),
            ValuePoint::new(4.0, 0.0),
        ];
        let table = TableFormula::new(points.clone(), false).unwrap();
        assert_eq!(table.slope_at(-1.0), 0.0);
        assert_eq!(table.slope_at(1.0), 2.0);
        assert_eq!(table.slope_at(2.0), -2.0);
        assert_eq!(table.slope_at(4.0), 0.0);

        let slopes = table.slope_table().unwrap();
        assert!(slopes.use_derived_values());
        assert_eq!(slopes.value(1.0), 2.0);
        assert_eq!(slopes.value(3.0), -2.0);

        let derived = TableFormula::new(points, true).unwrap();
        assert_eq!(derived.slope_at(1.0), 0.0);
        assert!(derived.slope_table().is_none());
        let single = TableFormula::new(vec![ValuePoint::new(0.0, 3.0)], false).unwrap();
        assert!(single.slope_table().is_none());
    }
}
