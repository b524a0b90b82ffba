//! Output schema and the merged schedule of integrator stops.

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

/// Equidistant output interval; a zero-length interval yields its single point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputInterval {
    pub start_time: f64,
    pub end_time: f64,
    pub number_of_time_points: usize,
}

impl OutputInterval {
    pub fn new(start_time: f64, end_time: f64, number_of_time_points: usize) -> Self {
        Self {
            start_time,
            end_time,
            number_of_time_points,
        }
    }

    pub fn time_points(&self) -> anyhow::Result<Vec<f64>> {
        if !(self.start_time <= self.end_time) {
            bail!("Value for start time should be less than or equal to value for end time");
        }
        if self.start_time == self.end_time {
            return Ok(vec![self.start_time]);
        }
        if self.number_of_time_points < 2 {
            bail!("At least 2 points for time interval required");
        }
        let n = self.number_of_time_points;
        let dt = (self.end_time - self.start_time) / (n - 1) as f64;
        let mut points: Vec<f64> = (0..n - 1)
            .map(|i| self.start_time + dt * i as f64)
            .collect();
        points.push(self.end_time);
        Ok(points)
    }
}

/// User-requested output times: intervals plus individual time points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSchema {
    pub intervals: Vec<OutputInterval>,
    pub time_points: Vec<f64>,
}

impl OutputSchema {
    pub fn from_time_points(time_points: Vec<f64>) -> Self {
        Self {
            intervals: Vec::new(),
            time_points,
        }
    }

    pub fn add_interval(&mut self, interval: OutputInterval) {
        self.intervals.push(interval);
    }

    pub fn add_time_point(&mut self, time: f64) {
        self.time_points.push(time);
    }

    /// Every requested time, unsorted and possibly duplicated.
    pub fn all_time_points(&self) -> Result<Vec<f64>> {
        let mut points = self.time_points.clone();
        for interval in &self.intervals {
            let interval_points = interval
                .time_points()
                .map_err(|e| SimulationError::Schedule(e.to_string()))?;
            points.extend(interval_points);
        }
        Ok(points)
    }
}

/// One stop of the integrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputTimePoint {
    pub time: f64,
    /// A genuine user output time whose solution is stored.
    pub save_system_solution: bool,
    /// Switch conditions are expected to flip here.
    pub is_switch_time_point: bool,
    /// A discontinuity (table restart) that requires a cold integrator restart.
    pub restart_system: bool,
}

fn sorted_unique(mut times: Vec<f64>, same: impl Fn(f64, f64) -> bool) -> Vec<f64> {
    times.sort_by(|a, b| a.total_cmp(b));
    times.dedup_by(|b, a| same(*a, *b));
    times
}

fn contains(sorted: &[f64], time: f64) -> bool {
    sorted.binary_search_by(|t| t.total_cmp(&time)).is_ok()
}

/// Merges user output times, switch times and restart times into one ascending,
/// duplicate-free schedule.
///
/// Restart times count as switch times too. Times at or before `start_time` are dropped,
/// as are switch times after the last user time. With `use_float_comparison` user times
/// that are equal in single precision collapse to the first of them.
pub fn build_schedule(
    user_times: &[f64],
    switch_times: &[f64],
    restart_times: &[f64],
    start_time: f64,
    use_float_comparison: bool,
) -> Result<Vec<OutputTimePoint>> {
    if let Some(bad) = user_times.iter().find(|t| !t.is_finite()) {
        return Err(SimulationError::Schedule(format!(
            "Output time point {bad} is not finite"
        )));
    }
    let exact = |a: f64, b: f64| a == b;

    let restart = sorted_unique(
        restart_times.iter().copied().filter(|t| t.is_finite()).collect(),
        exact,
    );
    let switches: Vec<f64> = sorted_unique(
        switch_times
            .iter()
            .chain(restart.iter())
            .copied()
            .filter(|t| t.is_finite())
            .collect(),
        exact,
    )
    .into_iter()
    .filter(|t| *t > start_time)
    .collect();

    let user: Vec<f64> = if use_float_comparison {
        sorted_unique(user_times.to_vec(), |a, b| a as f32 == b as f32)
    } else {
        sorted_unique(user_times.to_vec(), exact)
    }
    .into_iter()
    .filter(|t| *t > start_time)
    .collect();

    let Some(&last_user_time) = user.last() else {
        return Err(SimulationError::Schedule(
            "Time points output schema is empty".to_string(),
        ));
    };

    let mut times: Vec<f64> = user
        .iter()
        .chain(switches.iter().filter(|t| **t <= last_user_time))
        .copied()
        .collect();
    times = sorted_unique(times, exact);

    Ok(times
        .into_iter()
        .map(|time| OutputTimePoint {
            time,
            save_system_solution: contains(&user, time),
            is_switch_time_point: contains(&switches, time),
            restart_system: contains(&restart, time),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(schedule: &[OutputTimePoint]) -> Vec<(f64, bool, bool, bool)> {
        schedule
            .iter()
            .map(|p| {
                (
                    p.time,
                    p.save_system_solution,
                    p.is_switch_time_point,
                    p.restart_system,
                )
            })
            .collect()
    }

    #[test]
    fn merges_user_switch_and_restart_times() {
        let schedule =
            build_schedule(&[10.0, 30.0, 20.0], &[15.0, 25.0], &[28.0], 0.0, false).unwrap();
        assert_eq!(
            flags(&schedule),
            vec![
                (10.0, true, false, false),
                (15.0, false, true, false),
                (20.0, true, false, false),
                (25.0, false, true, false),
                (28.0, false, true, true),
                (30.0, true, false, false),
            ]
        );
    }

    #[test]
    fn coinciding_times_or_their_flags() {
        let schedule = build_schedule(&[1.0, 2.0], &[2.0], &[1.0], 0.0, false).unwrap();
        assert_eq!(
            flags(&schedule),
            vec![(1.0, true, true, true), (2.0, true, true, false)]
        );
    }

    #[test]
    fn drops_start_time_and_later_switches() {
        let schedule = build_schedule(&[0.0, 5.0], &[0.0, 3.0, 9.0], &[], 0.0, false).unwrap();
        assert_eq!(
            flags(&schedule),
            vec![(3.0, false, true, false), (5.0, true, false, false)]
        );
    }

    #[test]
    fn near_duplicate_user_times_collapse_with_float_comparison() {
        let times = [1.0, 1.0 + 1e-12, 2.0];
        let collapsed = build_schedule(&times, &[], &[], 0.0, true).unwrap();
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].time, 1.0);

        let exact = build_schedule(&times, &[], &[], 0.0, false).unwrap();
        assert_eq!(exact.len(), 3);
    }

    #[test]
    fn empty_user_times_are_an_error() {
        let err = build_schedule(&[0.0], &[1.0], &[], 0.0, false).expect_err("empty");
        assert!(err.to_string().contains("output schema is empty"));
    }

    #[test]
    fn intervals_expand_to_equidistant_points() {
        let mut schema = OutputSchema::default();
        schema.add_interval(OutputInterval::new(0.0, 1.0, 5));
        schema.add_interval(OutputInterval::new(3.0, 3.0, 1));
        schema.add_time_point(0.3);
        assert_eq!(
            schema.all_time_points().unwrap(),
            vec![0.3, 0.0, 0.25, 0.5, 0.75, 1.0, 3.0]
        );

        let mut bad = OutputSchema::default();
        bad.add_interval(OutputInterval::new(2.0, 1.0, 3));
        assert!(bad.all_time_points().is_err());
    }
}
