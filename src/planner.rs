use std::collections::BTreeSet;

use anyhow::Context;
use chrono::{Duration, NaiveDate};

use crate::models::{PlanRow, ScheduleAverages, Stage, StageValues, StageWindow};
use crate::series::week_start;

/// Where the shape of a simulated schedule comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanReference {
    Averages(ScheduleAverages),
    Project(StageValues<StageWindow>),
}

/// Planned piece count and volume for one family of the new project.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyInput {
    pub family: String,
    pub units: u32,
    pub volume: f64,
}

impl FamilyInput {
    /// Parses `NAME=UNITS:VOLUME`.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let (family, amounts) = value
            .split_once('=')
            .with_context(|| format!("family input `{value}` must look like NAME=UNITS:VOLUME"))?;
        let (units, volume) = amounts
            .split_once(':')
            .with_context(|| format!("family input `{value}` is missing `:VOLUME`"))?;
        let volume: f64 = volume
            .trim()
            .parse()
            .with_context(|| format!("invalid volume in `{value}`"))?;
        anyhow::ensure!(volume >= 0.0, "volume in `{value}` must not be negative");

        Ok(Self {
            family: family.trim().to_string(),
            units: units
                .trim()
                .parse()
                .with_context(|| format!("invalid unit count in `{value}`"))?,
            volume,
        })
    }
}

fn shift(date: Option<NaiveDate>, days: Option<f64>) -> Option<NaiveDate> {
    Some(date? + Duration::days(days?.round() as i64))
}

fn span(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<f64> {
    Some((to? - from?).num_days() as f64)
}

/// Stage windows for a project starting on `start`, shaped like the reference.
/// `None` when the reference has nothing to go on.
pub fn project_windows(
    reference: &PlanReference,
    start: NaiveDate,
) -> Option<StageValues<StageWindow>> {
    let (design, fabrication_lag, fabrication, assembly_lag, assembly) = match reference {
        PlanReference::Averages(averages) => {
            averages.design_days?;
            (
                averages.design_days,
                averages.fabrication_lag_days,
                averages.fabrication_days,
                averages.assembly_lag_days,
                averages.assembly_days,
            )
        }
        PlanReference::Project(bounds) => {
            if Stage::ALL.iter().all(|stage| {
                let window = bounds.get(*stage);
                window.start.is_none() && window.end.is_none()
            }) {
                return None;
            }
            let design_start = bounds.projected.start;
            (
                span(design_start, bounds.projected.end),
                span(design_start, bounds.fabricated.start),
                span(bounds.fabricated.start, bounds.fabricated.end),
                span(design_start, bounds.assembled.start),
                span(bounds.assembled.start, bounds.assembled.end),
            )
        }
    };

    let start = Some(start);
    let fabrication_start = shift(start, fabrication_lag);
    let assembly_start = shift(start, assembly_lag);

    Some(StageValues {
        projected: StageWindow {
            start,
            end: shift(start, design),
        },
        fabricated: StageWindow {
            start: fabrication_start,
            end: shift(fabrication_start, fabrication),
        },
        assembled: StageWindow {
            start: assembly_start,
            end: shift(assembly_start, assembly),
        },
    })
}

/// Week starts covering a stage window; empty unless both ends are set.
pub fn window_weeks(window: &StageWindow) -> Vec<NaiveDate> {
    let (Some(start), Some(end)) = (window.start, window.end) else {
        return Vec::new();
    };

    let mut weeks = Vec::new();
    let mut current = week_start(start);
    while current <= end {
        weeks.push(current);
        current += Duration::days(7);
    }
    weeks
}

/// Spreads `total_volume` evenly across each stage's weeks and accumulates it.
pub fn build_plan(windows: &StageValues<StageWindow>, total_volume: f64) -> Vec<PlanRow> {
    let mut stage_weeks = StageValues::<Vec<NaiveDate>>::default();
    let mut all_weeks = BTreeSet::new();
    for stage in Stage::ALL {
        let weeks = window_weeks(windows.get(stage));
        all_weeks.extend(weeks.iter().copied());
        *stage_weeks.get_mut(stage) = weeks;
    }

    let mut running = StageValues::<f64>::default();
    all_weeks
        .into_iter()
        .map(|week| {
            for stage in Stage::ALL {
                let weeks = stage_weeks.get(stage);
                if weeks.contains(&week) {
                    *running.get_mut(stage) += total_volume / weeks.len() as f64;
                }
            }
            PlanRow {
                week_start: week,
                volume: running,
            }
        })
        .collect()
}
