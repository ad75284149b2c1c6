use chrono::{Local, NaiveDate};

use crate::models::{
    ForecastedRow, ProjectSummary, ProjectTotals, Stage, StageValues, WeeklyProgressRow,
};
use crate::store::BudgetStore;

/// Share of the budget reached, in percent. A zero or missing budget reads 0.
pub fn stage_pct(volume: f64, budget_volume: Option<f64>) -> f64 {
    match budget_volume {
        Some(budget) if budget > 0.0 => volume / budget * 100.0,
        _ => 0.0,
    }
}

/// Days from `today` until the stage deadline; `None` while no deadline is set.
pub fn days_remaining(end: Option<NaiveDate>, today: NaiveDate) -> Option<i64> {
    end.map(|end| (end - today).num_days())
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn weekly_progress(rows: &[ForecastedRow], store: &BudgetStore) -> Vec<WeeklyProgressRow> {
    rows.iter()
        .map(|forecasted| {
            let row = &forecasted.row;
            let budget = store.budget(&row.project).map(|budget| budget.budget_volume);
            let mut realized_pct = StageValues::<f64>::default();
            for stage in Stage::ALL {
                *realized_pct.get_mut(stage) = stage_pct(*row.volume.get(stage), budget);
            }

            WeeklyProgressRow {
                project: row.project.clone(),
                week_start: row.week_start,
                volume: row.volume,
                realized_pct,
                forecast_pct: forecasted.forecast,
            }
        })
        .collect()
}

/// Most recent row of each project, assuming rows are ordered by project then week.
pub fn latest_per_project(rows: &[WeeklyProgressRow]) -> Vec<WeeklyProgressRow> {
    let mut latest: Vec<WeeklyProgressRow> = Vec::new();
    for row in rows {
        if latest.last().is_some_and(|last| last.project == row.project) {
            latest.pop();
        }
        latest.push(row.clone());
    }
    latest
}

pub fn summarize_projects(
    totals: &[ProjectTotals],
    store: &BudgetStore,
    today: NaiveDate,
) -> Vec<ProjectSummary> {
    let mut summaries: Vec<ProjectSummary> = totals
        .iter()
        .map(|totals| {
            let budget = store.budget(&totals.project);
            let budget_volume = budget.map(|budget| budget.budget_volume);
            let mut days_left = StageValues::<Option<i64>>::default();
            if let Some(budget) = budget {
                for stage in Stage::ALL {
                    *days_left.get_mut(stage) =
                        days_remaining(budget.schedule.get(stage).end, today);
                }
            }

            ProjectSummary {
                project: totals.project.clone(),
                budget_volume: budget_volume.unwrap_or(0.0),
                budget_slabs_volume: budget.map_or(0.0, |budget| budget.budget_slabs_volume),
                totals: totals.clone(),
                projected_pct: stage_pct(totals.projected, budget_volume),
                fabricated_pct: stage_pct(totals.fabricated, budget_volume),
                finished_pct: stage_pct(totals.finished, budget_volume),
                shipped_pct: stage_pct(totals.shipped, budget_volume),
                assembled_pct: stage_pct(totals.assembled, budget_volume),
                days_left,
            }
        })
        .collect();

    summaries.sort_by(|a, b| a.project.cmp(&b.project));
    summaries
}
