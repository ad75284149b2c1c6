use std::fmt::Write;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::feeds::{format_measure, Checkpoint, FeedError, SectorStatus, SectorWeek};
use crate::models::{
    Budget, FamilyVolume, ForecastPoint, PlanRow, ProjectSummary, Stage, WeeklyProgressRow,
};
use crate::series::DateWindow;

/// `dd/mm to dd/mm (YYYY)` for the week starting on `week_start`.
pub fn format_week(week_start: NaiveDate) -> String {
    let week_end = week_start + Duration::days(6);
    format!(
        "{} to {} ({})",
        week_start.format("%d/%m"),
        week_end.format("%d/%m"),
        week_start.format("%Y")
    )
}

fn volume(value: f64) -> String {
    format!("{value:.2}")
}

fn pct(value: f64) -> String {
    format!("{value:.1}%")
}

fn optional_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value:.0}%"))
}

fn days(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |value| format!("{value} d"))
}

fn date(value: Option<NaiveDate>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.format("%d/%m/%Y").to_string())
}

pub fn weekly_table(rows: &[WeeklyProgressRow]) -> String {
    let mut output = String::new();

    if rows.is_empty() {
        let _ = writeln!(output, "No weekly data for this selection.");
        return output;
    }

    let _ = writeln!(
        output,
        "| Project | Week | Design % | Design forecast | Fabrication % | Fabrication forecast | Assembly % | Assembly forecast |"
    );
    let _ = writeln!(output, "|---|---|---:|---:|---:|---:|---:|---:|");
    for row in rows {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} | {} | {} |",
            row.project,
            format_week(row.week_start),
            pct(row.realized_pct.projected),
            optional_pct(row.forecast_pct.projected),
            pct(row.realized_pct.fabricated),
            optional_pct(row.forecast_pct.fabricated),
            pct(row.realized_pct.assembled),
            optional_pct(row.forecast_pct.assembled),
        );
    }

    output
}

#[derive(Serialize)]
struct WeeklyCsvRow<'a> {
    project: &'a str,
    week_start: NaiveDate,
    volume_projected: f64,
    volume_fabricated: f64,
    volume_assembled: f64,
    projected_pct: f64,
    fabricated_pct: f64,
    assembled_pct: f64,
    projected_forecast_pct: Option<f64>,
    fabricated_forecast_pct: Option<f64>,
    assembled_forecast_pct: Option<f64>,
}

pub fn write_weekly_csv(path: &Path, rows: &[WeeklyProgressRow]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(WeeklyCsvRow {
            project: &row.project,
            week_start: row.week_start,
            volume_projected: row.volume.projected,
            volume_fabricated: row.volume.fabricated,
            volume_assembled: row.volume.assembled,
            projected_pct: row.realized_pct.projected,
            fabricated_pct: row.realized_pct.fabricated,
            assembled_pct: row.realized_pct.assembled,
            projected_forecast_pct: row.forecast_pct.projected,
            fabricated_forecast_pct: row.forecast_pct.fabricated,
            assembled_forecast_pct: row.forecast_pct.assembled,
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn summary_table(summaries: &[ProjectSummary]) -> String {
    let mut output = String::new();

    if summaries.is_empty() {
        let _ = writeln!(output, "No projects recorded.");
        return output;
    }

    let _ = writeln!(
        output,
        "| Project | Budget | Slab budget | Design vol | Design % | Design days | Steel (kg/m³) | Fab vol | Fab % | Fab days | Finished vol | Finished % | Shipped vol | Shipped % | Assembly vol | Assembly % | Assembly days |"
    );
    let _ = writeln!(
        output,
        "|---|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|---:|"
    );
    for summary in summaries {
        let totals = &summary.totals;
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            summary.project,
            volume(summary.budget_volume),
            volume(summary.budget_slabs_volume),
            volume(totals.projected),
            pct(summary.projected_pct),
            days(summary.days_left.projected),
            totals.steel_rate.map_or_else(|| "-".to_string(), volume),
            volume(totals.fabricated),
            pct(summary.fabricated_pct),
            days(summary.days_left.fabricated),
            volume(totals.finished),
            pct(summary.finished_pct),
            volume(totals.shipped),
            pct(summary.shipped_pct),
            volume(totals.assembled),
            pct(summary.assembled_pct),
            days(summary.days_left.assembled),
        );
    }

    output
}

/// One project's weekly curve plus its consolidated summary.
pub fn project_slide(
    project: &str,
    position: usize,
    count: usize,
    rows: &[WeeklyProgressRow],
    summary: Option<&ProjectSummary>,
) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "## {project}");
    let _ = writeln!(output, "Showing project {} of {}", position + 1, count);
    let _ = writeln!(output);
    output.push_str(&weekly_table(rows));
    let _ = writeln!(output);
    let _ = writeln!(output, "### Consolidated summary");
    match summary {
        Some(summary) => output.push_str(&summary_table(std::slice::from_ref(summary))),
        None => {
            let _ = writeln!(output, "No totals recorded for this project.");
        }
    }
    output
}

pub fn budgets_table<'a>(budgets: impl IntoIterator<Item = &'a Budget>) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "| Project | Budget | Slab budget | Design start | Design end | Fab start | Fab end | Assembly start | Assembly end |"
    );
    let _ = writeln!(output, "|---|---:|---:|---|---|---|---|---|---|");
    for budget in budgets {
        let schedule = &budget.schedule;
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} |",
            budget.project,
            volume(budget.budget_volume),
            volume(budget.budget_slabs_volume),
            date(schedule.projected.start),
            date(schedule.projected.end),
            date(schedule.fabricated.start),
            date(schedule.fabricated.end),
            date(schedule.assembled.start),
            date(schedule.assembled.end),
        );
    }
    output
}

pub fn forecasts_table(points: &[ForecastPoint]) -> String {
    let mut output = String::new();
    if points.is_empty() {
        let _ = writeln!(output, "No forecasts entered.");
        return output;
    }

    let _ = writeln!(output, "| Project | Week | Design | Fabrication | Assembly |");
    let _ = writeln!(output, "|---|---|---:|---:|---:|");
    for point in points {
        let mut cells = Vec::with_capacity(3);
        for stage in Stage::ALL {
            cells.push(optional_pct(*point.pct.get(stage)));
        }
        let _ = writeln!(
            output,
            "| {} | {} | {} |",
            point.project,
            format_week(point.week_start),
            cells.join(" | ")
        );
    }
    output
}

pub fn families_table(project: &str, families: &[FamilyVolume]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "## Families recorded for {project}");
    if families.is_empty() {
        let _ = writeln!(output, "No pieces with a family recorded.");
        return output;
    }

    let _ = writeln!(output, "| Family | Pieces | Volume (m³) |");
    let _ = writeln!(output, "|---|---:|---:|");
    for family in families {
        let _ = writeln!(
            output,
            "| {} | {} | {} |",
            family.family,
            family.units,
            volume(family.volume)
        );
    }
    output
}

pub fn plan_table(reference: &str, units: u32, total_volume: f64, rows: &[PlanRow]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Schedule Simulation");
    let _ = writeln!(output, "Reference: {reference}");
    let _ = writeln!(output, "Planned total: {} m³ across {units} pieces", volume(total_volume));
    let _ = writeln!(output);

    if rows.is_empty() {
        let _ = writeln!(output, "No weeks could be scheduled from this reference.");
        return output;
    }

    let _ = writeln!(output, "| Week | Design (vol) | Fabrication (vol) | Assembly (vol) |");
    let _ = writeln!(output, "|---|---:|---:|---:|");
    for row in rows {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} |",
            format_week(row.week_start),
            volume(row.volume.projected),
            volume(row.volume.fabricated),
            volume(row.volume.assembled),
        );
    }
    output
}

pub fn live_status_table(records: &[SectorStatus], now: NaiveDateTime) -> String {
    use chrono::Timelike;

    let mut output = String::new();
    let active = Checkpoint::for_hour(now.hour());
    let _ = writeln!(output, "# Production War Room");
    let _ = writeln!(output, "Date: {}", now.format("%d/%m/%Y"));
    let _ = writeln!(output);

    if records.is_empty() {
        let _ = writeln!(output, "No sectors reported.");
        return output;
    }

    let header = |checkpoint: Checkpoint| {
        if checkpoint == active {
            format!("**{}**", checkpoint.label())
        } else {
            checkpoint.label().to_string()
        }
    };
    let _ = writeln!(
        output,
        "| Sector | Today Prog | {} | {} | {} | Yesterday Prog | Yesterday Real | Tomorrow Prog |",
        header(Checkpoint::Morning),
        header(Checkpoint::Midday),
        header(Checkpoint::Evening),
    );
    let _ = writeln!(output, "|---|---:|---:|---:|---:|---:|---:|---:|");

    for record in records {
        let unit = record.unit.as_str();
        let goal = if record.met_yesterday_goal() { "✓" } else { "✗" };
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} | {} {} | {} |",
            record.sector,
            format_measure(record.programmed_today, record.programmed_today_qty, unit),
            format_measure(record.realized_8h, record.realized_8h_qty, unit),
            format_measure(record.realized_13h, record.realized_13h_qty, unit),
            format_measure(record.realized_18h, record.realized_18h_qty, unit),
            format_measure(record.programmed_yesterday, record.programmed_yesterday_qty, unit),
            format_measure(record.realized_yesterday, record.realized_yesterday_qty, unit),
            goal,
            format_measure(record.programmed_tomorrow, record.programmed_tomorrow_qty, unit),
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "Updated at {}", now.format("%H:%M:%S"));
    output
}

pub fn weekly_status_table(feed: &Result<Vec<SectorWeek>, FeedError>) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "## Weekly War Room");

    match feed {
        Err(error) => {
            let _ = writeln!(output, "Weekly war room unavailable: {error}");
        }
        Ok(records) if records.is_empty() => {
            let _ = writeln!(output, "No weekly data.");
        }
        Ok(records) => {
            let _ = writeln!(output, "| Dates | Sector | Total programmed | Total realized |");
            let _ = writeln!(output, "|---|---|---:|---:|");
            for record in records {
                let _ = writeln!(
                    output,
                    "| {} | {} | {} | {} |",
                    record.date_label(),
                    record.sector,
                    volume(record.programmed),
                    volume(record.realized),
                );
            }
        }
    }

    output
}

pub fn build_report(
    selection: &str,
    window: Option<DateWindow>,
    summaries: &[ProjectSummary],
    rows: &[WeeklyProgressRow],
    weekly_feed: &Result<Vec<SectorWeek>, FeedError>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Deadline Review");
    match window {
        Some(window) => {
            let _ = writeln!(
                output,
                "Generated for {} (weeks from {} to {})",
                selection, window.start, window.end
            );
        }
        None => {
            let _ = writeln!(output, "Generated for {selection}");
        }
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Project Summary");
    output.push_str(&summary_table(summaries));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Progress");
    output.push_str(&weekly_table(rows));
    let _ = writeln!(output);
    output.push_str(&weekly_status_table(weekly_feed));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProjectTotals, StageValues};

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 30).unwrap()
    }

    fn progress_row(forecast: Option<f64>) -> WeeklyProgressRow {
        WeeklyProgressRow {
            project: "TOWER B".to_string(),
            week_start: monday(),
            volume: StageValues {
                projected: 12.0,
                fabricated: 0.0,
                assembled: 0.0,
            },
            realized_pct: StageValues {
                projected: 12.0,
                fabricated: 0.0,
                assembled: 0.0,
            },
            forecast_pct: StageValues {
                projected: forecast,
                fabricated: Some(0.0),
                assembled: None,
            },
        }
    }

    #[test]
    fn week_label_spans_monday_to_sunday() {
        assert_eq!(format_week(monday()), "30/12 to 05/01 (2024)");
    }

    #[test]
    fn weekly_table_blanks_clipped_forecasts() {
        let table = weekly_table(&[progress_row(None)]);
        assert!(table.contains(
            "| TOWER B | 30/12 to 05/01 (2024) | 12.0% | - | 0.0% | 0% | 0.0% | - |"
        ));
        assert!(weekly_table(&[]).contains("No weekly data"));
    }

    #[test]
    fn summary_shows_unset_deadlines_as_dash() {
        let summary = ProjectSummary {
            project: "ANNEX".to_string(),
            budget_volume: 100.0,
            budget_slabs_volume: 0.0,
            totals: ProjectTotals {
                project: "ANNEX".to_string(),
                projected: 50.0,
                ..ProjectTotals::default()
            },
            projected_pct: 50.0,
            fabricated_pct: 0.0,
            finished_pct: 0.0,
            shipped_pct: 0.0,
            assembled_pct: 0.0,
            days_left: StageValues {
                projected: Some(12),
                fabricated: None,
                assembled: Some(-3),
            },
        };
        let table = summary_table(&[summary]);
        assert!(table.contains(
            "| ANNEX | 100.00 | 0.00 | 50.00 | 50.0% | 12 d | - | 0.00 | 0.0% | - |"
        ));
        assert!(table.contains("| -3 d |"));
    }

    #[test]
    fn live_table_marks_active_checkpoint_and_goal() {
        let record = SectorStatus {
            sector: "Forma".to_string(),
            unit: "kg".to_string(),
            programmed_yesterday: Some(100.0),
            realized_yesterday: Some(80.0),
            ..SectorStatus::default()
        };
        let now = monday().and_hms_opt(9, 30, 0).unwrap();
        let table = live_status_table(&[record], now);
        assert!(table.contains("| Today 8h | **Today 13h** | Today 18h |"));
        assert!(table.contains("| 100,0 kg | 80,0 kg ✗ | - |"));
        assert!(table.contains("Updated at 09:30:00"));
    }

    #[test]
    fn weekly_feed_failure_is_scoped_to_its_section() {
        let feed = Err(FeedError::UnexpectedShape { feed: "weekly status feed" });
        let report = build_report("all projects", None, &[], &[progress_row(Some(40.0))], &feed);
        assert!(report.contains("## Weekly Progress"));
        assert!(report.contains("| 40% |"));
        assert!(report.contains(
            "Weekly war room unavailable: weekly status feed returned something other than a list"
        ));
    }

    #[test]
    fn families_table_lists_recorded_pieces() {
        let families = vec![FamilyVolume {
            project: "TOWER B".to_string(),
            family: "PILAR".to_string(),
            units: 14,
            volume: 58.8,
        }];
        let table = families_table("TOWER B", &families);
        assert!(table.contains("| PILAR | 14 | 58.80 |"));
        assert!(families_table("TOWER B", &[]).contains("No pieces"));
    }

    #[test]
    fn weekly_csv_writes_blank_forecast_cells() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_weekly_csv(file.path(), &[progress_row(None)]).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("project,week_start,volume_projected"));
        assert_eq!(
            lines.next().unwrap(),
            "TOWER B,2024-12-30,12.0,0.0,0.0,12.0,0.0,0.0,,0.0,"
        );
    }
}
