use std::collections::HashMap;

use chrono::NaiveDate;

use crate::models::{CumulativeRow, ForecastPoint, ForecastedRow, Stage, StageValues};

pub const COMPLETE_PCT: f64 = 100.0;

/// Zero has historically meant "nothing entered for this week".
fn entered(value: Option<f64>) -> Option<f64> {
    value.filter(|pct| *pct != 0.0 && !pct.is_nan())
}

/// Joins sparse forecast entries onto a cumulative series.
///
/// Per project and stage, in week order: entries carry forward until the next
/// entry, weeks before the first entry read 0, and every week following a week
/// whose carried value is at least 100 is left blank. `series` must be ordered
/// by project then week, as produced by `SeriesBuilder::build`.
pub fn apply_forecast(series: &[CumulativeRow], forecast: &[ForecastPoint]) -> Vec<ForecastedRow> {
    let entries: HashMap<(&str, NaiveDate), &StageValues<Option<f64>>> = forecast
        .iter()
        .map(|point| ((point.project.as_str(), point.week_start), &point.pct))
        .collect();

    let mut rows = Vec::with_capacity(series.len());
    let mut project: Option<&str> = None;
    let mut carried = StageValues::<Option<f64>>::default();
    let mut previous = StageValues::<Option<f64>>::default();

    for row in series {
        if project != Some(row.project.as_str()) {
            project = Some(row.project.as_str());
            carried = StageValues::default();
            previous = StageValues::default();
        }

        let entry = entries.get(&(row.project.as_str(), row.week_start));
        let mut output = StageValues::<Option<f64>>::default();

        for stage in Stage::ALL {
            if let Some(value) = entry.and_then(|pct| entered(*pct.get(stage))) {
                *carried.get_mut(stage) = Some(value);
            }
            let filled = carried.get(stage).unwrap_or(0.0);
            let clipped = previous.get(stage).is_some_and(|value| value >= COMPLETE_PCT);

            *output.get_mut(stage) = if clipped { None } else { Some(filled) };
            *previous.get_mut(stage) = Some(filled);
        }

        rows.push(ForecastedRow {
            row: row.clone(),
            forecast: output,
        });
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn week(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::weeks(n - 1)
    }

    fn series(project: &str, weeks: i64) -> Vec<CumulativeRow> {
        (1..=weeks)
            .map(|n| CumulativeRow {
                project: project.to_string(),
                week_start: week(n),
                volume: StageValues::default(),
            })
            .collect()
    }

    fn point(project: &str, n: i64, projected: Option<f64>) -> ForecastPoint {
        ForecastPoint {
            project: project.to_string(),
            week_start: week(n),
            pct: StageValues {
                projected,
                fabricated: None,
                assembled: None,
            },
        }
    }

    fn projected(rows: &[ForecastedRow]) -> Vec<Option<f64>> {
        rows.iter().map(|row| row.forecast.projected).collect()
    }

    #[test]
    fn sparse_entries_fill_forward_and_clip_after_completion() {
        let rows = apply_forecast(
            &series("ProjA", 4),
            &[point("ProjA", 1, Some(30.0)), point("ProjA", 3, Some(100.0))],
        );
        assert_eq!(
            projected(&rows),
            vec![Some(30.0), Some(30.0), Some(100.0), None]
        );
    }

    #[test]
    fn leading_weeks_read_zero_and_zero_entries_are_unset() {
        let rows = apply_forecast(
            &series("A", 5),
            &[
                point("A", 2, Some(0.0)),
                point("A", 3, Some(40.0)),
                point("A", 4, Some(0.0)),
            ],
        );
        assert_eq!(
            projected(&rows),
            vec![Some(0.0), Some(0.0), Some(40.0), Some(40.0), Some(40.0)]
        );
    }

    #[test]
    fn every_week_after_completion_stays_blank() {
        let rows = apply_forecast(&series("A", 6), &[point("A", 2, Some(120.0))]);
        assert_eq!(
            projected(&rows),
            vec![Some(0.0), Some(120.0), None, None, None, None]
        );
    }

    #[test]
    fn entry_after_completion_shows_one_week_late() {
        let rows = apply_forecast(
            &series("A", 6),
            &[point("A", 2, Some(100.0)), point("A", 4, Some(50.0))],
        );
        assert_eq!(
            projected(&rows),
            vec![Some(0.0), Some(100.0), None, None, Some(50.0), Some(50.0)]
        );
    }

    #[test]
    fn projects_do_not_share_carried_values() {
        let mut input = series("A", 2);
        input.extend(series("B", 2));
        let rows = apply_forecast(&input, &[point("A", 2, Some(100.0))]);
        assert_eq!(
            projected(&rows),
            vec![Some(0.0), Some(100.0), Some(0.0), Some(0.0)]
        );
    }

    #[test]
    fn stages_are_independent() {
        let mut entry = point("A", 1, Some(100.0));
        entry.pct.assembled = Some(20.0);
        let rows = apply_forecast(&series("A", 3), &[entry]);
        assert_eq!(projected(&rows), vec![Some(100.0), None, None]);
        let assembled: Vec<_> = rows.iter().map(|row| row.forecast.assembled).collect();
        assert_eq!(assembled, vec![Some(20.0), Some(20.0), Some(20.0)]);
        let fabricated: Vec<_> = rows.iter().map(|row| row.forecast.fabricated).collect();
        assert_eq!(fabricated, vec![Some(0.0), Some(0.0), Some(0.0)]);
    }

    #[test]
    fn overlay_is_deterministic() {
        let input = series("A", 5);
        let forecast = vec![point("A", 1, Some(50.0)), point("A", 3, Some(100.0))];
        let first = apply_forecast(&input, &forecast);
        let second = apply_forecast(&input, &forecast);
        assert_eq!(first, second);
    }

    #[test]
    fn forecasts_outside_series_are_ignored() {
        let rows = apply_forecast(
            &series("A", 2),
            &[point("A", 9, Some(70.0)), point("Z", 1, Some(10.0))],
        );
        assert_eq!(projected(&rows), vec![Some(0.0), Some(0.0)]);
    }
}
