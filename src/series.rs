use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, Duration, NaiveDate};

use crate::models::{CumulativeRow, ProgressEvent, StageValues};

pub const DEFAULT_HORIZON_WEEKS: u32 = 10;
/// Ten years of padding; anything larger is a configuration mistake.
pub const MAX_HORIZON_WEEKS: u32 = 520;

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Moves `date` by whole weeks, saturating at the calendar limits.
fn shift_weeks(date: NaiveDate, weeks: i64) -> NaiveDate {
    date.checked_add_signed(Duration::weeks(weeks))
        .unwrap_or(if weeks < 0 { NaiveDate::MIN } else { NaiveDate::MAX })
}

/// Inclusive display window applied after accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// From `horizon_weeks` before the earliest bucket week to the latest one.
    pub fn around_events(events: &[ProgressEvent], horizon_weeks: u32) -> Option<Self> {
        let first = events.iter().map(|event| week_start(event.date)).min()?;
        let last = events.iter().map(|event| week_start(event.date)).max()?;
        Some(Self {
            start: shift_weeks(first, -i64::from(horizon_weeks)),
            end: last,
        })
    }
}

pub type WeeklyVolumes = BTreeMap<String, BTreeMap<NaiveDate, StageValues<f64>>>;

/// Sums event volumes per project, week and stage. Only weeks with an event appear.
pub fn bucket_weekly(events: &[ProgressEvent]) -> WeeklyVolumes {
    let mut weekly: WeeklyVolumes = BTreeMap::new();

    for event in events {
        let entry = weekly
            .entry(event.project.clone())
            .or_default()
            .entry(week_start(event.date))
            .or_default();
        *entry.get_mut(event.stage) += event.volume;
    }

    weekly
}

/// Pads each project with `horizon_weeks` of zero weeks on both sides and fills
/// every missing week in between.
pub fn densify(
    weeks: &BTreeMap<NaiveDate, StageValues<f64>>,
    horizon_weeks: u32,
) -> Vec<(NaiveDate, StageValues<f64>)> {
    let (Some(first), Some(last)) = (weeks.keys().next(), weeks.keys().next_back()) else {
        return Vec::new();
    };

    let horizon = i64::from(horizon_weeks);
    let mut current = shift_weeks(*first, -horizon);
    let end = shift_weeks(*last, horizon);
    let mut dense = Vec::new();

    while current <= end {
        dense.push((current, weeks.get(&current).copied().unwrap_or_default()));
        match current.checked_add_signed(Duration::days(7)) {
            Some(next) => current = next,
            None => break,
        }
    }

    dense
}

/// Replaces each stage's weekly volume with its running total.
pub fn accumulate(weeks: &mut [(NaiveDate, StageValues<f64>)]) {
    let mut running = StageValues::<f64>::default();
    for (_, volume) in weeks.iter_mut() {
        running.projected += volume.projected;
        running.fabricated += volume.fabricated;
        running.assembled += volume.assembled;
        *volume = running;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SeriesBuilder {
    pub horizon_weeks: u32,
    pub window: Option<DateWindow>,
}

impl Default for SeriesBuilder {
    fn default() -> Self {
        Self {
            horizon_weeks: DEFAULT_HORIZON_WEEKS,
            window: None,
        }
    }
}

impl SeriesBuilder {
    pub fn new(horizon_weeks: u32) -> Self {
        Self {
            horizon_weeks,
            window: None,
        }
    }

    pub fn with_window(mut self, window: DateWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Cumulative weekly series for the selected projects, ordered by project then week.
    ///
    /// Selected projects without events produce no rows. The window filter runs
    /// last so cumulative values include weeks hidden from view.
    pub fn build(
        &self,
        events: &[ProgressEvent],
        selected: &BTreeSet<String>,
    ) -> Vec<CumulativeRow> {
        let weekly = bucket_weekly(events);
        let mut rows = Vec::new();

        for (project, weeks) in weekly
            .iter()
            .filter(|(project, _)| selected.contains(*project))
        {
            let mut dense = densify(weeks, self.horizon_weeks);
            accumulate(&mut dense);

            rows.extend(
                dense
                    .into_iter()
                    .filter(|(week, _)| self.window.map_or(true, |window| window.contains(*week)))
                    .map(|(week_start, volume)| CumulativeRow {
                        project: project.clone(),
                        week_start,
                        volume,
                    }),
            );
        }

        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(project: &str, date: NaiveDate, stage: Stage, volume: f64) -> ProgressEvent {
        ProgressEvent {
            project: project.to_string(),
            date,
            stage,
            volume,
        }
    }

    fn selection(projects: &[&str]) -> BTreeSet<String> {
        projects.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn week_start_is_monday_within_six_days() {
        let mut day = date(2023, 12, 20);
        for _ in 0..40 {
            let monday = week_start(day);
            assert_eq!(monday.weekday(), chrono::Weekday::Mon);
            let offset = (day - monday).num_days();
            assert!((0..=6).contains(&offset));
            assert_eq!(monday.iso_week(), day.iso_week());
            day += Duration::days(1);
        }
    }

    #[test]
    fn bucketing_sums_same_week_events() {
        let events = vec![
            event("A", date(2024, 1, 2), Stage::Projected, 4.0),
            event("A", date(2024, 1, 5), Stage::Projected, 6.0),
            event("A", date(2024, 1, 7), Stage::Assembled, 1.5),
        ];
        let weekly = bucket_weekly(&events);
        let weeks = &weekly["A"];
        assert_eq!(weeks.len(), 1);
        let volume = weeks[&date(2024, 1, 1)];
        assert_eq!(volume.projected, 10.0);
        assert_eq!(volume.fabricated, 0.0);
        assert_eq!(volume.assembled, 1.5);
    }

    #[test]
    fn densified_axis_has_no_gaps() {
        let events = vec![
            event("A", date(2024, 1, 3), Stage::Projected, 1.0),
            event("A", date(2024, 2, 20), Stage::Fabricated, 2.0),
            event("B", date(2024, 5, 9), Stage::Assembled, 3.0),
        ];
        let rows = SeriesBuilder::new(10).build(&events, &selection(&["A", "B"]));

        for project in ["A", "B"] {
            let weeks: Vec<NaiveDate> = rows
                .iter()
                .filter(|row| row.project == project)
                .map(|row| row.week_start)
                .collect();
            assert!(weeks.windows(2).all(|pair| pair[1] - pair[0] == Duration::days(7)));
        }

        let a_weeks: Vec<_> = rows.iter().filter(|row| row.project == "A").collect();
        assert_eq!(a_weeks.first().unwrap().week_start, date(2024, 1, 1) - Duration::weeks(10));
        assert_eq!(a_weeks.last().unwrap().week_start, date(2024, 2, 19) + Duration::weeks(10));
        let b_count = rows.iter().filter(|row| row.project == "B").count();
        assert_eq!(b_count, 21);
    }

    #[test]
    fn cumulative_is_monotone_and_totals_match() {
        let events = vec![
            event("A", date(2024, 3, 4), Stage::Fabricated, 2.0),
            event("A", date(2024, 1, 10), Stage::Fabricated, 3.5),
            event("A", date(2024, 2, 14), Stage::Fabricated, 0.5),
            event("A", date(2024, 2, 14), Stage::Projected, 9.0),
        ];
        let rows = SeriesBuilder::new(3).build(&events, &selection(&["A"]));

        assert!(rows
            .windows(2)
            .all(|pair| pair[1].volume.fabricated >= pair[0].volume.fabricated
                && pair[1].volume.projected >= pair[0].volume.projected));
        let last = rows.last().unwrap();
        assert_eq!(last.volume.fabricated, 6.0);
        assert_eq!(last.volume.projected, 9.0);
        assert_eq!(rows.first().unwrap().volume.fabricated, 0.0);
    }

    #[test]
    fn end_to_end_scenario_with_two_week_horizon() {
        let events = vec![
            event("ProjA", date(2024, 1, 1), Stage::Projected, 10.0),
            event("ProjA", date(2024, 1, 1), Stage::Fabricated, 0.0),
            event("ProjA", date(2024, 3, 1), Stage::Assembled, 5.0),
        ];
        let rows = SeriesBuilder::new(2).build(&events, &selection(&["ProjA"]));

        let assembled_week = date(2024, 2, 26);
        assert_eq!(rows.first().unwrap().week_start, date(2023, 12, 18));
        assert_eq!(rows.last().unwrap().week_start, assembled_week + Duration::weeks(2));

        for row in &rows {
            let expected_projected = if row.week_start >= date(2024, 1, 1) { 10.0 } else { 0.0 };
            let expected_assembled = if row.week_start >= assembled_week { 5.0 } else { 0.0 };
            assert_eq!(row.volume.projected, expected_projected);
            assert_eq!(row.volume.assembled, expected_assembled);
            assert_eq!(row.volume.fabricated, 0.0);
        }
    }

    #[test]
    fn window_filter_keeps_history_in_totals() {
        let events = vec![
            event("A", date(2024, 1, 1), Stage::Projected, 10.0),
            event("A", date(2024, 2, 5), Stage::Projected, 5.0),
        ];
        let window = DateWindow {
            start: date(2024, 2, 5),
            end: date(2024, 2, 12),
        };
        let rows = SeriesBuilder::new(10)
            .with_window(window)
            .build(&events, &selection(&["A"]));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].volume.projected, 15.0);
        assert_eq!(rows[1].volume.projected, 15.0);
    }

    #[test]
    fn unselected_and_missing_projects_produce_no_rows() {
        let events = vec![event("A", date(2024, 1, 1), Stage::Projected, 1.0)];
        assert!(SeriesBuilder::default()
            .build(&events, &selection(&["Ghost"]))
            .is_empty());
        assert!(SeriesBuilder::default().build(&[], &selection(&["A"])).is_empty());
    }

    #[test]
    fn default_window_starts_before_first_week() {
        let events = vec![
            event("A", date(2024, 1, 3), Stage::Projected, 1.0),
            event("B", date(2024, 4, 11), Stage::Projected, 1.0),
        ];
        let window = DateWindow::around_events(&events, 10).unwrap();
        assert_eq!(window.start, date(2024, 1, 1) - Duration::weeks(10));
        assert_eq!(window.end, date(2024, 4, 8));
        assert!(DateWindow::around_events(&[], 10).is_none());
    }

    #[test]
    fn oversized_horizon_saturates_instead_of_overflowing() {
        let events = vec![event("A", date(2024, 1, 3), Stage::Projected, 1.0)];
        let window = DateWindow::around_events(&events, 100_000_000).unwrap();
        assert_eq!(window.start, NaiveDate::MIN);
        assert_eq!(window.end, date(2024, 1, 1));
    }
}
