use chrono::NaiveDate;

/// The three scheduled production stages tracked week by week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Projected,
    Fabricated,
    Assembled,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Projected, Stage::Fabricated, Stage::Assembled];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Projected => "Design",
            Stage::Fabricated => "Fabrication",
            Stage::Assembled => "Assembly",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        match value.trim().to_ascii_lowercase().as_str() {
            "projected" | "design" | "projeto" => Some(Stage::Projected),
            "fabricated" | "fabrication" | "fabricacao" => Some(Stage::Fabricated),
            "assembled" | "assembly" | "montagem" => Some(Stage::Assembled),
            _ => None,
        }
    }
}

/// One value per scheduled stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageValues<T> {
    pub projected: T,
    pub fabricated: T,
    pub assembled: T,
}

impl<T> StageValues<T> {
    pub fn get(&self, stage: Stage) -> &T {
        match stage {
            Stage::Projected => &self.projected,
            Stage::Fabricated => &self.fabricated,
            Stage::Assembled => &self.assembled,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut T {
        match stage {
            Stage::Projected => &mut self.projected,
            Stage::Fabricated => &mut self.fabricated,
            Stage::Assembled => &mut self.assembled,
        }
    }
}

/// A raw dated volume observation for one stage of one project.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub project: String,
    pub date: NaiveDate,
    pub stage: Stage,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeRow {
    pub project: String,
    pub week_start: NaiveDate,
    pub volume: StageValues<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastedRow {
    pub row: CumulativeRow,
    /// `None` renders as a break in the forecast line.
    pub forecast: StageValues<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyProgressRow {
    pub project: String,
    pub week_start: NaiveDate,
    pub volume: StageValues<f64>,
    pub realized_pct: StageValues<f64>,
    pub forecast_pct: StageValues<Option<f64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub project: String,
    pub budget_volume: f64,
    pub budget_slabs_volume: f64,
    pub schedule: StageValues<StageWindow>,
}

impl Budget {
    pub const DEFAULT_VOLUME: f64 = 100.0;
    pub const DEFAULT_SLABS_VOLUME: f64 = 0.0;

    pub fn with_defaults(project: &str) -> Self {
        Self {
            project: project.to_string(),
            budget_volume: Self::DEFAULT_VOLUME,
            budget_slabs_volume: Self::DEFAULT_SLABS_VOLUME,
            schedule: StageValues::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub project: String,
    pub week_start: NaiveDate,
    pub pct: StageValues<Option<f64>>,
}

/// Lifetime volumes of a project across all five tracked stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectTotals {
    pub project: String,
    pub projected: f64,
    pub fabricated: f64,
    pub finished: f64,
    pub shipped: f64,
    pub assembled: f64,
    pub steel_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSummary {
    pub project: String,
    pub budget_volume: f64,
    pub budget_slabs_volume: f64,
    pub totals: ProjectTotals,
    pub projected_pct: f64,
    pub fabricated_pct: f64,
    pub finished_pct: f64,
    pub shipped_pct: f64,
    pub assembled_pct: f64,
    pub days_left: StageValues<Option<i64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FamilyVolume {
    pub project: String,
    pub family: String,
    pub units: i64,
    pub volume: f64,
}

/// Cross-project schedule averages, in days.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScheduleAverages {
    pub design_days: Option<f64>,
    pub fabrication_lag_days: Option<f64>,
    pub fabrication_days: Option<f64>,
    pub assembly_lag_days: Option<f64>,
    pub assembly_days: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanRow {
    pub week_start: NaiveDate,
    pub volume: StageValues<f64>,
}

/// Parses a user-entered date, accepting ISO and day-first forms.
/// Anything else is treated as unset.
pub fn parse_date_lenient(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .or_else(|| {
            trimmed
                .get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        });

    if parsed.is_none() {
        tracing::warn!(value = trimmed, "ignoring malformed date");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_dates_accept_common_forms() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9);
        assert_eq!(parse_date_lenient("2024-03-09"), expected);
        assert_eq!(parse_date_lenient(" 09/03/2024 "), expected);
        assert_eq!(parse_date_lenient("2024-03-09T00:00:00"), expected);
        assert_eq!(parse_date_lenient("next tuesday"), None);
        assert_eq!(parse_date_lenient(""), None);
        assert_eq!(parse_date_lenient("2024-02-30"), None);
    }

    #[test]
    fn stage_names_parse_in_both_languages() {
        assert_eq!(Stage::parse("Design"), Some(Stage::Projected));
        assert_eq!(Stage::parse("montagem"), Some(Stage::Assembled));
        assert_eq!(Stage::parse("fabricated"), Some(Stage::Fabricated));
        assert_eq!(Stage::parse("shipping"), None);
    }
}
