use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProjectAliases;
use crate::models::{
    parse_date_lenient, FamilyVolume, ProgressEvent, ProjectTotals, ScheduleAverages, Stage,
    StageValues, StageWindow,
};

/// Runs a query with an upper bound on how long it may block.
pub async fn bounded<T, F>(limit: Duration, what: &str, query: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, query).await {
        Ok(result) => result
            .map_err(|error| anyhow::Error::new(error).context(format!("failed to {what}"))),
        Err(_) => anyhow::bail!("timed out after {}s trying to {what}", limit.as_secs()),
    }
}

pub async fn bounded_any<T, F>(limit: Duration, what: &str, work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result.with_context(|| format!("failed to {what}")),
        Err(_) => anyhow::bail!("timed out after {}s trying to {what}", limit.as_secs()),
    }
}

/// True when the error is Postgres reporting an undefined table or schema.
pub fn is_missing_table(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<sqlx::Error>()
        .and_then(|error| error.as_database_error())
        .and_then(|error| error.code().map(|code| code.into_owned()))
        .is_some_and(|code| code == "42P01" || code == "3F000")
}

pub async fn init_db(pool: &PgPool, limit: Duration) -> anyhow::Result<()> {
    bounded_any(limit, "run migrations", async {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    })
    .await
}

/// One precast piece as tracked by the production system.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct PieceRow {
    pub project: String,
    pub piece_name: Option<String>,
    pub family: Option<String>,
    #[serde(default)]
    pub designed_on: Option<String>,
    #[serde(default)]
    pub finished_on: Option<String>,
    #[serde(default)]
    pub assembled_on: Option<String>,
    #[serde(default)]
    pub volume_projected: f64,
    #[serde(default)]
    pub volume_fabricated: f64,
    #[serde(default)]
    pub volume_finished: f64,
    #[serde(default)]
    pub volume_shipped: f64,
    #[serde(default)]
    pub volume_assembled: f64,
    pub volume_real: Option<f64>,
    pub steel_rate: Option<f64>,
    pub source_key: Option<String>,
}

pub fn read_piece_csv(csv_path: &std::path::Path) -> anyhow::Result<Vec<PieceRow>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut pieces = Vec::new();

    for (line, result) in reader.deserialize::<PieceRow>().enumerate() {
        let row = result.with_context(|| format!("invalid piece row {}", line + 1))?;
        pieces.push(row);
    }

    Ok(pieces)
}

async fn insert_piece(pool: &PgPool, piece: &PieceRow) -> anyhow::Result<bool> {
    let source_key = piece
        .source_key
        .clone()
        .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

    let result = sqlx::query(
        r#"
        INSERT INTO progress_dashboard.pieces
        (id, project, piece_name, family, designed_on, finished_on, assembled_on,
         volume_projected, volume_fabricated, volume_finished, volume_shipped,
         volume_assembled, volume_real, steel_rate, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&piece.project)
    .bind(&piece.piece_name)
    .bind(&piece.family)
    .bind(piece.designed_on.as_deref().and_then(parse_date_lenient))
    .bind(piece.finished_on.as_deref().and_then(parse_date_lenient))
    .bind(piece.assembled_on.as_deref().and_then(parse_date_lenient))
    .bind(piece.volume_projected)
    .bind(piece.volume_fabricated)
    .bind(piece.volume_finished)
    .bind(piece.volume_shipped)
    .bind(piece.volume_assembled)
    .bind(piece.volume_real)
    .bind(piece.steel_rate)
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn seed(pool: &PgPool, limit: Duration) -> anyhow::Result<()> {
    let pieces = [
        ("TOWER B", "P-101", "PILAR", "2025-09-01", "2025-10-06", "2025-11-17", 4.2, 96.0),
        ("TOWER B", "P-102", "PILAR", "2025-09-03", "2025-10-08", "2025-11-19", 4.2, 96.0),
        ("TOWER B", "V-201", "VIGA", "2025-09-15", "2025-10-20", "", 3.1, 110.0),
        ("TOWER B", "L-301", "LAJE", "2025-10-02", "", "", 6.8, 42.0),
        (
            "MALL SILVIO SILVEIRA - POA",
            "P-001",
            "PILAR",
            "2025-08-04",
            "2025-09-01",
            "2025-10-13",
            5.0,
            101.5,
        ),
        (
            "MALL SILVIO SILVEIRA - LOJAS",
            "V-014",
            "VIGA",
            "2025-08-11",
            "2025-09-08",
            "",
            2.7,
            118.0,
        ),
        (
            "MALL SILVIO SILVEIRA - LOJAS",
            "T-020",
            "TERCA",
            "2025-08-25",
            "",
            "",
            1.4,
            75.0,
        ),
    ];

    for (project, piece_name, family, designed_on, finished_on, assembled_on, volume, steel_rate) in
        pieces
    {
        let fabricated = if finished_on.is_empty() { 0.0 } else { volume };
        let assembled = if assembled_on.is_empty() { 0.0 } else { volume };
        let piece = PieceRow {
            project: project.to_string(),
            piece_name: Some(piece_name.to_string()),
            family: Some(family.to_string()),
            designed_on: Some(designed_on.to_string()),
            finished_on: Some(finished_on.to_string()).filter(|value| !value.is_empty()),
            assembled_on: Some(assembled_on.to_string()).filter(|value| !value.is_empty()),
            volume_projected: volume,
            volume_fabricated: fabricated,
            volume_finished: fabricated,
            volume_shipped: assembled,
            volume_assembled: assembled,
            volume_real: Some(volume),
            steel_rate: Some(steel_rate),
            source_key: Some(format!(
                "seed-{}-{piece_name}",
                project.to_lowercase().replace(' ', "-")
            )),
        };
        bounded_any(limit, "insert seed piece", insert_piece(pool, &piece)).await?;
    }

    Ok(())
}

pub async fn import_csv(
    pool: &PgPool,
    limit: Duration,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let mut inserted = 0usize;
    for piece in read_piece_csv(csv_path)? {
        if bounded_any(limit, "insert imported piece", insert_piece(pool, &piece)).await? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

/// Dated stage volumes; each piece contributes to a stage once its date is set.
pub async fn fetch_progress_events(
    pool: &PgPool,
    limit: Duration,
    aliases: &ProjectAliases,
) -> anyhow::Result<Vec<ProgressEvent>> {
    let query = r#"
        SELECT project, 'projected' AS stage, designed_on AS event_date,
               SUM(volume_projected) AS volume
        FROM progress_dashboard.pieces
        WHERE designed_on IS NOT NULL AND volume_projected > 0
        GROUP BY project, designed_on
        UNION ALL
        SELECT project, 'fabricated' AS stage, finished_on AS event_date,
               SUM(volume_fabricated) AS volume
        FROM progress_dashboard.pieces
        WHERE finished_on IS NOT NULL AND volume_fabricated > 0
        GROUP BY project, finished_on
        UNION ALL
        SELECT project, 'assembled' AS stage, assembled_on AS event_date,
               SUM(volume_assembled) AS volume
        FROM progress_dashboard.pieces
        WHERE assembled_on IS NOT NULL AND volume_assembled > 0
        GROUP BY project, assembled_on
        ORDER BY project, event_date
    "#;

    let rows = bounded(limit, "load weekly production", sqlx::query(query).fetch_all(pool)).await?;
    let mut events = Vec::with_capacity(rows.len());

    for row in rows {
        let stage_name: String = row.try_get("stage")?;
        let Some(stage) = Stage::parse(&stage_name) else {
            warn!(stage = %stage_name, "skipping unknown stage");
            continue;
        };
        let project: String = row.try_get("project")?;
        events.push(ProgressEvent {
            project: aliases.canonical(&project),
            date: row.try_get("event_date")?,
            stage,
            volume: row.try_get("volume")?,
        });
    }

    debug!(events = events.len(), "loaded production events");
    Ok(events)
}

pub async fn fetch_project_totals(
    pool: &PgPool,
    limit: Duration,
    aliases: &ProjectAliases,
) -> anyhow::Result<Vec<ProjectTotals>> {
    let query = r#"
        SELECT project,
               COALESCE(SUM(volume_projected), 0) AS projected,
               COALESCE(SUM(volume_fabricated), 0) AS fabricated,
               COALESCE(SUM(volume_finished), 0) AS finished,
               COALESCE(SUM(volume_shipped), 0) AS shipped,
               COALESCE(SUM(volume_assembled), 0) AS assembled,
               AVG(steel_rate) AS steel_rate
        FROM progress_dashboard.pieces
        GROUP BY project
        ORDER BY project
    "#;

    let rows = bounded(limit, "load project totals", sqlx::query(query).fetch_all(pool)).await?;
    let mut totals = Vec::with_capacity(rows.len());
    for row in rows {
        let project: String = row.try_get("project")?;
        totals.push(ProjectTotals {
            project: aliases.canonical(&project),
            projected: row.try_get("projected")?,
            fabricated: row.try_get("fabricated")?,
            finished: row.try_get("finished")?,
            shipped: row.try_get("shipped")?,
            assembled: row.try_get("assembled")?,
            steel_rate: row.try_get("steel_rate")?,
        });
    }

    Ok(merge_totals(totals))
}

/// Folds totals that share a project name: volumes add, steel rates average.
pub fn merge_totals(totals: Vec<ProjectTotals>) -> Vec<ProjectTotals> {
    let mut merged: BTreeMap<String, (ProjectTotals, Vec<f64>)> = BTreeMap::new();

    for totals in totals {
        let (entry, rates) = merged
            .entry(totals.project.clone())
            .or_insert_with(|| {
                (
                    ProjectTotals {
                        project: totals.project.clone(),
                        ..ProjectTotals::default()
                    },
                    Vec::new(),
                )
            });
        entry.projected += totals.projected;
        entry.fabricated += totals.fabricated;
        entry.finished += totals.finished;
        entry.shipped += totals.shipped;
        entry.assembled += totals.assembled;
        rates.extend(totals.steel_rate);
    }

    merged
        .into_values()
        .map(|(mut totals, rates)| {
            totals.steel_rate = if rates.is_empty() {
                None
            } else {
                Some(rates.iter().sum::<f64>() / rates.len() as f64)
            };
            totals
        })
        .collect()
}

pub async fn fetch_family_volumes(
    pool: &PgPool,
    limit: Duration,
    aliases: &ProjectAliases,
) -> anyhow::Result<Vec<FamilyVolume>> {
    let query = r#"
        SELECT project, family, COUNT(piece_name) AS units, SUM(volume_real) AS volume
        FROM progress_dashboard.pieces
        WHERE family IS NOT NULL AND piece_name IS NOT NULL AND volume_real IS NOT NULL
        GROUP BY project, family
        ORDER BY project, family
    "#;

    let rows = bounded(limit, "load family volumes", sqlx::query(query).fetch_all(pool)).await?;
    let mut merged: BTreeMap<(String, String), (i64, f64)> = BTreeMap::new();
    for row in rows {
        let project: String = row.try_get("project")?;
        let family: String = row.try_get("family")?;
        let units: i64 = row.try_get("units")?;
        let volume: f64 = row.try_get("volume")?;
        let entry = merged.entry((aliases.canonical(&project), family)).or_insert((0, 0.0));
        entry.0 += units;
        entry.1 += volume;
    }

    Ok(merged
        .into_iter()
        .map(|((project, family), (units, volume))| FamilyVolume {
            project,
            family,
            units,
            volume,
        })
        .collect())
}

/// First and last recorded date of each stage for one project, including aliased names.
pub async fn fetch_stage_bounds(
    pool: &PgPool,
    limit: Duration,
    aliases: &ProjectAliases,
    project: &str,
) -> anyhow::Result<StageValues<StageWindow>> {
    let query = r#"
        SELECT project,
               MIN(designed_on) AS projected_start, MAX(designed_on) AS projected_end,
               MIN(finished_on) AS fabricated_start, MAX(finished_on) AS fabricated_end,
               MIN(assembled_on) AS assembled_start, MAX(assembled_on) AS assembled_end
        FROM progress_dashboard.pieces
        GROUP BY project
    "#;

    let rows = bounded(limit, "load stage bounds", sqlx::query(query).fetch_all(pool)).await?;
    let mut bounds = StageValues::<StageWindow>::default();

    for row in rows {
        let name: String = row.try_get("project")?;
        if aliases.canonical(&name) != project {
            continue;
        }
        for (stage, start, end) in [
            (Stage::Projected, "projected_start", "projected_end"),
            (Stage::Fabricated, "fabricated_start", "fabricated_end"),
            (Stage::Assembled, "assembled_start", "assembled_end"),
        ] {
            let start: Option<NaiveDate> = row.try_get(start)?;
            let end: Option<NaiveDate> = row.try_get(end)?;
            let window = bounds.get_mut(stage);
            window.start = earliest(window.start, start);
            window.end = latest(window.end, end);
        }
    }

    Ok(bounds)
}

fn earliest(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Average stage durations and lags over projects that reached all three stages.
pub async fn fetch_schedule_averages(
    pool: &PgPool,
    limit: Duration,
) -> anyhow::Result<ScheduleAverages> {
    let query = r#"
        SELECT
            AVG((fim_p - ini_p)::DOUBLE PRECISION) AS design_days,
            AVG((ini_f - ini_p)::DOUBLE PRECISION) AS fabrication_lag_days,
            AVG((fim_f - ini_f)::DOUBLE PRECISION) AS fabrication_days,
            AVG((ini_m - ini_p)::DOUBLE PRECISION) AS assembly_lag_days,
            AVG((fim_m - ini_m)::DOUBLE PRECISION) AS assembly_days
        FROM (
            SELECT project,
                   MIN(designed_on) AS ini_p, MAX(designed_on) AS fim_p,
                   MIN(finished_on) AS ini_f, MAX(finished_on) AS fim_f,
                   MIN(assembled_on) AS ini_m, MAX(assembled_on) AS fim_m
            FROM progress_dashboard.pieces
            GROUP BY project
            HAVING MIN(designed_on) IS NOT NULL
               AND MIN(finished_on) IS NOT NULL
               AND MIN(assembled_on) IS NOT NULL
        ) AS per_project
    "#;

    let row = bounded(
        limit,
        "load schedule averages",
        sqlx::query(query).fetch_one(pool),
    )
    .await?;
    Ok(ScheduleAverages {
        design_days: row.try_get("design_days")?,
        fabrication_lag_days: row.try_get("fabrication_lag_days")?,
        fabrication_days: row.try_get("fabrication_days")?,
        assembly_lag_days: row.try_get("assembly_lag_days")?,
        assembly_days: row.try_get("assembly_days")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::io::Write;

    use sqlx::error::{DatabaseError, ErrorKind};
    use tempfile::NamedTempFile;

    #[derive(Debug, thiserror::Error)]
    #[error("relation does not exist")]
    struct PgFailure {
        code: &'static str,
    }

    impl DatabaseError for PgFailure {
        fn message(&self) -> &str {
            "relation does not exist"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn database_error(code: &'static str) -> anyhow::Error {
        anyhow::Error::new(sqlx::Error::Database(Box::new(PgFailure { code })))
            .context("failed to load budgets")
    }

    #[test]
    fn undefined_table_or_schema_counts_as_missing() {
        assert!(is_missing_table(&database_error("42P01")));
        assert!(is_missing_table(&database_error("3F000")));
    }

    #[test]
    fn other_failures_are_not_missing_tables() {
        assert!(!is_missing_table(&database_error("23505")));
        assert!(!is_missing_table(&anyhow::Error::new(sqlx::Error::RowNotFound)));
        assert!(!is_missing_table(&anyhow::anyhow!("timed out")));
    }

    #[tokio::test]
    async fn bounded_work_gives_up_after_limit() {
        let error = bounded_any(
            Duration::from_millis(10),
            "insert seed piece",
            std::future::pending::<anyhow::Result<()>>(),
        )
        .await
        .unwrap_err();
        assert!(error.to_string().contains("timed out"));

        let value = bounded_any(Duration::from_secs(1), "count", async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn piece_csv_keeps_malformed_dates_as_text() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "project,piece_name,family,designed_on,finished_on,assembled_on,volume_projected,volume_fabricated,volume_finished,volume_shipped,volume_assembled,volume_real,steel_rate,source_key"
        )
        .unwrap();
        writeln!(
            file,
            "TOWER B,P-1,PILAR,2025-01-06,not a date,,4.5,4.5,4.5,0,0,4.5,98.2,k-1"
        )
        .unwrap();
        writeln!(file, "TOWER B,P-2,,06/01/2025,,,2,0,0,0,0,,,").unwrap();

        let pieces = read_piece_csv(file.path()).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].source_key.as_deref(), Some("k-1"));
        assert_eq!(pieces[0].finished_on.as_deref().and_then(parse_date_lenient), None);
        assert_eq!(
            pieces[1].designed_on.as_deref().and_then(parse_date_lenient),
            NaiveDate::from_ymd_opt(2025, 1, 6)
        );
        assert_eq!(pieces[1].family, None);
        assert_eq!(pieces[1].steel_rate, None);
    }

    #[test]
    fn piece_csv_rejects_non_numeric_volume() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "project,piece_name,family,volume_projected,volume_real,steel_rate,source_key"
        )
        .unwrap();
        writeln!(file, "TOWER B,P-1,PILAR,lots,,,").unwrap();
        assert!(read_piece_csv(file.path()).is_err());
    }

    #[test]
    fn merged_totals_sum_volumes_and_average_rates() {
        let totals = vec![
            ProjectTotals {
                project: "MALL".to_string(),
                projected: 10.0,
                assembled: 2.0,
                steel_rate: Some(100.0),
                ..ProjectTotals::default()
            },
            ProjectTotals {
                project: "MALL".to_string(),
                projected: 5.0,
                steel_rate: Some(80.0),
                ..ProjectTotals::default()
            },
            ProjectTotals {
                project: "ANNEX".to_string(),
                projected: 1.0,
                ..ProjectTotals::default()
            },
        ];

        let merged = merge_totals(totals);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].project, "ANNEX");
        assert_eq!(merged[0].steel_rate, None);
        assert_eq!(merged[1].projected, 15.0);
        assert_eq!(merged[1].assembled, 2.0);
        assert_eq!(merged[1].steel_rate, Some(90.0));
    }

    #[test]
    fn bound_helpers_ignore_unset_dates() {
        let a = NaiveDate::from_ymd_opt(2024, 1, 1);
        let b = NaiveDate::from_ymd_opt(2024, 2, 1);
        assert_eq!(earliest(a, b), a);
        assert_eq!(latest(a, b), b);
        assert_eq!(earliest(None, b), b);
        assert_eq!(latest(a, None), a);
        assert_eq!(earliest(None, None), None);
    }
}
