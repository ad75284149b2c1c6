use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::db;
use crate::models::{Budget, ForecastPoint, Stage, StageValues, StageWindow};
use crate::series::week_start;

/// User-maintained budgets and weekly forecasts.
///
/// Loaded once per session, mutated in memory, and written back with
/// [`BudgetStore::save`], which replaces both tables wholesale. Concurrent
/// editors are not reconciled: the last save wins.
#[derive(Debug, Clone, Default)]
pub struct BudgetStore {
    budgets: BTreeMap<String, Budget>,
    forecasts: BTreeMap<(String, NaiveDate), StageValues<Option<f64>>>,
}

impl BudgetStore {
    pub async fn load(pool: &PgPool, timeout: Duration) -> anyhow::Result<Self> {
        let mut store = Self::default();

        match db::bounded(
            timeout,
            "load budgets",
            sqlx::query(
                "SELECT project, budget_volume, budget_slabs_volume, \
                 projected_start, projected_end, fabricated_start, fabricated_end, \
                 assembled_start, assembled_end \
                 FROM progress_dashboard.project_budgets",
            )
            .fetch_all(pool),
        )
        .await
        {
            Ok(rows) => {
                for row in rows {
                    let project: String = row.try_get("project")?;
                    let budget_volume: Option<f64> = row.try_get("budget_volume")?;
                    let budget_slabs_volume: Option<f64> = row.try_get("budget_slabs_volume")?;
                    let budget = Budget {
                        project: project.clone(),
                        budget_volume: budget_volume.unwrap_or(Budget::DEFAULT_VOLUME),
                        budget_slabs_volume: budget_slabs_volume
                            .unwrap_or(Budget::DEFAULT_SLABS_VOLUME),
                        schedule: StageValues {
                            projected: StageWindow {
                                start: row.try_get("projected_start")?,
                                end: row.try_get("projected_end")?,
                            },
                            fabricated: StageWindow {
                                start: row.try_get("fabricated_start")?,
                                end: row.try_get("fabricated_end")?,
                            },
                            assembled: StageWindow {
                                start: row.try_get("assembled_start")?,
                                end: row.try_get("assembled_end")?,
                            },
                        },
                    };
                    store.budgets.entry(project).or_insert(budget);
                }
            }
            Err(error) if db::is_missing_table(&error) => {
                info!("no saved budgets yet");
            }
            Err(error) => return Err(error),
        }

        match db::bounded(
            timeout,
            "load forecasts",
            sqlx::query(
                "SELECT project, week_start, projected_pct, fabricated_pct, assembled_pct \
                 FROM progress_dashboard.weekly_forecasts",
            )
            .fetch_all(pool),
        )
        .await
        {
            Ok(rows) => {
                for row in rows {
                    let project: String = row.try_get("project")?;
                    let week: NaiveDate = row.try_get("week_start")?;
                    let pct = StageValues {
                        projected: row.try_get("projected_pct")?,
                        fabricated: row.try_get("fabricated_pct")?,
                        assembled: row.try_get("assembled_pct")?,
                    };
                    store.forecasts.insert((project, week), pct);
                }
            }
            Err(error) if db::is_missing_table(&error) => {
                info!("no saved forecasts yet");
            }
            Err(error) => return Err(error),
        }

        info!(
            budgets = store.budgets.len(),
            forecasts = store.forecasts.len(),
            "loaded budget store"
        );
        Ok(store)
    }

    /// Replaces both persisted tables with the in-memory contents.
    pub async fn save(&self, pool: &PgPool, timeout: Duration) -> anyhow::Result<()> {
        db::bounded_any(timeout, "save budget store", self.write_all(pool)).await?;
        info!(
            budgets = self.budgets.len(),
            forecasts = self.forecasts.len(),
            "saved budget store"
        );
        Ok(())
    }

    async fn write_all(&self, pool: &PgPool) -> anyhow::Result<()> {
        let mut tx = pool.begin().await.context("failed to open transaction")?;

        sqlx::query("CREATE SCHEMA IF NOT EXISTS progress_dashboard")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS progress_dashboard.project_budgets (
                project TEXT NOT NULL,
                budget_volume DOUBLE PRECISION,
                budget_slabs_volume DOUBLE PRECISION,
                projected_start DATE,
                projected_end DATE,
                fabricated_start DATE,
                fabricated_end DATE,
                assembled_start DATE,
                assembled_end DATE
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS progress_dashboard.weekly_forecasts (
                project TEXT NOT NULL,
                week_start DATE NOT NULL,
                projected_pct DOUBLE PRECISION,
                fabricated_pct DOUBLE PRECISION,
                assembled_pct DOUBLE PRECISION
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM progress_dashboard.project_budgets")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM progress_dashboard.weekly_forecasts")
            .execute(&mut *tx)
            .await?;

        for budget in self.budgets.values() {
            let schedule = &budget.schedule;
            sqlx::query(
                r#"
                INSERT INTO progress_dashboard.project_budgets
                (project, budget_volume, budget_slabs_volume,
                 projected_start, projected_end, fabricated_start, fabricated_end,
                 assembled_start, assembled_end)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(&budget.project)
            .bind(budget.budget_volume)
            .bind(budget.budget_slabs_volume)
            .bind(schedule.projected.start)
            .bind(schedule.projected.end)
            .bind(schedule.fabricated.start)
            .bind(schedule.fabricated.end)
            .bind(schedule.assembled.start)
            .bind(schedule.assembled.end)
            .execute(&mut *tx)
            .await?;
        }

        for ((project, week), pct) in &self.forecasts {
            sqlx::query(
                r#"
                INSERT INTO progress_dashboard.weekly_forecasts
                (project, week_start, projected_pct, fabricated_pct, assembled_pct)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(project)
            .bind(week)
            .bind(pct.projected)
            .bind(pct.fabricated)
            .bind(pct.assembled)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("failed to commit budget store")?;
        Ok(())
    }

    /// Seeds a default budget for every project not seen before.
    pub fn ensure_projects<I, S>(&mut self, projects: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for project in projects {
            let project = project.as_ref();
            if !self.budgets.contains_key(project) {
                self.budgets
                    .insert(project.to_string(), Budget::with_defaults(project));
            }
        }
    }

    pub fn budget(&self, project: &str) -> Option<&Budget> {
        self.budgets.get(project)
    }

    pub fn budgets(&self) -> impl Iterator<Item = &Budget> {
        self.budgets.values()
    }

    pub fn budget_mut(&mut self, project: &str) -> &mut Budget {
        self.budgets
            .entry(project.to_string())
            .or_insert_with(|| Budget::with_defaults(project))
    }

    pub fn set_budget_volume(&mut self, project: &str, volume: f64) {
        if volume < 0.0 {
            warn!(project, volume, "negative budget volume recorded");
        }
        self.budget_mut(project).budget_volume = volume;
    }

    /// Records a forecast for the week containing `date`. `None` or 0 clears it.
    pub fn set_forecast(&mut self, project: &str, date: NaiveDate, stage: Stage, pct: Option<f64>) {
        let key = (project.to_string(), week_start(date));
        let pct = pct.filter(|value| *value != 0.0);
        let entry = self.forecasts.entry(key.clone()).or_default();
        *entry.get_mut(stage) = pct;

        if Stage::ALL.iter().all(|stage| entry.get(*stage).is_none()) {
            self.forecasts.remove(&key);
        }
    }

    pub fn clear_forecast(&mut self, project: &str, date: NaiveDate) -> bool {
        self.forecasts
            .remove(&(project.to_string(), week_start(date)))
            .is_some()
    }

    pub fn forecasts(&self) -> Vec<ForecastPoint> {
        self.forecasts
            .iter()
            .map(|((project, week_start), pct)| ForecastPoint {
                project: project.clone(),
                week_start: *week_start,
                pct: *pct,
            })
            .collect()
    }
}
