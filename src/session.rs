use std::collections::BTreeSet;

use chrono::NaiveDate;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::config::{
    Config, ProjectAliases, AGGREGATE_TTL, STATUS_FEED_TIMEOUT, STATUS_FEED_TTL,
    STATUS_WEEK_FEED_TIMEOUT, STATUS_WEEK_FEED_TTL,
};
use crate::db;
use crate::feeds::{FeedError, SectorStatus, SectorWeek, StatusFeeds};
use crate::forecast::apply_forecast;
use crate::models::{FamilyVolume, ProgressEvent, ProjectTotals, WeeklyProgressRow};
use crate::progress;
use crate::series::{DateWindow, SeriesBuilder};
use crate::store::BudgetStore;

/// Project and date filters shared by every view.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub projects: Vec<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl Selection {
    pub fn label(&self) -> String {
        if self.projects.is_empty() {
            "all projects".to_string()
        } else {
            self.projects.join(", ")
        }
    }

    /// Maps named projects onto the names their data is reported under.
    pub fn canonical(mut self, aliases: &ProjectAliases) -> Self {
        let mut seen = BTreeSet::new();
        self.projects = self
            .projects
            .iter()
            .map(|project| aliases.canonical(project))
            .filter(|project| seen.insert(project.clone()))
            .collect();
        self
    }

    /// Explicit projects, or every known project when none were named.
    pub fn resolve(&self, known: &[String]) -> Vec<String> {
        if self.projects.is_empty() {
            known.to_vec()
        } else {
            self.projects.clone()
        }
    }

    /// Explicit bounds override the default window derived from the data.
    pub fn window(&self, default: Option<DateWindow>) -> anyhow::Result<Option<DateWindow>> {
        let window = match (default, self.from, self.to) {
            (_, Some(start), Some(end)) => Some(DateWindow { start, end }),
            (Some(default), from, to) => Some(DateWindow {
                start: from.unwrap_or(default.start),
                end: to.unwrap_or(default.end),
            }),
            (None, Some(start), None) => Some(DateWindow {
                start,
                end: NaiveDate::MAX,
            }),
            (None, None, Some(end)) => Some(DateWindow {
                start: NaiveDate::MIN,
                end,
            }),
            (None, None, None) => None,
        };

        if let Some(window) = window {
            anyhow::ensure!(
                window.start <= window.end,
                "start date {} is after end date {}",
                window.start,
                window.end
            );
        }
        Ok(window)
    }
}

#[derive(Debug, Clone)]
pub struct WeeklyView {
    pub selected: Vec<String>,
    pub window: Option<DateWindow>,
    pub rows: Vec<WeeklyProgressRow>,
}

/// Distinct project names in first-seen order.
pub fn known_projects(events: &[ProgressEvent]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    events
        .iter()
        .filter(|event| seen.insert(event.project.clone()))
        .map(|event| event.project.clone())
        .collect()
}

/// Everything one dashboard session reads, with per-source staleness windows.
pub struct Dashboard {
    pool: PgPool,
    config: Config,
    feeds: StatusFeeds,
    events: TtlCache<Vec<ProgressEvent>>,
    totals: TtlCache<Vec<ProjectTotals>>,
    families: TtlCache<Vec<FamilyVolume>>,
    live_status: TtlCache<Vec<SectorStatus>>,
    weekly_status: TtlCache<Vec<SectorWeek>>,
}

impl Dashboard {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let feeds = StatusFeeds::new(
            &config.status_feed_url,
            &config.status_week_feed_url,
            STATUS_FEED_TIMEOUT,
            STATUS_WEEK_FEED_TIMEOUT,
        );
        Self {
            pool,
            config,
            feeds,
            events: TtlCache::new(AGGREGATE_TTL),
            totals: TtlCache::new(AGGREGATE_TTL),
            families: TtlCache::new(AGGREGATE_TTL),
            live_status: TtlCache::new(STATUS_FEED_TTL),
            weekly_status: TtlCache::new(STATUS_WEEK_FEED_TTL),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn events(&mut self) -> anyhow::Result<Vec<ProgressEvent>> {
        if let Some(events) = self.events.fresh() {
            return Ok(events.clone());
        }
        let events = db::fetch_progress_events(
            &self.pool,
            self.config.db_timeout,
            &self.config.aliases,
        )
        .await?;
        self.events.store(events.clone());
        Ok(events)
    }

    pub async fn totals(&mut self) -> anyhow::Result<Vec<ProjectTotals>> {
        if let Some(totals) = self.totals.fresh() {
            return Ok(totals.clone());
        }
        let totals = db::fetch_project_totals(
            &self.pool,
            self.config.db_timeout,
            &self.config.aliases,
        )
        .await?;
        self.totals.store(totals.clone());
        Ok(totals)
    }

    pub async fn families(&mut self) -> anyhow::Result<Vec<FamilyVolume>> {
        if let Some(families) = self.families.fresh() {
            return Ok(families.clone());
        }
        let families = db::fetch_family_volumes(
            &self.pool,
            self.config.db_timeout,
            &self.config.aliases,
        )
        .await?;
        self.families.store(families.clone());
        Ok(families)
    }

    pub async fn live_status(&mut self) -> Result<Vec<SectorStatus>, FeedError> {
        if let Some(records) = self.live_status.fresh() {
            return Ok(records.clone());
        }
        let records = self.feeds.live().await?;
        self.live_status.store(records.clone());
        Ok(records)
    }

    pub fn refresh_live_status(&mut self) {
        self.live_status.invalidate();
    }

    pub async fn weekly_status(&mut self) -> Result<Vec<SectorWeek>, FeedError> {
        if let Some(records) = self.weekly_status.fresh() {
            return Ok(records.clone());
        }
        let records = self.feeds.weekly().await?;
        self.weekly_status.store(records.clone());
        Ok(records)
    }

    /// Loads saved budgets and forecasts, seeding defaults for new projects.
    pub async fn open_store(&mut self) -> anyhow::Result<BudgetStore> {
        let events = self.events().await?;
        let mut store = BudgetStore::load(&self.pool, self.config.db_timeout).await?;
        store.ensure_projects(known_projects(&events));
        Ok(store)
    }

    /// Cumulative weekly progress with forecasts for the selection.
    pub async fn weekly_progress(
        &mut self,
        store: &BudgetStore,
        selection: &Selection,
    ) -> anyhow::Result<WeeklyView> {
        let events = self.events().await?;
        let selected = selection.resolve(&known_projects(&events));
        let default_window = DateWindow::around_events(&events, self.config.horizon_weeks);
        let window = selection.window(default_window)?;

        let mut builder = SeriesBuilder::new(self.config.horizon_weeks);
        if let Some(window) = window {
            builder = builder.with_window(window);
        }
        let selected_set: BTreeSet<String> = selected.iter().cloned().collect();
        let series = builder.build(&events, &selected_set);
        debug!(rows = series.len(), projects = selected.len(), "built weekly series");

        let forecasted = apply_forecast(&series, &store.forecasts());
        let rows = progress::weekly_progress(&forecasted, store);
        info!(rows = rows.len(), "computed weekly progress");

        Ok(WeeklyView {
            selected,
            window,
            rows,
        })
    }
}
