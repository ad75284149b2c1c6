use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod db;
mod feeds;
mod forecast;
mod models;
mod planner;
mod progress;
mod report;
mod series;
mod session;
mod store;

use config::Config;
use models::{parse_date_lenient, Stage};
use session::{Dashboard, Selection};
use store::BudgetStore;

#[derive(Parser)]
#[command(name = "progress-dashboard")]
#[command(about = "Weekly production progress against budgets and forecasts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SelectionArgs {
    /// Restrict to these projects (repeatable); defaults to every project
    #[arg(long = "project")]
    projects: Vec<String>,
    /// First week shown (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last week shown (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl SelectionArgs {
    /// Named projects are matched under their reported names.
    fn into_selection(self, config: &Config) -> Selection {
        Selection {
            projects: self.projects,
            from: self.from,
            to: self.to,
        }
        .canonical(&config.aliases)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed pieces
    Seed,
    /// Import pieces from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Cumulative weekly progress with forecasts
    Weekly {
        #[command(flatten)]
        selection: SelectionArgs,
        /// Also write the table as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// One project at a time; the index wraps around the selection
    Project {
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        index: i64,
    },
    /// Totals, budget share and days left for every project
    Summary {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Simulate a new project's schedule from a reference
    Plan {
        /// Reference project; defaults to the average of all projects
        #[arg(long)]
        reference: Option<String>,
        /// Simulation start date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Planned family totals as NAME=UNITS:VOLUME (repeatable)
        #[arg(long)]
        family: Vec<String>,
    },
    /// Live production status by sector
    WarRoom,
    /// Redraw the war room and weekly totals until interrupted
    Watch {
        #[command(flatten)]
        selection: SelectionArgs,
        /// Seconds between redraws
        #[arg(long = "interval", default_value_t = 10)]
        interval_secs: u64,
        /// Re-fetch the live status on every redraw instead of honouring its cache
        #[arg(long)]
        refresh: bool,
    },
    /// Inspect or edit project budgets and stage dates
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },
    /// Inspect or edit weekly forecast percentages
    Forecast {
        #[command(subcommand)]
        action: ForecastAction,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum BudgetAction {
    List,
    Set {
        #[arg(long)]
        project: String,
        #[arg(long)]
        volume: Option<f64>,
        #[arg(long)]
        slabs: Option<f64>,
        #[arg(long)]
        design_start: Option<String>,
        #[arg(long)]
        design_end: Option<String>,
        #[arg(long)]
        fabrication_start: Option<String>,
        #[arg(long)]
        fabrication_end: Option<String>,
        #[arg(long)]
        assembly_start: Option<String>,
        #[arg(long)]
        assembly_end: Option<String>,
    },
}

#[derive(Subcommand)]
enum ForecastAction {
    List {
        #[arg(long)]
        project: Option<String>,
    },
    Set {
        #[arg(long)]
        project: String,
        /// Any date in the target week
        #[arg(long)]
        week: NaiveDate,
        /// design, fabrication or assembly
        #[arg(long)]
        stage: String,
        #[arg(long)]
        pct: f64,
    },
    Clear {
        #[arg(long)]
        project: String,
        #[arg(long)]
        week: NaiveDate,
    },
}

impl Commands {
    fn needs_database_up_front(&self) -> bool {
        !matches!(self, Commands::WarRoom)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let options = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(config.db_timeout);
    let pool = if cli.command.needs_database_up_front() {
        options
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?
    } else {
        options
            .connect_lazy(&config.database_url)
            .context("invalid DATABASE_URL")?
    };
    let db_timeout = config.db_timeout;
    let mut dashboard = Dashboard::new(pool.clone(), config);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool, db_timeout).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool, db_timeout).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, db_timeout, &csv).await?;
            println!("Inserted {inserted} pieces from {}.", csv.display());
        }
        Commands::Weekly { selection, csv } => {
            let selection = selection.into_selection(dashboard.config());
            let store = open_store(&mut dashboard).await?;
            let view = dashboard.weekly_progress(&store, &selection).await?;
            print!("{}", report::weekly_table(&view.rows));
            if let Some(path) = csv {
                report::write_weekly_csv(&path, &view.rows)?;
                println!("CSV written to {}.", path.display());
            }
        }
        Commands::Project { selection, index } => {
            let selection = selection.into_selection(dashboard.config());
            let store = open_store(&mut dashboard).await?;
            let view = dashboard.weekly_progress(&store, &selection).await?;

            if view.selected.is_empty() {
                println!("Select at least one project.");
                return Ok(());
            }

            let position = index.rem_euclid(view.selected.len() as i64) as usize;
            let project = &view.selected[position];
            let rows: Vec<_> = view
                .rows
                .iter()
                .filter(|row| &row.project == project)
                .cloned()
                .collect();
            let summary = match dashboard.totals().await {
                Ok(totals) => progress::summarize_projects(&totals, &store, progress::today())
                    .into_iter()
                    .find(|summary| &summary.project == project),
                Err(error) => {
                    warn!(error = %error, "project totals unavailable");
                    None
                }
            };
            let slide = report::project_slide(
                project,
                position,
                view.selected.len(),
                &rows,
                summary.as_ref(),
            );
            print!("{slide}");
        }
        Commands::Summary { selection } => {
            let selection = selection.into_selection(dashboard.config());
            let store = open_store(&mut dashboard).await?;
            let totals = dashboard.totals().await?;
            let mut summaries = progress::summarize_projects(&totals, &store, progress::today());
            if !selection.projects.is_empty() {
                summaries.retain(|summary| selection.projects.contains(&summary.project));
            }
            print!("{}", report::summary_table(&summaries));
            println!();
            let weekly_feed = dashboard.weekly_status().await;
            print!("{}", report::weekly_status_table(&weekly_feed));
        }
        Commands::Plan {
            reference,
            start,
            family,
        } => {
            run_plan(&mut dashboard, reference, start, &family).await?;
        }
        Commands::WarRoom => match dashboard.live_status().await {
            Ok(records) => print!(
                "{}",
                report::live_status_table(&records, Local::now().naive_local())
            ),
            Err(error) => println!("War room unavailable: {error}"),
        },
        Commands::Watch {
            selection,
            interval_secs,
            refresh,
        } => {
            let selection = selection.into_selection(dashboard.config());
            let store = open_store(&mut dashboard).await?;
            let mut view = WatchView {
                dashboard: &mut dashboard,
                store,
                selection,
                force_refresh: refresh,
            };
            let period = Duration::from_secs(interval_secs.max(1));
            let redraws = run_until_shutdown(tokio::signal::ctrl_c(), period, &mut view).await;
            info!(redraws, "watch stopped");
        }
        Commands::Budget { action } => run_budget(&mut dashboard, action).await?,
        Commands::Forecast { action } => run_forecast(&mut dashboard, action).await?,
        Commands::Report { selection, out } => {
            let selection = selection.into_selection(dashboard.config());
            let store = open_store(&mut dashboard).await?;
            let view = dashboard.weekly_progress(&store, &selection).await?;
            let totals = dashboard.totals().await?;
            let mut summaries = progress::summarize_projects(&totals, &store, progress::today());
            summaries.retain(|summary| view.selected.contains(&summary.project));
            let weekly_feed = dashboard.weekly_status().await;

            let report = report::build_report(
                &selection.label(),
                view.window,
                &summaries,
                &view.rows,
                &weekly_feed,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

/// Something redrawn on every `watch` tick.
trait Redraw {
    async fn redraw(&mut self);
}

struct WatchView<'a> {
    dashboard: &'a mut Dashboard,
    store: BudgetStore,
    selection: Selection,
    force_refresh: bool,
}

impl Redraw for WatchView<'_> {
    async fn redraw(&mut self) {
        if self.force_refresh {
            self.dashboard.refresh_live_status();
        }
        match self.dashboard.live_status().await {
            Ok(records) => print!(
                "{}",
                report::live_status_table(&records, Local::now().naive_local())
            ),
            Err(error) => println!("War room unavailable: {error}"),
        }
        match self
            .dashboard
            .weekly_progress(&self.store, &self.selection)
            .await
        {
            Ok(view) => {
                println!();
                let latest = progress::latest_per_project(&view.rows);
                print!("{}", report::weekly_table(&latest));
            }
            Err(error) => println!("Weekly progress unavailable: {error:#}"),
        }
        println!();
    }
}

/// Redraws every `period` until `shutdown` resolves; returns the number of redraws.
///
/// `shutdown` is created once, so a signal that arrives mid-redraw ends the
/// loop at the next iteration.
async fn run_until_shutdown<S, R>(shutdown: S, period: Duration, target: &mut R) -> u64
where
    S: Future,
    R: Redraw,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(period);
    let mut redraws = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                target.redraw().await;
                redraws += 1;
            }
        }
    }

    redraws
}

async fn open_store(dashboard: &mut Dashboard) -> anyhow::Result<BudgetStore> {
    dashboard
        .open_store()
        .await
        .context("failed to load production data")
}

async fn run_plan(
    dashboard: &mut Dashboard,
    reference: Option<String>,
    start: Option<NaiveDate>,
    family: &[String],
) -> anyhow::Result<()> {
    let inputs = family
        .iter()
        .map(|value| planner::FamilyInput::parse(value))
        .collect::<anyhow::Result<Vec<_>>>()?;

    match dashboard.families().await {
        Ok(families) => {
            let known: BTreeSet<&str> = families
                .iter()
                .map(|family| family.family.as_str())
                .collect();
            for input in inputs.iter().filter(|input| !known.contains(input.family.as_str())) {
                warn!(family = %input.family, "family has no recorded pieces");
            }
            if let Some(project) = reference.as_deref() {
                let recorded: Vec<_> = families
                    .iter()
                    .filter(|family| family.project == project)
                    .cloned()
                    .collect();
                print!("{}", report::families_table(project, &recorded));
                println!();
            } else if inputs.is_empty() {
                let names = known.iter().copied().collect::<Vec<_>>().join(", ");
                info!(families = %names, "no family totals given");
            }
        }
        Err(error) => warn!(error = %error, "family list unavailable"),
    }

    let units: u32 = inputs.iter().map(|input| input.units).sum();
    let total_volume: f64 = inputs.iter().map(|input| input.volume).sum();
    let start = start.unwrap_or_else(progress::today);

    let timeout = dashboard.config().db_timeout;
    let (label, plan_reference) = match reference {
        Some(project) => {
            let bounds = db::fetch_stage_bounds(
                dashboard.pool(),
                timeout,
                &dashboard.config().aliases,
                &project,
            )
            .await?;
            (project, planner::PlanReference::Project(bounds))
        }
        None => {
            let averages = db::fetch_schedule_averages(dashboard.pool(), timeout).await?;
            (
                "average of all projects".to_string(),
                planner::PlanReference::Averages(averages),
            )
        }
    };

    match planner::project_windows(&plan_reference, start) {
        Some(windows) => {
            let rows = planner::build_plan(&windows, total_volume);
            print!("{}", report::plan_table(&label, units, total_volume, &rows));
        }
        None => println!("Could not generate a schedule: insufficient data for {label}."),
    }
    Ok(())
}

async fn run_budget(dashboard: &mut Dashboard, action: BudgetAction) -> anyhow::Result<()> {
    let mut store = open_store(dashboard).await?;

    match action {
        BudgetAction::List => print!("{}", report::budgets_table(store.budgets())),
        BudgetAction::Set {
            project,
            volume,
            slabs,
            design_start,
            design_end,
            fabrication_start,
            fabrication_end,
            assembly_start,
            assembly_end,
        } => {
            if let Some(volume) = volume {
                anyhow::ensure!(volume > 0.0, "budget volume must be positive");
                store.set_budget_volume(&project, volume);
            }

            let budget = store.budget_mut(&project);
            if let Some(slabs) = slabs {
                anyhow::ensure!(slabs >= 0.0, "slab budget must not be negative");
                budget.budget_slabs_volume = slabs;
            }
            let dates = [
                (Stage::Projected, design_start, design_end),
                (Stage::Fabricated, fabrication_start, fabrication_end),
                (Stage::Assembled, assembly_start, assembly_end),
            ];
            for (stage, start, end) in dates {
                let window = budget.schedule.get_mut(stage);
                if let Some(start) = start {
                    window.start = parse_date_lenient(&start);
                }
                if let Some(end) = end {
                    window.end = parse_date_lenient(&end);
                }
            }

            store
                .save(dashboard.pool(), dashboard.config().db_timeout)
                .await?;
            println!("Budget saved for {project}.");
        }
    }

    Ok(())
}

async fn run_forecast(dashboard: &mut Dashboard, action: ForecastAction) -> anyhow::Result<()> {
    let mut store = open_store(dashboard).await?;

    match action {
        ForecastAction::List { project } => {
            let points: Vec<_> = store
                .forecasts()
                .into_iter()
                .filter(|point| project.as_ref().map_or(true, |project| &point.project == project))
                .collect();
            print!("{}", report::forecasts_table(&points));
        }
        ForecastAction::Set {
            project,
            week,
            stage,
            pct,
        } => {
            let stage = Stage::parse(&stage).with_context(|| {
                format!("unknown stage `{stage}`; use design, fabrication or assembly")
            })?;
            anyhow::ensure!(pct >= 0.0, "forecast percentage must not be negative");
            store.set_forecast(&project, week, stage, Some(pct));
            store
                .save(dashboard.pool(), dashboard.config().db_timeout)
                .await?;
            println!(
                "{} forecast for {project} in week {} set to {pct:.0}%.",
                stage.label(),
                report::format_week(series::week_start(week))
            );
        }
        ForecastAction::Clear { project, week } => {
            if store.clear_forecast(&project, week) {
                store
                    .save(dashboard.pool(), dashboard.config().db_timeout)
                    .await?;
                println!("Forecast cleared for {project}.");
            } else {
                println!("No forecast recorded for {project} in that week.");
            }
        }
    }

    Ok(())
}
