use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;

use crate::series::{DEFAULT_HORIZON_WEEKS, MAX_HORIZON_WEEKS};

pub const STATUS_FEED_URL: &str = "https://war-room-vejv.vercel.app/api/war-room";
pub const STATUS_WEEK_FEED_URL: &str = "https://war-room-vejv.vercel.app/api/war-room-week";

pub const AGGREGATE_TTL: Duration = Duration::from_secs(300);
pub const STATUS_FEED_TTL: Duration = Duration::from_secs(10);
pub const STATUS_WEEK_FEED_TTL: Duration = Duration::from_secs(300);
pub const STATUS_FEED_TIMEOUT: Duration = Duration::from_secs(10);
pub const STATUS_WEEK_FEED_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_ALIASES: &str = "MALL SILVIO SILVEIRA - LOJAS=MALL SILVIO SILVEIRA - POA";

/// Maps legacy project names onto the name they are reported under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectAliases(HashMap<String, String>);

impl ProjectAliases {
    /// Parses `FROM=TO` pairs separated by `;`.
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let mut aliases = HashMap::new();
        for pair in value.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (from, to) = pair
                .split_once('=')
                .with_context(|| format!("project alias `{pair}` must look like FROM=TO"))?;
            aliases.insert(from.trim().to_string(), to.trim().to_string());
        }
        Ok(Self(aliases))
    }

    pub fn canonical(&self, project: &str) -> String {
        self.0
            .get(project)
            .cloned()
            .unwrap_or_else(|| project.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_timeout: Duration,
    pub status_feed_url: String,
    pub status_week_feed_url: String,
    pub horizon_weeks: u32,
    pub aliases: ProjectAliases,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to the production Postgres instance")?;

        let db_timeout_secs = env_parse("DASHBOARD_DB_TIMEOUT_SECS", 30u64)?;
        let horizon_weeks = check_horizon(env_parse(
            "DASHBOARD_HORIZON_WEEKS",
            DEFAULT_HORIZON_WEEKS,
        )?)?;
        let aliases = ProjectAliases::parse(
            &std::env::var("DASHBOARD_PROJECT_ALIASES")
                .unwrap_or_else(|_| DEFAULT_ALIASES.to_string()),
        )?;

        Ok(Self {
            database_url,
            db_timeout: Duration::from_secs(db_timeout_secs.max(1)),
            status_feed_url: std::env::var("STATUS_FEED_URL")
                .unwrap_or_else(|_| STATUS_FEED_URL.to_string()),
            status_week_feed_url: std::env::var("STATUS_WEEK_FEED_URL")
                .unwrap_or_else(|_| STATUS_WEEK_FEED_URL.to_string()),
            horizon_weeks,
            aliases,
        })
    }
}

fn check_horizon(weeks: u32) -> anyhow::Result<u32> {
    anyhow::ensure!(
        weeks <= MAX_HORIZON_WEEKS,
        "DASHBOARD_HORIZON_WEEKS must be at most {MAX_HORIZON_WEEKS}, got {weeks}"
    );
    Ok(weeks)
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value `{value}`")),
        Err(_) => Ok(default),
    }
}
