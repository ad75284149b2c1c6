use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{feed} returned something other than a list")]
    UnexpectedShape { feed: &'static str },
    #[error("{feed} returned records that could not be read: {source}")]
    Decode {
        feed: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One production sector as reported by the live status feed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SectorStatus {
    #[serde(rename = "setor")]
    pub sector: String,
    #[serde(rename = "unidade")]
    pub unit: String,
    #[serde(rename = "progOntem")]
    pub programmed_yesterday: Option<f64>,
    #[serde(rename = "qProgOntem")]
    pub programmed_yesterday_qty: Option<f64>,
    #[serde(rename = "realOntem")]
    pub realized_yesterday: Option<f64>,
    #[serde(rename = "qRealOntem")]
    pub realized_yesterday_qty: Option<f64>,
    #[serde(rename = "progHoje")]
    pub programmed_today: Option<f64>,
    #[serde(rename = "qProgHoje")]
    pub programmed_today_qty: Option<f64>,
    #[serde(rename = "realHoje8h")]
    pub realized_8h: Option<f64>,
    #[serde(rename = "qReal8h")]
    pub realized_8h_qty: Option<f64>,
    #[serde(rename = "realHoje13h")]
    pub realized_13h: Option<f64>,
    #[serde(rename = "qReal13h")]
    pub realized_13h_qty: Option<f64>,
    #[serde(rename = "realHoje18h")]
    pub realized_18h: Option<f64>,
    #[serde(rename = "qReal18h")]
    pub realized_18h_qty: Option<f64>,
    #[serde(rename = "progAmanha")]
    pub programmed_tomorrow: Option<f64>,
    #[serde(rename = "qProgAmanha")]
    pub programmed_tomorrow_qty: Option<f64>,
}

impl SectorStatus {
    pub fn met_yesterday_goal(&self) -> bool {
        self.realized_yesterday.unwrap_or(0.0) >= self.programmed_yesterday.unwrap_or(0.0)
    }
}

/// Weekly programmed and realized totals for one sector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SectorWeek {
    #[serde(rename = "inicio")]
    pub start: String,
    #[serde(rename = "fim")]
    pub end: String,
    #[serde(rename = "setor")]
    pub sector: String,
    #[serde(rename = "total_programado")]
    pub programmed: f64,
    #[serde(rename = "total_realizado")]
    pub realized: f64,
}

impl SectorWeek {
    /// `dd/mm to dd/mm`, falling back to the raw text for unreadable dates.
    pub fn date_label(&self) -> String {
        format!("{} to {}", short_date(&self.start), short_date(&self.end))
    }
}

fn short_date(value: &str) -> String {
    value
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .map(|date| date.format("%d/%m").to_string())
        .unwrap_or_else(|| value.to_string())
}

/// Time-of-day checkpoint currently being filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Morning,
    Midday,
    Evening,
}

impl Checkpoint {
    pub fn for_hour(hour: u32) -> Self {
        match hour {
            0..=7 => Checkpoint::Morning,
            8..=12 => Checkpoint::Midday,
            _ => Checkpoint::Evening,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Checkpoint::Morning => "Today 8h",
            Checkpoint::Midday => "Today 13h",
            Checkpoint::Evening => "Today 18h",
        }
    }
}

/// `1234.56` → `1.234,6`
pub fn format_decimal(value: f64) -> String {
    let fixed = format!("{:.1}", value.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), "0"));

    let mut grouped = String::new();
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }

    let sign = if value < 0.0 && fixed != "0.0" { "-" } else { "" };
    format!("{sign}{grouped},{fraction}")
}

/// Renders a value/quantity pair according to the sector's unit tag.
pub fn format_measure(value: Option<f64>, quantity: Option<f64>, unit: &str) -> String {
    let Some(value) = value else {
        return "-".to_string();
    };
    let quantity = quantity.unwrap_or(0.0);
    if value == 0.0 && quantity == 0.0 {
        return "-".to_string();
    }

    let number = format_decimal(value);
    match unit {
        "kg" => format!("{number} kg"),
        "carga" => format!("{quantity:.0} cgs"),
        "kg_pc" => format!("{number} kg | {quantity:.0} pç"),
        "vol_pc" => format!("{number} m³ | {quantity:.0} pç"),
        _ => number,
    }
}

#[derive(Debug, Clone)]
pub struct StatusFeeds {
    client: Client,
    live_url: String,
    weekly_url: String,
    live_timeout: Duration,
    weekly_timeout: Duration,
}

impl StatusFeeds {
    pub fn new(
        live_url: &str,
        weekly_url: &str,
        live_timeout: Duration,
        weekly_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            live_url: live_url.to_string(),
            weekly_url: weekly_url.to_string(),
            live_timeout,
            weekly_timeout,
        }
    }

    pub async fn live(&self) -> Result<Vec<SectorStatus>, FeedError> {
        self.fetch_list("live status feed", &self.live_url, self.live_timeout)
            .await
    }

    pub async fn weekly(&self) -> Result<Vec<SectorWeek>, FeedError> {
        self.fetch_list("weekly status feed", &self.weekly_url, self.weekly_timeout)
            .await
    }

    async fn fetch_list<T: DeserializeOwned>(
        &self,
        feed: &'static str,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<T>, FeedError> {
        let http = |source| FeedError::Http {
            url: url.to_string(),
            source,
        };
        let body: serde_json::Value = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(http)?
            .error_for_status()
            .map_err(http)?
            .json()
            .await
            .map_err(http)?;

        let records = parse_list(feed, body)?;
        debug!(feed, records = records.len(), "fetched status feed");
        Ok(records)
    }
}

pub fn parse_list<T: DeserializeOwned>(
    feed: &'static str,
    body: serde_json::Value,
) -> Result<Vec<T>, FeedError> {
    if !body.is_array() {
        return Err(FeedError::UnexpectedShape { feed });
    }
    serde_json::from_value(body).map_err(|source| FeedError::Decode { feed, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decimals_use_dot_thousands_and_comma_fraction() {
        assert_eq!(format_decimal(0.0), "0,0");
        assert_eq!(format_decimal(12.34), "12,3");
        assert_eq!(format_decimal(1234.56), "1.234,6");
        assert_eq!(format_decimal(1234567.0), "1.234.567,0");
        assert_eq!(format_decimal(-980.24), "-980,2");
    }

    #[test]
    fn measures_follow_unit_tags() {
        assert_eq!(format_measure(Some(0.0), Some(0.0), "kg"), "-");
        assert_eq!(format_measure(None, Some(3.0), "kg"), "-");
        assert_eq!(format_measure(Some(1500.0), None, "kg"), "1.500,0 kg");
        assert_eq!(format_measure(Some(0.0), Some(4.0), "carga"), "4 cgs");
        assert_eq!(format_measure(Some(820.5), Some(12.0), "kg_pc"), "820,5 kg | 12 pç");
        assert_eq!(format_measure(Some(14.24), Some(7.0), "vol_pc"), "14,2 m³ | 7 pç");
        assert_eq!(format_measure(Some(3.0), Some(0.0), ""), "3,0");
    }

    #[test]
    fn active_checkpoint_follows_the_clock() {
        assert_eq!(Checkpoint::for_hour(0), Checkpoint::Morning);
        assert_eq!(Checkpoint::for_hour(7), Checkpoint::Morning);
        assert_eq!(Checkpoint::for_hour(8), Checkpoint::Midday);
        assert_eq!(Checkpoint::for_hour(12), Checkpoint::Midday);
        assert_eq!(Checkpoint::for_hour(13), Checkpoint::Evening);
        assert_eq!(Checkpoint::for_hour(23), Checkpoint::Evening);
    }

    #[test]
    fn live_records_tolerate_missing_fields() {
        let body = json!([
            {
                "setor": "Forma",
                "unidade": "vol_pc",
                "progOntem": 10.0,
                "realOntem": 12.5,
                "qRealOntem": 4
            },
            {"setor": "Expedição", "unidade": "carga", "progOntem": 5, "realOntem": null}
        ]);
        let records: Vec<SectorStatus> = parse_list("live", body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].realized_yesterday_qty, Some(4.0));
        assert!(records[0].met_yesterday_goal());
        assert!(!records[1].met_yesterday_goal());
        assert_eq!(records[1].realized_8h, None);
    }

    #[test]
    fn non_list_body_is_rejected() {
        let error = parse_list::<SectorStatus>("live", json!({"error": "down"})).unwrap_err();
        assert!(matches!(error, FeedError::UnexpectedShape { .. }));
    }

    #[test]
    fn weekly_records_need_every_column() {
        let body = json!([{
            "inicio": "2025-06-02T00:00:00Z",
            "fim": "2025-06-08",
            "setor": "Montagem",
            "total_programado": 40.0,
            "total_realizado": 38.5
        }]);
        let records: Vec<SectorWeek> = parse_list("weekly", body).unwrap();
        assert_eq!(records[0].date_label(), "02/06 to 08/06");

        let missing = json!([{"inicio": "2025-06-02", "setor": "Montagem"}]);
        let error = parse_list::<SectorWeek>("weekly", missing).unwrap_err();
        assert!(matches!(error, FeedError::Decode { .. }));
    }
}
