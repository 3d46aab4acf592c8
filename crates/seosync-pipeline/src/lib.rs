//! Pipeline orchestration: configuration, target date, fetch → normalize → upsert → notify.

pub mod notify;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use seosync_adapters::{
    parse_url_prefixes, AnalyticsConnector, AnalyticsSettings, SearchConsoleConnector, SourceConnector,
    DEFAULT_ROW_LIMIT,
};
use seosync_core::{normalize, RunSummary, DATE_COLUMN, ROW_KEY_COLUMNS};
use seosync_storage::{
    GoogleSheetsStore, HttpClientConfig, HttpFetcher, ServiceCredentials, SheetStore, SheetWriter,
};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

pub use notify::{build_summary_text, NotificationSink, Notifier, NotifyError, TelegramConfig, TelegramSink};

pub const CRATE_NAME: &str = "seosync-pipeline";

pub const SEARCH_WORKSHEET: &str = "gsc_data_daily";
pub const ANALYTICS_WORKSHEET: &str = "ga4_data_daily";

pub const DEFAULT_TIMEZONE: &str = "America/Bogota";
pub const DEFAULT_LOOKBACK_DAYS: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SEO_MASTER_SPREADSHEET_ID is required to update the spreadsheet")]
    MissingSpreadsheetId,
    #[error("PIPELINE_TARGET_DATE={value} is not an ISO date (YYYY-MM-DD)")]
    InvalidTargetDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Everything a run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub spreadsheet_id: String,
    pub gsc_site_url: Option<String>,
    pub ga4_property_id: Option<String>,
    pub target_date_override: Option<NaiveDate>,
    pub timezone: String,
    pub lookback_days: u32,
    pub gsc_credentials_path: Option<PathBuf>,
    pub ga_credentials_path: Option<PathBuf>,
    pub sheets_credentials_path: Option<PathBuf>,
    pub gsc_row_limit: u32,
    pub ga4_row_limit: u32,
    pub ga4_base_url: String,
    pub ga4_url_prefixes: Vec<String>,
    pub telegram: Option<TelegramConfig>,
    pub backup_dir: PathBuf,
}

fn parse_row_limit(name: &str, raw: Option<String>) -> u32 {
    match raw {
        None => DEFAULT_ROW_LIMIT,
        Some(value) => match value.trim().parse::<u32>() {
            Ok(limit) if limit > 0 => limit,
            _ => {
                warn!(variable = name, value = %value, default = DEFAULT_ROW_LIMIT, "invalid row limit; using default");
                DEFAULT_ROW_LIMIT
            }
        },
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves configuration from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let spreadsheet_id = get("SEO_MASTER_SPREADSHEET_ID").ok_or(ConfigError::MissingSpreadsheetId)?;

        let target_date_override = get("PIPELINE_TARGET_DATE")
            .map(|value| {
                NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                    .map_err(|source| ConfigError::InvalidTargetDate { value, source })
            })
            .transpose()?;

        let lookback_days = match get("PIPELINE_LOOKBACK_DAYS") {
            None => DEFAULT_LOOKBACK_DAYS,
            Some(value) => value.trim().parse::<u32>().unwrap_or_else(|_| {
                warn!(value = %value, "invalid PIPELINE_LOOKBACK_DAYS; using 3 days of lookback");
                DEFAULT_LOOKBACK_DAYS
            }),
        };

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
            _ => None,
        };

        Ok(Self {
            spreadsheet_id,
            gsc_site_url: get("GSC_SITE_URL"),
            ga4_property_id: get("GA4_PROPERTY_ID"),
            target_date_override,
            timezone: get("PIPELINE_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            lookback_days,
            gsc_credentials_path: get("GSC_SERVICE_ACCOUNT_JSON").map(PathBuf::from),
            ga_credentials_path: get("GA_SERVICE_ACCOUNT_JSON").map(PathBuf::from),
            sheets_credentials_path: get("SHEETS_SERVICE_ACCOUNT_JSON").map(PathBuf::from),
            gsc_row_limit: parse_row_limit("GSC_ROW_LIMIT", get("GSC_ROW_LIMIT")),
            ga4_row_limit: parse_row_limit("GA4_ROW_LIMIT", get("GA4_ROW_LIMIT")),
            ga4_base_url: get("GA4_BASE_URL").unwrap_or_default(),
            ga4_url_prefixes: get("GA4_URL_PREFIX_FILTER")
                .map(|raw| parse_url_prefixes(&raw))
                .unwrap_or_default(),
            telegram,
            backup_dir: PathBuf::from("."),
        })
    }

    pub fn analytics_settings(&self) -> AnalyticsSettings {
        AnalyticsSettings {
            row_limit: self.ga4_row_limit,
            base_url: self.ga4_base_url.clone(),
            url_prefixes: self.ga4_url_prefixes.clone(),
        }
    }
}

/// Override date, else today in the configured timezone minus the lookback.
pub fn resolve_target_date(config: &PipelineConfig, now: DateTime<Utc>) -> NaiveDate {
    if let Some(date) = config.target_date_override {
        info!(target_date = %date, "using PIPELINE_TARGET_DATE override");
        return date;
    }

    let today = match config.timezone.parse::<Tz>() {
        Ok(tz) => now.with_timezone(&tz).date_naive(),
        Err(_) => {
            warn!(timezone = %config.timezone, "invalid timezone; using UTC");
            now.date_naive()
        }
    };
    let target = today
        .checked_sub_days(Days::new(u64::from(config.lookback_days)))
        .unwrap_or(NaiveDate::MIN);
    info!(
        target_date = %target,
        timezone = %config.timezone,
        lookback = config.lookback_days,
        "computed target date"
    );
    target
}

/// Maps `LOG_LEVEL` names (including `WARNING`/`CRITICAL`) to a tracing filter directive.
pub fn log_level_directive(raw: Option<&str>) -> String {
    let level = raw.map(|s| s.trim().to_ascii_lowercase()).unwrap_or_default();
    match level.as_str() {
        "" => "info".to_string(),
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "notset" => "trace".to_string(),
        _ => level,
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `log_level`.
pub fn init_logging(log_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level_directive(log_level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
    {
        debug!(error = %err, "global subscriber already installed; keeping it");
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    search: Box<dyn SourceConnector>,
    analytics: Box<dyn SourceConnector>,
    writer: SheetWriter,
    notifier: Notifier,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        search: Box<dyn SourceConnector>,
        analytics: Box<dyn SourceConnector>,
        writer: SheetWriter,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            search,
            analytics,
            writer,
            notifier,
        }
    }

    /// Wires the Google connectors, sheet destination and Telegram sink from config.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig::default())?;

        let search = SearchConsoleConnector::from_credentials(
            &http,
            ServiceCredentials::load_optional(config.gsc_credentials_path.as_deref(), "search console"),
            config.gsc_row_limit,
        )?;
        let analytics = AnalyticsConnector::from_credentials(
            &http,
            ServiceCredentials::load_optional(config.ga_credentials_path.as_deref(), "analytics"),
            config.analytics_settings(),
        )?;

        let destination = ServiceCredentials::load_optional(config.sheets_credentials_path.as_deref(), "sheets")
            .map(|creds| GoogleSheetsStore::new(http.clone(), config.spreadsheet_id.clone(), creds))
            .transpose()?
            .map(|store| Arc::new(store) as Arc<dyn SheetStore>);
        let writer = SheetWriter::new(destination).with_backup_dir(config.backup_dir.clone());

        let notifier = Notifier::telegram(&http, config.telegram.clone(), config.lookback_days);

        Ok(Self::new(
            config,
            Box::new(search),
            Box::new(analytics),
            writer,
            notifier,
        ))
    }

    /// Runs every step, then always notifies; the step error, if any, is returned afterwards.
    pub async fn run_once(&self, target_date: NaiveDate) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, %target_date);
        async move {
            let mut summary = RunSummary::new(run_id, target_date);
            let result = self.run_steps(target_date, &mut summary).await;

            match &result {
                Ok(()) => {
                    summary.success = true;
                    info!(
                        outcome = ?summary.outcome(),
                        search_rows = summary.search_rows,
                        analytics_rows = summary.analytics_rows,
                        "pipeline completed"
                    );
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "pipeline failed");
                    summary.error = Some(message);
                }
            }

            self.notifier.notify(&summary).await;
            result.map(|()| summary)
        }
        .instrument(span)
        .await
    }

    async fn run_steps(&self, target_date: NaiveDate, summary: &mut RunSummary) -> Result<()> {
        let search = normalize(
            self.search
                .fetch(target_date, self.config.gsc_site_url.as_deref())
                .await,
            DATE_COLUMN,
        );
        summary.search_rows = search.len();
        info!(source = self.search.source_id(), mode = ?self.search.mode(), rows = search.len(), "search rows fetched");

        let analytics = normalize(
            self.analytics
                .fetch(target_date, self.config.ga4_property_id.as_deref())
                .await,
            DATE_COLUMN,
        );
        summary.analytics_rows = analytics.len();
        info!(source = self.analytics.source_id(), mode = ?self.analytics.mode(), rows = analytics.len(), "analytics rows fetched");

        for (worksheet, table) in [(SEARCH_WORKSHEET, &search), (ANALYTICS_WORKSHEET, &analytics)] {
            if table.is_empty() {
                continue;
            }
            info!(worksheet, rows = table.len(), "updating worksheet");
            let outcome = self
                .writer
                .upsert(worksheet, table, &ROW_KEY_COLUMNS)
                .await
                .with_context(|| format!("updating worksheet {worksheet}"))?;
            info!(worksheet, outcome = ?outcome, "worksheet write finished");
        }

        Ok(())
    }
}

fn spreadsheet_hint(spreadsheet_id: &str) -> String {
    spreadsheet_id.chars().take(6).collect()
}

pub async fn run_pipeline_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let target_date = resolve_target_date(&config, Utc::now());
    info!(
        %target_date,
        spreadsheet = %spreadsheet_hint(&config.spreadsheet_id),
        "starting pipeline"
    );
    let pipeline = Pipeline::from_config(config)?;
    pipeline.run_once(target_date).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn config(pairs: &[(&str, &str)]) -> PipelineConfig {
        let mut all = vec![("SEO_MASTER_SPREADSHEET_ID", "sheet-abcdef123")];
        all.extend_from_slice(pairs);
        PipelineConfig::from_lookup(lookup(&all)).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn defaults_apply_when_only_spreadsheet_is_set() {
        let cfg = config(&[]);
        assert_eq!(cfg.timezone, DEFAULT_TIMEZONE);
        assert_eq!(cfg.lookback_days, 3);
        assert_eq!(cfg.gsc_row_limit, 2500);
        assert_eq!(cfg.ga4_row_limit, 2500);
        assert!(cfg.ga4_url_prefixes.is_empty());
        assert!(cfg.telegram.is_none());
        assert!(cfg.sheets_credentials_path.is_none());
    }

    #[test]
    fn missing_spreadsheet_id_is_fatal() {
        let err = PipelineConfig::from_lookup(lookup(&[("SEO_MASTER_SPREADSHEET_ID", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSpreadsheetId));
    }

    #[test]
    fn invalid_target_date_override_is_fatal() {
        let err = PipelineConfig::from_lookup(lookup(&[
            ("SEO_MASTER_SPREADSHEET_ID", "x"),
            ("PIPELINE_TARGET_DATE", "10/01/2024"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTargetDate { .. }));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let cfg = config(&[
            ("PIPELINE_LOOKBACK_DAYS", "-2"),
            ("GSC_ROW_LIMIT", "lots"),
            ("GA4_ROW_LIMIT", "0"),
        ]);
        assert_eq!(cfg.lookback_days, 3);
        assert_eq!(cfg.gsc_row_limit, DEFAULT_ROW_LIMIT);
        assert_eq!(cfg.ga4_row_limit, DEFAULT_ROW_LIMIT);
    }

    #[test]
    fn optional_values_are_parsed() {
        let cfg = config(&[
            ("PIPELINE_LOOKBACK_DAYS", "0"),
            ("GA4_URL_PREFIX_FILTER", "/blog|/news"),
            ("GA4_BASE_URL", "https://site.com"),
            ("GA4_ROW_LIMIT", "100"),
            ("TELEGRAM_BOT_TOKEN", "tok"),
            ("TELEGRAM_CHAT_ID", "42"),
        ]);
        assert_eq!(cfg.lookback_days, 0);
        assert_eq!(
            cfg.analytics_settings(),
            AnalyticsSettings {
                row_limit: 100,
                base_url: "https://site.com".into(),
                url_prefixes: vec!["/blog".into(), "/news".into()],
            }
        );
        assert_eq!(cfg.telegram.unwrap().chat_id, "42");
    }

    #[test]
    fn telegram_needs_both_token_and_chat() {
        assert!(config(&[("TELEGRAM_BOT_TOKEN", "tok")]).telegram.is_none());
    }

    #[test]
    fn target_date_uses_timezone_and_lookback() {
        let cfg = config(&[]);
        // 03:00 UTC is still the previous evening in Bogota.
        let date = resolve_target_date(&cfg, at(2024, 1, 13, 3));
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 9).unwrap());
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let cfg = config(&[("PIPELINE_TIMEZONE", "Mars/Olympus"), ("PIPELINE_LOOKBACK_DAYS", "1")]);
        let date = resolve_target_date(&cfg, at(2024, 1, 13, 3));
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 12).unwrap());
    }

    #[test]
    fn override_date_wins() {
        let cfg = config(&[("PIPELINE_TARGET_DATE", "2024-01-10")]);
        let date = resolve_target_date(&cfg, at(2030, 6, 1, 12));
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
    }

    #[test]
    fn log_levels_map_from_python_style_names() {
        assert_eq!(log_level_directive(None), "info");
        assert_eq!(log_level_directive(Some("WARNING")), "warn");
        assert_eq!(log_level_directive(Some("CRITICAL")), "error");
        assert_eq!(log_level_directive(Some("Debug")), "debug");
    }

    #[test]
    fn init_logging_tolerates_a_second_call() {
        init_logging(Some("debug"));
        init_logging(Some("WARNING"));
        assert!(tracing::dispatcher::has_been_set());
    }

    #[test]
    fn spreadsheet_hint_keeps_a_short_prefix() {
        assert_eq!(spreadsheet_hint("sheet-abcdef123"), "sheet-");
        assert_eq!(spreadsheet_hint("ab"), "ab");
    }
}
