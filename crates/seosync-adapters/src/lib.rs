//! Source connector contracts + search/analytics reporting API connectors.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Method, Url};
use seosync_core::{AnalyticsMetricRow, MetricRow, MetricTable, SearchMetricRow};
use seosync_storage::{
    CredentialsError, FetchError, HttpFetcher, ServiceCredentials, ANALYTICS_SCOPE, SEARCH_CONSOLE_SCOPE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "seosync-adapters";

pub const SEARCH_CONSOLE_API_BASE: &str = "https://searchconsole.googleapis.com/webmasters/v3/sites";
pub const ANALYTICS_DATA_API_BASE: &str = "https://analyticsdata.googleapis.com/v1beta";
pub const DEFAULT_ROW_LIMIT: u32 = 2500;

pub const SEARCH_SOURCE_ID: &str = "gsc";
pub const ANALYTICS_SOURCE_ID: &str = "ga4";

/// Page dimensions asked for in priority order; the first one yielding rows wins.
pub const PAGE_DIMENSIONS: [&str; 4] = [
    "pageLocation",
    "landingPagePlusQueryString",
    "pagePathPlusQueryString",
    "pagePath",
];

pub const ANALYTICS_METRICS: [&str; 4] = [
    "totalUsers",
    "sessions",
    "averageSessionDuration",
    "bounceRate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorMode {
    Live,
    /// No usable credentials; serves deterministic sample rows.
    Sample,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0} is required for live queries")]
    MissingIdentifier(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One day of metrics from one reporting API. Never fails: degraded paths yield
/// sample rows (offline) or an empty typed table (live call failed).
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn columns(&self) -> &'static [&'static str];
    fn mode(&self) -> ConnectorMode;

    async fn fetch(&self, target_date: NaiveDate, identifier: Option<&str>) -> MetricTable;
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

fn required_identifier<'a>(
    identifier: Option<&'a str>,
    what: &'static str,
) -> Result<&'a str, AdapterError> {
    identifier
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(AdapterError::MissingIdentifier(what))
}

fn api_url(base: &Url, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| anyhow!("api base {base} cannot carry a path"))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/* ---------------- Search analytics ---------------- */

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchAnalyticsQuery {
    pub start_date: String,
    pub end_date: String,
    pub dimensions: Vec<String>,
    pub row_limit: u32,
}

impl SearchAnalyticsQuery {
    pub fn for_day(target_date: NaiveDate, row_limit: u32) -> Self {
        let day = target_date.format("%Y-%m-%d").to_string();
        Self {
            start_date: day.clone(),
            end_date: day,
            dimensions: vec!["page".to_string()],
            row_limit,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchAnalyticsResponse {
    #[serde(default)]
    pub rows: Vec<SearchAnalyticsRow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchAnalyticsRow {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub clicks: f64,
    #[serde(default)]
    pub impressions: f64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub position: f64,
}

#[async_trait]
pub trait SearchAnalyticsApi: Send + Sync {
    async fn query(
        &self,
        site_url: &str,
        query: &SearchAnalyticsQuery,
    ) -> Result<SearchAnalyticsResponse, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct GoogleSearchConsoleApi {
    http: HttpFetcher,
    credentials: ServiceCredentials,
    api_base: Url,
}

impl GoogleSearchConsoleApi {
    pub fn new(http: HttpFetcher, credentials: ServiceCredentials) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            credentials,
            api_base: Url::parse(SEARCH_CONSOLE_API_BASE).context("parsing search console api base")?,
        })
    }
}

#[async_trait]
impl SearchAnalyticsApi for GoogleSearchConsoleApi {
    async fn query(
        &self,
        site_url: &str,
        query: &SearchAnalyticsQuery,
    ) -> Result<SearchAnalyticsResponse, AdapterError> {
        let url = api_url(&self.api_base, &[site_url, "searchAnalytics", "query"])?;
        let token = self
            .credentials
            .bearer_token(&self.http, &[SEARCH_CONSOLE_SCOPE])
            .await?;
        Ok(self.http.send_json(Method::POST, url, &token, query).await?)
    }
}

pub fn search_sample_table(target_date: NaiveDate) -> MetricTable {
    MetricTable::from_rows([
        SearchMetricRow {
            date: target_date,
            url: "https://example.com/article-1".to_string(),
            clicks: 120,
            impressions: 4500,
            ctr: 0.026,
            position: 8.4,
        },
        SearchMetricRow {
            date: target_date,
            url: "https://example.com/article-2".to_string(),
            clicks: 75,
            impressions: 5200,
            ctr: 0.014,
            position: 12.1,
        },
    ])
}

pub struct SearchConsoleConnector {
    api: Option<Arc<dyn SearchAnalyticsApi>>,
    row_limit: u32,
}

impl SearchConsoleConnector {
    pub fn new(api: Option<Arc<dyn SearchAnalyticsApi>>, row_limit: u32) -> Self {
        Self { api, row_limit }
    }

    pub fn offline() -> Self {
        Self::new(None, DEFAULT_ROW_LIMIT)
    }

    /// Live connector when credentials are present, sample-mode otherwise.
    pub fn from_credentials(
        http: &HttpFetcher,
        credentials: Option<ServiceCredentials>,
        row_limit: u32,
    ) -> anyhow::Result<Self> {
        let api = match credentials {
            Some(creds) => {
                Some(Arc::new(GoogleSearchConsoleApi::new(http.clone(), creds)?) as Arc<dyn SearchAnalyticsApi>)
            }
            None => None,
        };
        Ok(Self::new(api, row_limit))
    }

    async fn fetch_live(
        &self,
        api: &dyn SearchAnalyticsApi,
        target_date: NaiveDate,
        site_url: Option<&str>,
    ) -> Result<MetricTable, AdapterError> {
        let site_url = required_identifier(site_url, "search console site url")?;
        let query = SearchAnalyticsQuery::for_day(target_date, self.row_limit);
        let response = api.query(site_url, &query).await?;

        let rows: Vec<SearchMetricRow> = response
            .rows
            .into_iter()
            .map(|row| SearchMetricRow {
                date: target_date,
                url: row.keys.into_iter().next().unwrap_or_default(),
                clicks: row.clicks.round() as i64,
                impressions: row.impressions.round() as i64,
                ctr: row.ctr,
                position: row.position,
            })
            .collect();

        if rows.is_empty() {
            info!(%target_date, "search console returned no rows");
        } else {
            info!(%target_date, rows = rows.len(), "search console rows fetched");
        }
        Ok(MetricTable::from_rows(rows))
    }
}

#[async_trait]
impl SourceConnector for SearchConsoleConnector {
    fn source_id(&self) -> &'static str {
        SEARCH_SOURCE_ID
    }

    fn columns(&self) -> &'static [&'static str] {
        SearchMetricRow::COLUMNS
    }

    fn mode(&self) -> ConnectorMode {
        if self.api.is_some() {
            ConnectorMode::Live
        } else {
            ConnectorMode::Sample
        }
    }

    async fn fetch(&self, target_date: NaiveDate, site_url: Option<&str>) -> MetricTable {
        info!(%target_date, site_url_set = site_url.is_some(), "querying search console");
        let Some(api) = &self.api else {
            warn!("search console credentials unavailable; returning sample rows");
            return search_sample_table(target_date);
        };
        match self.fetch_live(api.as_ref(), target_date, site_url).await {
            Ok(table) => table,
            Err(err) => {
                error!(error = %error_chain(&err), %target_date, "search console query failed");
                MetricTable::empty_for::<SearchMetricRow>()
            }
        }
    }
}

/* ---------------- Site analytics ---------------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedField {
    pub name: String,
}

impl NamedField {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    BeginsWith,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StringFilter {
    pub value: String,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub field_name: String,
    pub string_filter: StringFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterExpressionList {
    pub expressions: Vec<FilterExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterExpression {
    OrGroup(FilterExpressionList),
    Filter(Filter),
}

/// OR of `BEGINS_WITH` filters on `field_name`; `None` when no prefixes are configured.
pub fn prefix_filter(field_name: &str, prefixes: &[String]) -> Option<FilterExpression> {
    if prefixes.is_empty() {
        return None;
    }
    Some(FilterExpression::OrGroup(FilterExpressionList {
        expressions: prefixes
            .iter()
            .map(|prefix| {
                FilterExpression::Filter(Filter {
                    field_name: field_name.to_string(),
                    string_filter: StringFilter {
                        value: prefix.clone(),
                        match_type: MatchType::BeginsWith,
                    },
                })
            })
            .collect(),
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportRequest {
    pub date_ranges: Vec<DateRange>,
    pub dimensions: Vec<NamedField>,
    pub metrics: Vec<NamedField>,
    pub limit: u32,
    pub keep_empty_rows: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension_filter: Option<FilterExpression>,
}

impl RunReportRequest {
    pub fn for_day(target_date: NaiveDate, dimension: &str, limit: u32, prefixes: &[String]) -> Self {
        let day = target_date.format("%Y-%m-%d").to_string();
        Self {
            date_ranges: vec![DateRange {
                start_date: day.clone(),
                end_date: day,
            }],
            dimensions: vec![NamedField::new(dimension)],
            metrics: ANALYTICS_METRICS.iter().map(|m| NamedField::new(m)).collect(),
            limit,
            keep_empty_rows: false,
            dimension_filter: prefix_filter(dimension, prefixes),
        }
    }

    pub fn dimension(&self) -> Option<&str> {
        self.dimensions.first().map(|d| d.name.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportResponse {
    #[serde(default)]
    pub rows: Vec<ReportRow>,
    #[serde(default)]
    pub row_count: Option<i64>,
    #[serde(default)]
    pub dimension_headers: Vec<NamedField>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    #[serde(default)]
    pub dimension_values: Vec<ReportValue>,
    #[serde(default)]
    pub metric_values: Vec<ReportValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportValue {
    #[serde(default)]
    pub value: Option<String>,
}

impl ReportRow {
    fn dimension(&self) -> &str {
        self.dimension_values
            .first()
            .and_then(|v| v.value.as_deref())
            .unwrap_or_default()
    }

    fn metric(&self, idx: usize) -> f64 {
        self.metric_values
            .get(idx)
            .and_then(|v| v.value.as_deref())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    }
}

#[async_trait]
pub trait AnalyticsReportApi: Send + Sync {
    async fn run_report(
        &self,
        property_id: &str,
        request: &RunReportRequest,
    ) -> Result<RunReportResponse, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct GoogleAnalyticsDataApi {
    http: HttpFetcher,
    credentials: ServiceCredentials,
    api_base: Url,
}

impl GoogleAnalyticsDataApi {
    pub fn new(http: HttpFetcher, credentials: ServiceCredentials) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            credentials,
            api_base: Url::parse(ANALYTICS_DATA_API_BASE).context("parsing analytics data api base")?,
        })
    }
}

/// Accepts either `properties/123` or a bare `123`.
pub fn property_number(property_id: &str) -> &str {
    property_id.trim().trim_start_matches("properties/")
}

#[async_trait]
impl AnalyticsReportApi for GoogleAnalyticsDataApi {
    async fn run_report(
        &self,
        property_id: &str,
        request: &RunReportRequest,
    ) -> Result<RunReportResponse, AdapterError> {
        let method = format!("{}:runReport", property_number(property_id));
        let url = api_url(&self.api_base, &["properties", &method])?;
        let token = self
            .credentials
            .bearer_token(&self.http, &[ANALYTICS_SCOPE])
            .await?;
        Ok(self.http.send_json(Method::POST, url, &token, request).await?)
    }
}

/// Absolute values pass through. Relative paths lose their leading `/` and are
/// joined onto `base_url` when one is configured.
pub fn resolve_page_url(raw: &str, base_url: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    let path = raw.trim_start_matches('/');
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Some(path.to_string());
    }
    Some(format!("{base}/{path}"))
}

pub fn report_rows_to_metrics(
    rows: &[ReportRow],
    target_date: NaiveDate,
    base_url: &str,
) -> Vec<AnalyticsMetricRow> {
    rows.iter()
        .filter_map(|row| {
            let url = resolve_page_url(row.dimension(), base_url)?;
            Some(AnalyticsMetricRow {
                date: target_date,
                url,
                users: row.metric(0).round() as i64,
                sessions: row.metric(1).round() as i64,
                avg_session_duration: round_to(row.metric(2), 2),
                bounce_rate: round_to(row.metric(3), 4),
            })
        })
        .collect()
}

pub fn analytics_sample_table(target_date: NaiveDate) -> MetricTable {
    MetricTable::from_rows([
        AnalyticsMetricRow {
            date: target_date,
            url: "/article-1".to_string(),
            users: 320,
            sessions: 410,
            avg_session_duration: 180.5,
            bounce_rate: 0.48,
        },
        AnalyticsMetricRow {
            date: target_date,
            url: "/article-2".to_string(),
            users: 145,
            sessions: 200,
            avg_session_duration: 220.0,
            bounce_rate: 0.35,
        },
    ])
}

/// Splits a `|`-separated prefix list, dropping blanks.
pub fn parse_url_prefixes(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsSettings {
    pub row_limit: u32,
    pub base_url: String,
    pub url_prefixes: Vec<String>,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            row_limit: DEFAULT_ROW_LIMIT,
            base_url: String::new(),
            url_prefixes: Vec::new(),
        }
    }
}

pub struct AnalyticsConnector {
    api: Option<Arc<dyn AnalyticsReportApi>>,
    settings: AnalyticsSettings,
}

impl AnalyticsConnector {
    pub fn new(api: Option<Arc<dyn AnalyticsReportApi>>, settings: AnalyticsSettings) -> Self {
        Self { api, settings }
    }

    pub fn offline() -> Self {
        Self::new(None, AnalyticsSettings::default())
    }

    pub fn from_credentials(
        http: &HttpFetcher,
        credentials: Option<ServiceCredentials>,
        settings: AnalyticsSettings,
    ) -> anyhow::Result<Self> {
        let api = match credentials {
            Some(creds) => {
                Some(Arc::new(GoogleAnalyticsDataApi::new(http.clone(), creds)?) as Arc<dyn AnalyticsReportApi>)
            }
            None => None,
        };
        Ok(Self::new(api, settings))
    }

    async fn fetch_live(
        &self,
        api: &dyn AnalyticsReportApi,
        target_date: NaiveDate,
        property_id: Option<&str>,
    ) -> Result<MetricTable, AdapterError> {
        let property_id = required_identifier(property_id, "analytics property id")?;
        if !self.settings.url_prefixes.is_empty() {
            info!(prefixes = ?self.settings.url_prefixes, "analytics url prefix filter enabled");
        }

        for dimension in PAGE_DIMENSIONS {
            info!(dimension, "requesting analytics report");
            let request = RunReportRequest::for_day(
                target_date,
                dimension,
                self.settings.row_limit,
                &self.settings.url_prefixes,
            );
            let response = api.run_report(property_id, &request).await?;
            info!(
                row_count = ?response.row_count,
                dimension_headers = ?response
                    .dimension_headers
                    .iter()
                    .map(|h| h.name.as_str())
                    .collect::<Vec<_>>(),
                "analytics report received"
            );

            let rows = report_rows_to_metrics(&response.rows, target_date, &self.settings.base_url);
            if !rows.is_empty() {
                info!(%target_date, dimension, rows = rows.len(), "analytics rows fetched");
                return Ok(MetricTable::from_rows(rows));
            }
            info!(%target_date, dimension, "no analytics rows for dimension");
        }

        info!(%target_date, "analytics returned no rows for any page dimension");
        Ok(MetricTable::empty_for::<AnalyticsMetricRow>())
    }
}

#[async_trait]
impl SourceConnector for AnalyticsConnector {
    fn source_id(&self) -> &'static str {
        ANALYTICS_SOURCE_ID
    }

    fn columns(&self) -> &'static [&'static str] {
        AnalyticsMetricRow::COLUMNS
    }

    fn mode(&self) -> ConnectorMode {
        if self.api.is_some() {
            ConnectorMode::Live
        } else {
            ConnectorMode::Sample
        }
    }

    async fn fetch(&self, target_date: NaiveDate, property_id: Option<&str>) -> MetricTable {
        info!(%target_date, property_set = property_id.is_some(), "querying analytics");
        let Some(api) = &self.api else {
            warn!("analytics credentials unavailable; returning sample rows");
            return analytics_sample_table(target_date);
        };
        match self.fetch_live(api.as_ref(), target_date, property_id).await {
            Ok(table) => table,
            Err(err) => {
                error!(error = %error_chain(&err), %target_date, "analytics report failed");
                MetricTable::empty_for::<AnalyticsMetricRow>()
            }
        }
    }
}
