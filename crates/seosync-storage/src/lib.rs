//! HTTP plumbing, credentials and the worksheet upsert writer for seosync.

mod auth;

pub use auth::{
    CredentialsError, CredentialsKind, ServiceCredentials, ANALYTICS_SCOPE, GOOGLE_TOKEN_URI,
    SEARCH_CONSOLE_SCOPE, SHEETS_SCOPE,
};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use seosync_core::{CellValue, MetricTable};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "seosync-storage";

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const BACKUP_FILE_PREFIX: &str = "pipeline_backup_";

const MIN_GRID_ROWS: usize = 100;
const MIN_GRID_COLS: usize = 20;
const ERROR_BODY_EXCERPT: usize = 300;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(concat!("seosync/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin JSON/form client shared by every outbound call.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        bearer: &str,
    ) -> Result<T, FetchError> {
        debug!(method = "GET", url = %url, "http request");
        let resp = self.client.get(url).bearer_auth(bearer).send().await?;
        read_json(resp).await
    }

    pub async fn send_json<B, T>(
        &self,
        method: Method,
        url: Url,
        bearer: &str,
        body: &B,
    ) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(method = %method, url = %url, "http request");
        let resp = self
            .client
            .request(method, url)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }

    /// Posts a URL-encoded form. The URL is stripped from transport errors since it may embed secrets.
    pub async fn post_form(
        &self,
        url: Url,
        form: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<StatusCode, FetchError> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.without_url()))?;
        Ok(resp.status())
    }

    /// Posts a URL-encoded form and decodes a JSON reply.
    pub async fn post_form_json<T: DeserializeOwned>(
        &self,
        url: Url,
        form: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        debug!(method = "POST", url = %url, "http form request");
        let resp = self.client.post(url).form(form).send().await?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, FetchError> {
    let status = resp.status();
    let url = resp.url().to_string();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url,
            body: body.chars().take(ERROR_BODY_EXCERPT).collect(),
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode { url, source })
}

/// Read-modify-write access to the tabs of one spreadsheet.
#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn worksheet_exists(&self, title: &str) -> anyhow::Result<bool>;

    async fn create_worksheet(&self, title: &str, rows: usize, cols: usize) -> anyhow::Result<()>;

    /// All populated rows including the header, top-left anchored.
    async fn read_values(&self, title: &str) -> anyhow::Result<Vec<Vec<CellValue>>>;

    async fn clear(&self, title: &str) -> anyhow::Result<()>;

    /// Overwrites cells starting at A1.
    async fn write_values(&self, title: &str, values: Vec<Vec<CellValue>>) -> anyhow::Result<()>;
}

/// Google Sheets v4 REST backend.
#[derive(Debug, Clone)]
pub struct GoogleSheetsStore {
    http: HttpFetcher,
    spreadsheet_id: String,
    credentials: ServiceCredentials,
    api_base: Url,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

impl GoogleSheetsStore {
    pub fn new(
        http: HttpFetcher,
        spreadsheet_id: impl Into<String>,
        credentials: ServiceCredentials,
    ) -> anyhow::Result<Self> {
        let api_base = Url::parse(SHEETS_API_BASE).context("parsing sheets api base url")?;
        Ok(Self {
            http,
            spreadsheet_id: spreadsheet_id.into(),
            credentials,
            api_base,
        })
    }

    pub fn with_api_base(mut self, api_base: Url) -> Self {
        self.api_base = api_base;
        self
    }

    fn url(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.api_base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow!("sheets api base {} cannot carry a path", self.api_base))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn token(&self) -> anyhow::Result<String> {
        self.credentials
            .bearer_token(&self.http, &[SHEETS_SCOPE])
            .await
            .context("obtaining sheets access token")
    }
}

/// Quotes a worksheet title for use as an A1 range.
pub fn a1_sheet_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

#[async_trait]
impl SheetStore for GoogleSheetsStore {
    async fn worksheet_exists(&self, title: &str) -> anyhow::Result<bool> {
        let mut url = self.url(&[&self.spreadsheet_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties.title");
        let meta: SpreadsheetMeta = self
            .http
            .get_json(url, &self.token().await?)
            .await
            .with_context(|| format!("reading metadata of spreadsheet {}", self.spreadsheet_id))?;
        Ok(meta.sheets.iter().any(|s| s.properties.title == title))
    }

    async fn create_worksheet(&self, title: &str, rows: usize, cols: usize) -> anyhow::Result<()> {
        let url = self.url(&[&format!("{}:batchUpdate", self.spreadsheet_id)])?;
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": title,
                        "gridProperties": { "rowCount": rows, "columnCount": cols }
                    }
                }
            }]
        });
        let _: JsonValue = self
            .http
            .send_json(Method::POST, url, &self.token().await?, &body)
            .await
            .with_context(|| format!("creating worksheet {title}"))?;
        Ok(())
    }

    async fn read_values(&self, title: &str) -> anyhow::Result<Vec<Vec<CellValue>>> {
        let mut url = self.url(&[&self.spreadsheet_id, "values", &a1_sheet_range(title)])?;
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE");
        let range: ValueRange = self
            .http
            .get_json(url, &self.token().await?)
            .await
            .with_context(|| format!("reading worksheet {title}"))?;
        Ok(range
            .values
            .iter()
            .map(|row| row.iter().map(json_to_cell).collect())
            .collect())
    }

    async fn clear(&self, title: &str) -> anyhow::Result<()> {
        let range = a1_sheet_range(title);
        let url = self.url(&[&self.spreadsheet_id, "values", &format!("{range}:clear")])?;
        let _: JsonValue = self
            .http
            .send_json(Method::POST, url, &self.token().await?, &json!({}))
            .await
            .with_context(|| format!("clearing worksheet {title}"))?;
        Ok(())
    }

    async fn write_values(&self, title: &str, values: Vec<Vec<CellValue>>) -> anyhow::Result<()> {
        let range = format!("{}!A1", a1_sheet_range(title));
        let mut url = self.url(&[&self.spreadsheet_id, "values", &range])?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": values
                .iter()
                .map(|row| row.iter().map(cell_to_json).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        });
        let _: JsonValue = self
            .http
            .send_json(Method::PUT, url, &self.token().await?, &body)
            .await
            .with_context(|| format!("writing worksheet {title}"))?;
        Ok(())
    }
}

pub fn json_to_cell(value: &JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Empty,
        JsonValue::Bool(b) => CellValue::Text(if *b { "TRUE" } else { "FALSE" }.to_string()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => n.as_f64().map(CellValue::Float).unwrap_or_default(),
        },
        JsonValue::String(s) if s.is_empty() => CellValue::Empty,
        JsonValue::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

pub fn cell_to_json(cell: &CellValue) -> JsonValue {
    match cell {
        CellValue::Empty => JsonValue::String(String::new()),
        CellValue::Int(i) => JsonValue::from(*i),
        CellValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(String::new())),
        CellValue::Date(_) | CellValue::Text(_) => JsonValue::String(cell.canonical()),
    }
}

/// In-process worksheet store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySheetStore {
    sheets: Mutex<BTreeMap<String, Vec<Vec<CellValue>>>>,
}

impl MemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worksheet(self, title: &str, values: Vec<Vec<CellValue>>) -> Self {
        self.lock().insert(title.to_string(), values);
        self
    }

    pub fn with_table(self, title: &str, table: &MetricTable) -> Self {
        self.with_worksheet(title, table_to_values(table))
    }

    pub fn values(&self, title: &str) -> Option<Vec<Vec<CellValue>>> {
        self.lock().get(title).cloned()
    }

    pub fn table(&self, title: &str) -> Option<MetricTable> {
        self.values(title).map(table_from_values)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<Vec<CellValue>>>> {
        self.sheets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SheetStore for MemorySheetStore {
    async fn worksheet_exists(&self, title: &str) -> anyhow::Result<bool> {
        Ok(self.lock().contains_key(title))
    }

    async fn create_worksheet(&self, title: &str, _rows: usize, _cols: usize) -> anyhow::Result<()> {
        let mut sheets = self.lock();
        if sheets.contains_key(title) {
            return Err(anyhow!("worksheet {title} already exists"));
        }
        sheets.insert(title.to_string(), Vec::new());
        Ok(())
    }

    async fn read_values(&self, title: &str) -> anyhow::Result<Vec<Vec<CellValue>>> {
        self.values(title)
            .ok_or_else(|| anyhow!("worksheet {title} not found"))
    }

    async fn clear(&self, title: &str) -> anyhow::Result<()> {
        let mut sheets = self.lock();
        let grid = sheets
            .get_mut(title)
            .ok_or_else(|| anyhow!("worksheet {title} not found"))?;
        grid.clear();
        Ok(())
    }

    async fn write_values(&self, title: &str, values: Vec<Vec<CellValue>>) -> anyhow::Result<()> {
        let mut sheets = self.lock();
        let grid = sheets
            .get_mut(title)
            .ok_or_else(|| anyhow!("worksheet {title} not found"))?;
        if grid.len() < values.len() {
            grid.resize(values.len(), Vec::new());
        }
        for (target, row) in grid.iter_mut().zip(values) {
            if target.len() < row.len() {
                target.resize(row.len(), CellValue::Empty);
            }
            for (slot, cell) in target.iter_mut().zip(row) {
                *slot = cell;
            }
        }
        Ok(())
    }
}

/// Header row followed by data rows.
pub fn table_to_values(table: &MetricTable) -> Vec<Vec<CellValue>> {
    std::iter::once(table.header_row())
        .chain(table.rows().iter().cloned())
        .collect()
}

/// Interprets the first row as the header; shorter rows are padded.
pub fn table_from_values(values: Vec<Vec<CellValue>>) -> MetricTable {
    let mut rows = values.into_iter();
    let Some(header) = rows.next() else {
        return MetricTable::default();
    };
    let mut table = MetricTable::new(header.iter().map(CellValue::canonical).collect());
    for row in rows {
        table.push_row(row);
    }
    table
}

/// Last-wins merge of `incoming` over `existing`, deduplicated and sorted by `key_columns`.
///
/// Columns are the existing header followed by any new ones. Cells a side does not
/// carry come out `Empty`.
pub fn merge_tables(existing: MetricTable, incoming: &MetricTable, key_columns: &[&str]) -> MetricTable {
    let mut columns = existing.columns().to_vec();
    for name in key_columns.iter().copied().chain(incoming.columns().iter().map(String::as_str)) {
        if !columns.iter().any(|c| c == name) {
            columns.push(name.to_string());
        }
    }

    let key_idx: Vec<usize> = key_columns
        .iter()
        .filter_map(|k| columns.iter().position(|c| c == k))
        .collect();

    let existing_map = column_mapping(&columns, existing.columns());
    let incoming_map = column_mapping(&columns, incoming.columns());

    let mut slots: HashMap<Vec<String>, usize> = HashMap::new();
    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    let aligned_existing = existing
        .into_rows()
        .into_iter()
        .map(|row| align_row(row, &existing_map));
    let aligned_incoming = incoming
        .rows()
        .iter()
        .map(|row| align_row(row.clone(), &incoming_map));

    for row in aligned_existing.chain(aligned_incoming) {
        let key: Vec<String> = key_idx.iter().map(|i| row[*i].canonical()).collect();
        match slots.get(&key) {
            Some(&pos) => rows[pos] = row,
            None => {
                slots.insert(key, rows.len());
                rows.push(row);
            }
        }
    }

    rows.sort_by(|a, b| {
        key_idx
            .iter()
            .map(|i| a[*i].compare(&b[*i]))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    });

    let mut merged = MetricTable::new(columns);
    for row in rows {
        merged.push_row(row);
    }
    merged
}

fn column_mapping(target: &[String], source: &[String]) -> Vec<Option<usize>> {
    target
        .iter()
        .map(|name| source.iter().position(|c| c == name))
        .collect()
}

fn align_row(row: Vec<CellValue>, mapping: &[Option<usize>]) -> Vec<CellValue> {
    let mut cells: Vec<Option<CellValue>> = row.into_iter().map(Some).collect();
    mapping
        .iter()
        .map(|idx| {
            idx.and_then(|i| cells.get_mut(i).and_then(Option::take))
                .unwrap_or_default()
        })
        .collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line(cells: impl IntoIterator<Item = String>) -> String {
    let mut line = cells
        .into_iter()
        .map(|c| csv_field(&c))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

pub fn table_to_csv(table: &MetricTable) -> String {
    let mut out = csv_line(table.columns().iter().cloned());
    for row in table.rows() {
        out.push_str(&csv_line(row.iter().map(CellValue::canonical)));
    }
    out
}

pub async fn export_local_csv(path: &Path, table: &MetricTable) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating backup directory {}", parent.display()))?;
    }
    fs::write(path, table_to_csv(table))
        .await
        .with_context(|| format!("writing backup csv {}", path.display()))?;
    info!(path = %path.display(), rows = table.len(), "exported local csv backup");
    Ok(path.to_path_buf())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Nothing to write; the worksheet was not touched.
    Skipped,
    ExportedCsv(PathBuf),
    Created { rows: usize },
    Merged { rows: usize },
}

/// Upserts tables into worksheets, or into local CSV files when no destination is configured.
pub struct SheetWriter {
    destination: Option<Arc<dyn SheetStore>>,
    backup_dir: PathBuf,
}

impl SheetWriter {
    pub fn new(destination: Option<Arc<dyn SheetStore>>) -> Self {
        Self {
            destination,
            backup_dir: PathBuf::from("."),
        }
    }

    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = backup_dir.into();
        self
    }

    pub fn backup_path(&self, worksheet: &str) -> PathBuf {
        self.backup_dir
            .join(format!("{BACKUP_FILE_PREFIX}{worksheet}.csv"))
    }

    pub async fn upsert(
        &self,
        worksheet: &str,
        table: &MetricTable,
        key_columns: &[&str],
    ) -> anyhow::Result<UpsertOutcome> {
        if table.is_empty() {
            info!(worksheet, "no rows to write; worksheet left untouched");
            return Ok(UpsertOutcome::Skipped);
        }

        let Some(store) = &self.destination else {
            warn!(worksheet, "spreadsheet destination unavailable; exporting local csv");
            let path = export_local_csv(&self.backup_path(worksheet), table).await?;
            return Ok(UpsertOutcome::ExportedCsv(path));
        };

        if !store.worksheet_exists(worksheet).await? {
            info!(worksheet, "worksheet does not exist; creating it");
            store
                .create_worksheet(
                    worksheet,
                    (table.len() + 1).max(MIN_GRID_ROWS),
                    table.columns().len().max(MIN_GRID_COLS),
                )
                .await?;
            store.write_values(worksheet, table_to_values(table)).await?;
            info!(worksheet, rows = table.len(), "worksheet created");
            return Ok(UpsertOutcome::Created { rows: table.len() });
        }

        let existing = table_from_values(store.read_values(worksheet).await?);
        let merged = if existing.is_empty() {
            table.clone()
        } else {
            merge_tables(existing, table, key_columns)
        };

        store.clear(worksheet).await?;
        store.write_values(worksheet, table_to_values(&merged)).await?;
        info!(worksheet, rows = merged.len(), "worksheet updated");
        Ok(UpsertOutcome::Merged { rows: merged.len() })
    }
}
