//! Core metric table model, row types and normalization for seosync.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "seosync-core";

pub const DATE_COLUMN: &str = "date";
pub const URL_COLUMN: &str = "url";

/// Key used for every worksheet upsert.
pub const ROW_KEY_COLUMNS: [&str; 2] = [DATE_COLUMN, URL_COLUMN];

/// One spreadsheet cell. `Date` only appears before normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String form used for key equality and CSV output.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    fn rank(&self) -> u8 {
        match self {
            CellValue::Empty => 0,
            CellValue::Int(_) | CellValue::Float(_) => 1,
            CellValue::Date(_) => 2,
            CellValue::Text(_) => 3,
        }
    }

    /// Total order: empty < numbers < dates < text.
    pub fn compare(&self, other: &CellValue) -> Ordering {
        match (self, other) {
            (CellValue::Int(a), CellValue::Int(b)) => a.cmp(b),
            (CellValue::Date(a), CellValue::Date(b)) => a.cmp(b),
            (CellValue::Text(a), CellValue::Text(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Int(v) => write!(f, "{v}"),
            // integral floats keep a trailing `.0` so they stay distinct from ints
            CellValue::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        CellValue::Date(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

/// A typed record that knows its column layout.
pub trait MetricRow {
    const COLUMNS: &'static [&'static str];

    fn into_cells(self) -> Vec<CellValue>;
}

/// One page of search-analytics metrics for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMetricRow {
    pub date: NaiveDate,
    pub url: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: f64,
}

impl MetricRow for SearchMetricRow {
    const COLUMNS: &'static [&'static str] =
        &["date", "url", "clicks", "impressions", "ctr", "position"];

    fn into_cells(self) -> Vec<CellValue> {
        vec![
            self.date.into(),
            self.url.into(),
            self.clicks.into(),
            self.impressions.into(),
            self.ctr.into(),
            self.position.into(),
        ]
    }
}

/// One page of site-analytics metrics for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsMetricRow {
    pub date: NaiveDate,
    pub url: String,
    pub users: i64,
    pub sessions: i64,
    pub avg_session_duration: f64,
    pub bounce_rate: f64,
}

impl MetricRow for AnalyticsMetricRow {
    const COLUMNS: &'static [&'static str] = &[
        "date",
        "url",
        "users",
        "sessions",
        "avg_session_duration",
        "bounce_rate",
    ];

    fn into_cells(self) -> Vec<CellValue> {
        vec![
            self.date.into(),
            self.url.into(),
            self.users.into(),
            self.sessions.into(),
            self.avg_session_duration.into(),
            self.bounce_rate.into(),
        ]
    }
}

/// Ordered columns plus rows of cells. Every row has exactly one cell per column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricTable {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl MetricTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_columns(columns: &[&str]) -> Self {
        Self::new(columns.iter().map(|c| c.to_string()).collect())
    }

    /// Empty table carrying the schema of `R`.
    pub fn empty_for<R: MetricRow>() -> Self {
        Self::with_columns(R::COLUMNS)
    }

    pub fn from_rows<R: MetricRow>(rows: impl IntoIterator<Item = R>) -> Self {
        let mut table = Self::empty_for::<R>();
        for row in rows {
            table.push_row(row.into_cells());
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<CellValue>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Appends a row, padding with `Empty` or dropping trailing cells to fit the schema.
    pub fn push_row(&mut self, mut row: Vec<CellValue>) {
        row.resize(self.columns.len(), CellValue::Empty);
        self.rows.push(row);
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Finds the first row whose cells match `key` on `key_columns`.
    pub fn find_row(&self, key_columns: &[&str], key: &[&str]) -> Option<&[CellValue]> {
        let indices: Vec<usize> = key_columns
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Option<_>>()?;
        self.rows
            .iter()
            .find(|row| {
                indices
                    .iter()
                    .zip(key)
                    .all(|(idx, want)| row[*idx].canonical() == *want)
            })
            .map(Vec::as_slice)
    }

    pub fn header_row(&self) -> Vec<CellValue> {
        self.columns
            .iter()
            .map(|c| CellValue::Text(c.clone()))
            .collect()
    }
}

fn coerce_date_cell(cell: CellValue) -> CellValue {
    match cell {
        CellValue::Date(d) => CellValue::Text(d.format("%Y-%m-%d").to_string()),
        CellValue::Text(s) => match parse_date_text(&s) {
            Some(d) => CellValue::Text(d.format("%Y-%m-%d").to_string()),
            None => CellValue::Text(s),
        },
        other => other,
    }
}

fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.date())
}

/// Reshapes a table into `[date_column, url, ...rest]` with ISO dates and zero-filled gaps.
///
/// Empty tables are returned untouched. Applying this twice yields the same table.
pub fn normalize(table: MetricTable, date_column: &str) -> MetricTable {
    if table.is_empty() {
        return table;
    }

    let date_idx = table.column_index(date_column);
    let url_idx = table.column_index(URL_COLUMN);
    let mut order: Vec<usize> = date_idx.into_iter().chain(url_idx).collect();
    order.extend((0..table.columns.len()).filter(|i| Some(*i) != date_idx && Some(*i) != url_idx));

    let columns = order.iter().map(|i| table.columns[*i].clone()).collect();
    let rows = table
        .rows
        .into_iter()
        .map(|row| {
            let mut cells: Vec<Option<CellValue>> = row.into_iter().map(Some).collect();
            order
                .iter()
                .map(|i| {
                    let cell = cells[*i].take().unwrap_or_default();
                    let cell = if Some(*i) == date_idx {
                        coerce_date_cell(cell)
                    } else {
                        cell
                    };
                    if cell.is_empty() {
                        CellValue::Int(0)
                    } else {
                        cell
                    }
                })
                .collect()
        })
        .collect();

    MetricTable { columns, rows }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Success,
    /// Completed, but one source contributed no rows.
    Partial,
    Failure,
}

/// Per-run record handed to the notifier; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target_date: NaiveDate,
    pub search_rows: usize,
    pub analytics_rows: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, target_date: NaiveDate) -> Self {
        Self {
            run_id,
            target_date,
            search_rows: 0,
            analytics_rows: 0,
            success: false,
            error: None,
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        if !self.success {
            RunOutcome::Failure
        } else if self.search_rows == 0 || self.analytics_rows == 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        }
    }
}
