use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use seosync_adapters::{
    AdapterError, AnalyticsConnector, AnalyticsReportApi, ReportRow, ReportValue, RunReportRequest,
    RunReportResponse, SearchAnalyticsApi, SearchAnalyticsQuery, SearchAnalyticsResponse,
    SearchAnalyticsRow, SearchConsoleConnector,
};
use seosync_core::{CellValue, MetricTable, RunOutcome, ROW_KEY_COLUMNS};
use seosync_pipeline::{
    NotificationSink, Notifier, NotifyError, Pipeline, PipelineConfig, ANALYTICS_WORKSHEET,
    SEARCH_WORKSHEET,
};
use seosync_storage::{MemorySheetStore, SheetStore, SheetWriter};
use tempfile::tempdir;

fn target() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
}

fn config() -> PipelineConfig {
    PipelineConfig::from_lookup(|key| match key {
        "SEO_MASTER_SPREADSHEET_ID" => Some("sheet-123".to_string()),
        "GSC_SITE_URL" => Some("https://site.com/".to_string()),
        "GA4_PROPERTY_ID" => Some("properties/987".to_string()),
        _ => None,
    })
    .unwrap()
}

#[derive(Default, Clone)]
struct Outbox(Arc<Mutex<Vec<String>>>);

impl Outbox {
    fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn notifier(&self) -> Notifier {
        Notifier::new(Some(Box::new(self.clone())), 3)
    }
}

#[async_trait]
impl NotificationSink for Outbox {
    fn name(&self) -> &'static str {
        "outbox"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

struct CannedSearch(Vec<(&'static str, f64)>);

#[async_trait]
impl SearchAnalyticsApi for CannedSearch {
    async fn query(
        &self,
        _site_url: &str,
        _query: &SearchAnalyticsQuery,
    ) -> Result<SearchAnalyticsResponse, AdapterError> {
        Ok(SearchAnalyticsResponse {
            rows: self
                .0
                .iter()
                .map(|(page, clicks)| SearchAnalyticsRow {
                    keys: vec![page.to_string()],
                    clicks: *clicks,
                    impressions: 100.0,
                    ctr: 0.05,
                    position: 4.2,
                })
                .collect(),
        })
    }
}

#[derive(Default)]
struct CannedAnalytics {
    rows: Vec<ReportRow>,
    requests: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl AnalyticsReportApi for CannedAnalytics {
    async fn run_report(
        &self,
        _property_id: &str,
        request: &RunReportRequest,
    ) -> Result<RunReportResponse, AdapterError> {
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::to_value(request).unwrap());
        Ok(RunReportResponse {
            rows: self.rows.clone(),
            ..Default::default()
        })
    }
}

fn report_row(page: &str, metrics: [&str; 4]) -> ReportRow {
    ReportRow {
        dimension_values: vec![ReportValue {
            value: Some(page.to_string()),
        }],
        metric_values: metrics
            .iter()
            .map(|m| ReportValue {
                value: Some(m.to_string()),
            })
            .collect(),
    }
}

struct BrokenSheets;

#[async_trait]
impl SheetStore for BrokenSheets {
    async fn worksheet_exists(&self, _title: &str) -> anyhow::Result<bool> {
        Err(anyhow!("sheets api returned 403"))
    }

    async fn create_worksheet(&self, _title: &str, _rows: usize, _cols: usize) -> anyhow::Result<()> {
        unreachable!()
    }

    async fn read_values(&self, _title: &str) -> anyhow::Result<Vec<Vec<CellValue>>> {
        unreachable!()
    }

    async fn clear(&self, _title: &str) -> anyhow::Result<()> {
        unreachable!()
    }

    async fn write_values(&self, _title: &str, _values: Vec<Vec<CellValue>>) -> anyhow::Result<()> {
        unreachable!()
    }
}

fn existing_search_sheet() -> MetricTable {
    let mut table =
        MetricTable::with_columns(&["date", "url", "clicks", "impressions", "ctr", "position"]);
    table.push_row(vec![
        "2024-01-10".into(),
        "/a".into(),
        CellValue::Int(3),
        CellValue::Int(50),
        CellValue::Float(0.06),
        CellValue::Float(5.0),
    ]);
    table.push_row(vec![
        "2024-01-09".into(),
        "/z".into(),
        CellValue::Int(1),
        CellValue::Int(9),
        CellValue::Float(0.1),
        CellValue::Float(20.0),
    ]);
    table
}

fn clicks(table: &MetricTable, date: &str, url: &str) -> Option<CellValue> {
    let idx = table.column_index("clicks")?;
    table
        .find_row(&ROW_KEY_COLUMNS, &[date, url])
        .map(|row| row[idx].clone())
}

#[tokio::test]
async fn new_search_rows_replace_existing_keys_and_stay_sorted() {
    let store = Arc::new(MemorySheetStore::new().with_table(SEARCH_WORKSHEET, &existing_search_sheet()));
    let outbox = Outbox::default();
    let pipeline = Pipeline::new(
        config(),
        Box::new(SearchConsoleConnector::new(
            Some(Arc::new(CannedSearch(vec![("/b", 5.0), ("/a", 10.0)]))),
            2500,
        )),
        Box::new(AnalyticsConnector::offline()),
        SheetWriter::new(Some(store.clone() as Arc<dyn SheetStore>)),
        outbox.notifier(),
    );

    let summary = pipeline.run_once(target()).await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.search_rows, 2);
    assert_eq!(summary.outcome(), RunOutcome::Success);

    let sheet = store.table(SEARCH_WORKSHEET).unwrap();
    assert_eq!(sheet.columns()[..2], ["date".to_string(), "url".to_string()]);
    assert_eq!(sheet.len(), 3);
    assert_eq!(clicks(&sheet, "2024-01-10", "/a"), Some(CellValue::Int(10)));
    assert_eq!(clicks(&sheet, "2024-01-10", "/b"), Some(CellValue::Int(5)));
    assert_eq!(clicks(&sheet, "2024-01-09", "/z"), Some(CellValue::Int(1)));

    let order: Vec<String> = sheet.rows().iter().map(|r| r[1].canonical()).collect();
    assert_eq!(order, ["/z", "/a", "/b"]);

    // offline analytics still lands in its own worksheet
    assert_eq!(store.table(ANALYTICS_WORKSHEET).unwrap().len(), 2);

    let messages = outbox.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("SEO Pipeline | OK\nTarget: 2024-01-10 (lookback=3)"));
}

#[tokio::test]
async fn analytics_paths_are_filtered_and_made_absolute() {
    let api = Arc::new(CannedAnalytics {
        rows: vec![report_row("blog/post-1", ["10", "12", "30.456", "0.51234"])],
        ..Default::default()
    });
    let store = Arc::new(MemorySheetStore::new());
    let mut cfg = config();
    cfg.ga4_base_url = "https://site.com".to_string();
    cfg.ga4_url_prefixes = vec!["/blog".to_string(), "/news".to_string()];

    let analytics = AnalyticsConnector::new(
        Some(api.clone() as Arc<dyn AnalyticsReportApi>),
        cfg.analytics_settings(),
    );
    let pipeline = Pipeline::new(
        cfg,
        Box::new(SearchConsoleConnector::offline()),
        Box::new(analytics),
        SheetWriter::new(Some(store.clone() as Arc<dyn SheetStore>)),
        Notifier::new(None, 3),
    );

    let summary = pipeline.run_once(target()).await.unwrap();
    assert_eq!(summary.analytics_rows, 1);

    let sheet = store.table(ANALYTICS_WORKSHEET).unwrap();
    let row = sheet
        .find_row(&ROW_KEY_COLUMNS, &["2024-01-10", "https://site.com/blog/post-1"])
        .unwrap();
    let duration = sheet.column_index("avg_session_duration").unwrap();
    assert_eq!(row[duration].as_f64(), Some(30.46));

    let requests = api.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let body = requests[0].to_string();
    assert!(body.contains("\"/blog\""));
    assert!(body.contains("\"/news\""));
    assert!(body.contains("BEGINS_WITH"));
}

#[tokio::test]
async fn missing_destination_exports_local_csv_backups() {
    let dir = tempdir().unwrap();
    let pipeline = Pipeline::new(
        config(),
        Box::new(SearchConsoleConnector::offline()),
        Box::new(AnalyticsConnector::offline()),
        SheetWriter::new(None).with_backup_dir(dir.path()),
        Notifier::new(None, 3),
    );

    let summary = pipeline.run_once(target()).await.unwrap();
    assert!(summary.success);

    let search_csv =
        std::fs::read_to_string(dir.path().join("pipeline_backup_gsc_data_daily.csv")).unwrap();
    let mut lines = search_csv.lines();
    assert_eq!(lines.next(), Some("date,url,clicks,impressions,ctr,position"));
    assert!(lines
        .next()
        .unwrap()
        .starts_with("2024-01-10,https://example.com/article-1,120,4500"));

    assert!(dir.path().join("pipeline_backup_ga4_data_daily.csv").exists());
}

#[tokio::test]
async fn empty_analytics_is_a_partial_success_with_notice() {
    let store = Arc::new(MemorySheetStore::new());
    let outbox = Outbox::default();
    let pipeline = Pipeline::new(
        config(),
        Box::new(SearchConsoleConnector::offline()),
        Box::new(AnalyticsConnector::new(
            Some(Arc::new(CannedAnalytics::default())),
            Default::default(),
        )),
        SheetWriter::new(Some(store.clone() as Arc<dyn SheetStore>)),
        outbox.notifier(),
    );

    let summary = pipeline.run_once(target()).await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.analytics_rows, 0);
    assert_eq!(summary.outcome(), RunOutcome::Partial);

    // empty tables never touch the sheet
    assert!(!store.worksheet_exists(ANALYTICS_WORKSHEET).await.unwrap());
    assert!(store.worksheet_exists(SEARCH_WORKSHEET).await.unwrap());

    let messages = outbox.messages();
    assert!(messages[0].contains("GA4 rows: 0"));
    assert!(messages[0].ends_with("Notice: GA4 returned no rows"));
}

#[tokio::test]
async fn destination_failure_is_reported_then_returned() {
    let outbox = Outbox::default();
    let pipeline = Pipeline::new(
        config(),
        Box::new(SearchConsoleConnector::offline()),
        Box::new(AnalyticsConnector::offline()),
        SheetWriter::new(Some(Arc::new(BrokenSheets))),
        outbox.notifier(),
    );

    let err = pipeline.run_once(target()).await.unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("gsc_data_daily"));
    assert!(message.contains("403"));

    let messages = outbox.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("SEO Pipeline | ERROR"));
    assert!(messages[0].contains("Error: updating worksheet gsc_data_daily"));
}
