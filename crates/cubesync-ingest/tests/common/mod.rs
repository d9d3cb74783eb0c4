//! Shared fixtures for cube-sync integration tests
//!
//! [`FakeStore`] is an in-memory Dataverse: it applies upserts and deletes
//! from real `$batch` requests and answers with multipart bodies shaped like
//! the Web API's. Behaviour can be scripted per test (throttling, failing
//! keys, undeletable rows, failing page fetches).

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cubesync_ingest::dataverse::{BatchOperation, BatchRequest, BatchResponse, WebApi};
use cubesync_ingest::error::{IngestError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

mod cell_set;
pub use cell_set::cell_set_xml;

pub const API_BASE: &str = "https://org.crm.dynamics.com/api/data/v9.2";

pub const STORE: &str = "[Franchise].[Franchise Store]";
pub const DATE: &str = "[Calendar].[Calendar Date]";

#[derive(Debug, Clone)]
pub struct StoredRow {
    pub id: String,
    pub payload: Value,
}

#[derive(Default)]
pub struct FakeStore {
    /// table -> business key -> row
    tables: Mutex<BTreeMap<String, BTreeMap<String, StoredRow>>>,
    /// Whole-request status returned instead of processing, e.g. 429
    pub reject_with: Mutex<Option<u16>>,
    /// Business keys containing this text fail with 400
    pub failing_key: Mutex<Option<String>>,
    /// Deletes answer 403 and leave the row in place
    pub undeletable: Mutex<bool>,
    /// Page fetches that fail with the given status before succeeding
    pub failing_fetches: Mutex<Vec<u16>>,
    /// Ids handed out on the next page fetch that no longer exist, as if a
    /// concurrent purge removed them
    pub vanished_ids: Mutex<Vec<String>>,
    pub batch_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub forced_refreshes: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate `table` with `count` rows
    pub fn seed(&self, table: &str, count: usize) {
        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        for i in 0..count {
            rows.insert(
                format!("seed_{:05}", i),
                StoredRow {
                    id: Uuid::new_v4().to_string(),
                    payload: Value::Null,
                },
            );
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn row(&self, table: &str, key: &str) -> Option<StoredRow> {
        self.tables.lock().unwrap().get(table)?.get(key).cloned()
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn apply(&self, operation: &BatchOperation) -> (u16, String) {
        let mut tables = self.tables.lock().unwrap();
        match operation {
            BatchOperation::Upsert {
                table, key, payload, ..
            } => {
                let failing = self.failing_key.lock().unwrap().clone();
                if failing.is_some_and(|needle| key.contains(&needle)) {
                    return (
                        400,
                        r#"{"error":{"code":"0x80040203","message":"Invalid value"}}"#.to_string(),
                    );
                }

                let rows = tables.entry(table.clone()).or_default();
                let status = match rows.get_mut(key) {
                    Some(existing) => {
                        existing.payload = payload.clone();
                        200
                    },
                    None => {
                        rows.insert(
                            key.clone(),
                            StoredRow {
                                id: Uuid::new_v4().to_string(),
                                payload: payload.clone(),
                            },
                        );
                        201
                    },
                };
                let stamp = if status == 201 {
                    r#"{"createdon":"2025-11-06T05:00:00Z","modifiedon":"2025-11-06T05:00:00Z"}"#
                } else {
                    r#"{"createdon":"2025-10-01T05:00:00Z","modifiedon":"2025-11-06T05:00:00Z"}"#
                };
                (status, stamp.to_string())
            },
            BatchOperation::Delete { table, id } => {
                if *self.undeletable.lock().unwrap() {
                    return (
                        403,
                        r#"{"error":{"message":"Principal lacks delete privilege"}}"#.to_string(),
                    );
                }
                let Some(rows) = tables.get_mut(table) else {
                    return (404, String::new());
                };
                let key = rows
                    .iter()
                    .find(|(_, row)| &row.id == id)
                    .map(|(key, _)| key.clone());
                match key {
                    Some(key) => {
                        rows.remove(&key);
                        (204, String::new())
                    },
                    None => (404, String::new()),
                }
            },
        }
    }
}

/// Multipart `$batch` response body for the given `(status, json body)` parts
pub fn batch_response_body(parts: &[(u16, String)]) -> String {
    let boundary = "batchresponse_fake";
    let mut body = String::new();
    for (status, json) in parts {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!("HTTP/1.1 {} {}\r\n", status, reason(*status)));
        if json.is_empty() {
            body.push_str("\r\n\r\n");
        } else {
            body.push_str("Content-Type: application/json; odata.metadata=minimal\r\n\r\n");
            body.push_str(json);
            body.push_str("\r\n");
        }
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Status",
    }
}

#[async_trait]
impl WebApi for FakeStore {
    fn api_base(&self) -> &str {
        API_BASE
    }

    async fn send_batch(&self, batch: &BatchRequest) -> Result<BatchResponse> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.reject_with.lock().unwrap() {
            return Ok(BatchResponse::new(status, "rejected"));
        }
        self.batch_sizes.lock().unwrap().push(batch.len());

        let parts: Vec<(u16, String)> = batch.operations().iter().map(|op| self.apply(op)).collect();
        Ok(BatchResponse::new(200, batch_response_body(&parts)))
    }

    async fn fetch_ids(&self, table: &str, _id_field: &str, top: usize) -> Result<Vec<String>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = self.failing_fetches.lock().unwrap();
            if !failing.is_empty() {
                let status = failing.remove(0);
                return Err(IngestError::http(status, "fetch failed"));
            }
        }

        let mut ids: Vec<String> = std::mem::take(&mut *self.vanished_ids.lock().unwrap());
        ids.truncate(top);
        let live = self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| {
                rows.values()
                    .take(top - ids.len())
                    .map(|row| row.id.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        ids.extend(live);
        Ok(ids)
    }

    async fn refresh_auth(&self, force: bool) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if force {
            self.forced_refreshes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Two measures over three store-days, with the guest count of the second
/// row missing from the cell data.
pub fn store_daily_xml() -> String {
    cell_set_xml(
        &["TY Net Sales USD", "TY Guest Count"],
        &[
            vec![(STORE, "1042"), (DATE, "11/5/25")],
            vec![(STORE, "1043"), (DATE, "11/5/25")],
            vec![(STORE, "1044"), (DATE, "11/5/25")],
        ],
        &[(0, "1520.75"), (1, "212"), (2, "980"), (4, "1211.5"), (5, "167")],
    )
}

pub const STORE_DAILY_MAPPING: &str = r#"
table: crf63_oarsbidatas
alternate_key: crf63_businesskey
fields:
  StoreNumber:
    dataverse: crf63_storenumber
    type: string
  CalendarDate:
    dataverse: crf63_calendardate
    type: date
measures:
  TY Net Sales USD:
    dataverse: crf63_tynetsales
    type: decimal
  TY Guest Count:
    dataverse: crf63_tyguestcount
    type: int
business_key:
  format: "{StoreNumber}_{CalendarDate:%Y%m%d}"
"#;

/// Write a pipelines file plus its mapping into `dir`; returns the
/// pipelines file path.
pub fn write_pipeline_files(dir: &std::path::Path) -> std::path::PathBuf {
    std::fs::create_dir_all(dir.join("mappings")).unwrap();
    std::fs::write(dir.join("mappings/store_daily.yaml"), STORE_DAILY_MAPPING).unwrap();

    let pipelines = r#"
pipelines:
  store_daily:
    catalog: OARS BI
    mapping: mappings/store_daily.yaml
    hierarchy_mappings:
      - { pattern: "Franchise.*Store", field: StoreNumber }
      - { pattern: "Calendar.*Date", field: CalendarDate }
    variables:
      myview_id: 81
    mdx: |
      SELECT {[Measures].[TY Net Sales USD], [Measures].[TY Guest Count]} ON COLUMNS,
      NON EMPTY {[Franchise].[Franchise Store].Members * [Calendar].[Calendar Date].Members} ON ROWS
      FROM [OARS] WHERE ([My View].[${myview_id}])
"#;
    let path = dir.join("pipelines.yaml");
    std::fs::write(&path, pipelines).unwrap();
    path
}
