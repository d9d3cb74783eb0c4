//! OData `$batch` request building and response accounting
//!
//! A batch is one `multipart/mixed` body with one HTTP-request-shaped part
//! per record. Parts are not wrapped in a changeset, so each one commits or
//! fails on its own.
//!
//! Responses come back as a multipart body of HTTP-response-shaped parts.
//! [`parse_batch_response`] reads those into [`SubResponse`]s and
//! [`BatchOutcome::reconcile`] turns them into created/updated/error counts
//! that always add up to the batch size.

use cubesync_common::types::Record;
use serde_json::Value;
use std::ops::AddAssign;
use uuid::Uuid;

use super::endpoints;
use crate::error::{snippet, Result};

const CRLF: &str = "\r\n";

/// One sub-operation of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Conditional create-or-update addressed by alternate key
    Upsert {
        table: String,
        alternate_key: String,
        key: String,
        payload: Value,
    },
    /// Unconditional delete by primary id
    Delete { table: String, id: String },
}

/// A rendered `$batch` request
#[derive(Debug, Clone)]
pub struct BatchRequest {
    boundary: String,
    operations: Vec<BatchOperation>,
    body: String,
}

impl BatchRequest {
    /// Build an upsert batch. Each part carries only the record's non-null
    /// columns.
    pub fn upsert(
        api_base: &str,
        table: &str,
        records: &[Record],
        return_representation: bool,
    ) -> Result<Self> {
        let operations = records
            .iter()
            .map(|record| BatchOperation::Upsert {
                table: table.to_string(),
                alternate_key: record.key_field.clone(),
                key: record.business_key.clone(),
                payload: record.payload(),
            })
            .collect();
        Self::render(api_base, operations, return_representation)
    }

    pub fn delete(api_base: &str, table: &str, ids: &[String]) -> Result<Self> {
        let operations = ids
            .iter()
            .map(|id| BatchOperation::Delete {
                table: table.to_string(),
                id: id.clone(),
            })
            .collect();
        Self::render(api_base, operations, false)
    }

    fn render(
        api_base: &str,
        operations: Vec<BatchOperation>,
        return_representation: bool,
    ) -> Result<Self> {
        let boundary = format!("batch_{}", Uuid::new_v4());
        let mut body = String::new();

        for (index, operation) in operations.iter().enumerate() {
            body.push_str(&format!("--{}{}", boundary, CRLF));
            body.push_str(&format!("Content-Type: application/http{}", CRLF));
            body.push_str(&format!("Content-Transfer-Encoding: binary{}", CRLF));
            body.push_str(&format!("Content-ID: {}{}", index + 1, CRLF));
            body.push_str(CRLF);

            match operation {
                BatchOperation::Upsert {
                    table,
                    alternate_key,
                    key,
                    payload,
                } => {
                    let url = endpoints::alternate_key_url(api_base, table, alternate_key, key);
                    body.push_str(&format!("PATCH {} HTTP/1.1{}", url, CRLF));
                    body.push_str(&format!("Content-Type: application/json{}", CRLF));
                    if return_representation {
                        body.push_str(&format!("Prefer: return=representation{}", CRLF));
                    }
                    body.push_str(CRLF);
                    body.push_str(&serde_json::to_string(payload)?);
                    body.push_str(CRLF);
                },
                BatchOperation::Delete { table, id } => {
                    let url = endpoints::record_url(api_base, table, id);
                    body.push_str(&format!("DELETE {} HTTP/1.1{}", url, CRLF));
                    body.push_str(&format!("Content-Length: 0{}", CRLF));
                    body.push_str(CRLF);
                },
            }
        }
        body.push_str(&format!("--{}--{}", boundary, CRLF));

        Ok(Self {
            boundary,
            operations,
            body,
        })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }

    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

// ============================================================================
// Response parsing
// ============================================================================

/// Outcome of one sub-operation as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubResponse {
    pub status: u16,
    pub created_on: Option<String>,
    pub modified_on: Option<String>,
    pub error_message: Option<String>,
}

impl SubResponse {
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    fn absorb_body(&mut self, body: &str) {
        let Ok(json) = serde_json::from_str::<Value>(body.trim()) else {
            if self.is_error() && !body.trim().is_empty() {
                self.error_message = Some(snippet(body.trim(), 300));
            }
            return;
        };
        self.created_on = json
            .get("createdon")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.modified_on = json
            .get("modifiedon")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.error_message = json
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
}

#[derive(PartialEq)]
enum PartState {
    Envelope,
    Headers,
    Body,
}

/// Read every HTTP response part out of a `$batch` response body.
///
/// Works on nested changeset responses too since only status lines and
/// boundary lines drive the state.
pub fn parse_batch_response(body: &str) -> Vec<SubResponse> {
    let mut responses = Vec::new();
    let mut current: Option<SubResponse> = None;
    let mut part_body = String::new();
    let mut state = PartState::Envelope;

    let mut finish = |current: &mut Option<SubResponse>, part_body: &mut String| {
        if let Some(mut response) = current.take() {
            response.absorb_body(part_body);
            responses.push(response);
        }
        part_body.clear();
    };

    for line in body.lines() {
        if line.starts_with("--") {
            finish(&mut current, &mut part_body);
            state = PartState::Envelope;
            continue;
        }

        if let Some(status) = parse_status_line(line) {
            finish(&mut current, &mut part_body);
            current = Some(SubResponse {
                status,
                ..SubResponse::default()
            });
            state = PartState::Headers;
            continue;
        }

        match state {
            PartState::Headers if line.trim().is_empty() => state = PartState::Body,
            PartState::Body => {
                part_body.push_str(line);
                part_body.push('\n');
            },
            _ => {},
        }
    }
    finish(&mut current, &mut part_body);

    responses
}

fn parse_status_line(line: &str) -> Option<u16> {
    let rest = line
        .strip_prefix("HTTP/1.1 ")
        .or_else(|| line.strip_prefix("HTTP/1.0 "))?;
    rest.split_whitespace().next()?.parse().ok()
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Created/updated/error tally for one or more batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
}

impl BatchOutcome {
    pub fn all_errors(batch_size: usize) -> Self {
        Self {
            errors: batch_size,
            ..Self::default()
        }
    }

    /// Count sub-operation outcomes for a batch of `batch_size` operations.
    ///
    /// `201` is a create, other 2xx an update, 4xx/5xx an error. When a
    /// `200` carries equal `createdon` and `modifiedon` it is counted as a
    /// create. Anything the response does not account for is counted as an
    /// update, so `created + updated + errors == batch_size` always holds.
    pub fn reconcile(batch_size: usize, responses: &[SubResponse]) -> Self {
        let mut outcome = Self::default();

        for response in responses.iter().take(batch_size) {
            match response.status {
                201 => outcome.created += 1,
                200 if response.created_on.is_some()
                    && response.created_on == response.modified_on =>
                {
                    outcome.created += 1
                },
                200..=299 => outcome.updated += 1,
                400..=599 => outcome.errors += 1,
                _ => {},
            }
        }

        outcome.updated += batch_size - outcome.total();
        outcome
    }

    /// Count delete sub-operation outcomes.
    ///
    /// A `404` means the row is already gone, which is what the delete
    /// wanted, so it counts alongside 2xx as a success. Successes land in
    /// `updated`; shortfall is a success as in [`BatchOutcome::reconcile`].
    pub fn reconcile_deletes(batch_size: usize, responses: &[SubResponse]) -> Self {
        let mut outcome = Self::default();

        for response in responses.iter().take(batch_size) {
            match response.status {
                200..=299 | 404 => outcome.updated += 1,
                400..=599 => outcome.errors += 1,
                _ => {},
            }
        }

        outcome.updated += batch_size - outcome.total();
        outcome
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.errors
    }

    pub fn succeeded(&self) -> usize {
        self.created + self.updated
    }
}

impl AddAssign for BatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.errors += other.errors;
    }
}
