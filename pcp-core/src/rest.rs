//! Hosted store over a PostgREST-style HTTP API
//!
//! Tables are addressed as `{url}/{table}` with PostgREST filter syntax
//! (`column=eq.value`, `order=column.desc`, `limit=n`). The schema is picked
//! with the `Accept-Profile`/`Content-Profile` headers.
//!
//! The server caps every response at its `db-max-rows`, so listings are
//! read page by page with `offset`/`limit` and an exact count.
//!
//! The store traits are synchronous, so requests run on a private
//! current-thread tokio runtime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::*;
use crate::types::*;

const SESSIONS: &str = "sessions";
const PULSES: &str = "pulses";
const STOPPAGES: &str = "stoppages";
const PRODUCTS: &str = "products";
const MACHINES: &str = "machines";
const REASONS: &str = "stoppage_reasons";
const EXPORTS: &str = "exports";
const SYNC_STATE: &str = "sync_state";

const RETURN_ROWS: &str = "return=representation";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=representation";
const IGNORE_DUPLICATES: &str = "resolution=ignore-duplicates,return=representation";
const COUNT_EXACT: &str = "count=exact";

/// Rows requested per page. Matches PostgREST's usual `db-max-rows`.
const PAGE_SIZE: usize = 1000;

/// Postgres unique_violation
const UNIQUE_VIOLATION: &str = "23505";

type Params = Vec<(&'static str, String)>;

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}

/// Builds `{base}/{table}?k=v&...` with values percent-encoded.
fn table_url(base_url: &str, table: &str, params: &[(&'static str, String)]) -> String {
    let mut url = format!("{}/{}", base_url, table);
    for (i, (key, value)) in params.iter().enumerate() {
        url.push(if i == 0 { '?' } else { '&' });
        url.push_str(key);
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }
    url
}

fn session_params(filter: &SessionFilter) -> Params {
    let mut params = Params::new();
    if let Some(status) = filter.status {
        params.push(("status", eq(status.as_str())));
    }
    if let Some(ref machine_id) = filter.machine_id {
        params.push(("machine_id", eq(machine_id)));
    }
    if let Some(plate) = filter.plate {
        params.push(("plate", eq(plate)));
    }
    params.push(("order", "started_at.desc".to_string()));
    params
}

fn stoppage_params(filter: &StoppageFilter) -> Params {
    let mut params = Params::new();
    if let Some(ref session_id) = filter.session_id {
        params.push(("session_id", eq(session_id)));
    }
    if let Some(ref machine_id) = filter.machine_id {
        params.push(("machine_id", eq(machine_id)));
    }
    if filter.open_only {
        params.push(("ended_at", "is.null".to_string()));
    }
    if let Some(ref reason_code) = filter.reason_code {
        params.push(("reason_code", eq(reason_code)));
    }
    params.push(("order", "started_at.desc".to_string()));
    params
}

/// Total row count from a `Content-Range` header such as `0-999/1500`.
/// `None` when the server did not count (`0-9/*`).
fn content_range_total(header: &str) -> Option<usize> {
    header
        .rsplit_once('/')
        .and_then(|(_, total)| total.trim().parse().ok())
}

/// Reads pages from `fetch(offset, size)` until `limit` rows are collected,
/// the reported total is reached, or a page comes back empty.
///
/// A page may hold fewer rows than asked for when the server caps its
/// responses, so a short page alone does not end the listing.
fn collect_pages<T>(
    limit: Option<usize>,
    mut fetch: impl FnMut(usize, usize) -> Result<(Vec<T>, Option<usize>)>,
) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    loop {
        let want = match limit {
            Some(limit) => limit.saturating_sub(rows.len()).min(PAGE_SIZE),
            None => PAGE_SIZE,
        };
        if want == 0 {
            break;
        }

        let (page, total) = fetch(rows.len(), want)?;
        if page.is_empty() {
            break;
        }
        rows.extend(page);
        if total.is_some_and(|total| rows.len() >= total) {
            break;
        }
    }
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

/// Number of rows in a `return=representation` body.
fn returned_rows(body: &str) -> Result<usize> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(body)?;
    Ok(rows.len())
}

/// Error body returned by PostgREST
#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A successful response
struct Reply {
    body: String,
    content_range: Option<String>,
}

/// A request that did not produce a successful response
#[derive(Debug)]
struct HttpFailure {
    /// `None` when no response arrived (connect error, timeout)
    status: Option<StatusCode>,
    body: String,
}

impl HttpFailure {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            status: None,
            body: err.to_string(),
        }
    }

    fn postgrest(&self) -> Option<PostgrestError> {
        serde_json::from_str(&self.body).ok()
    }

    fn is_unique_violation(&self) -> bool {
        match self.postgrest().and_then(|e| e.code) {
            Some(code) => code == UNIQUE_VIOLATION,
            None => self.status == Some(StatusCode::CONFLICT),
        }
    }

    fn into_error(self) -> Error {
        let message = self
            .postgrest()
            .and_then(|e| e.message)
            .unwrap_or_else(|| self.body.clone());
        match self.status {
            None => Error::StoreUnavailable(message),
            Some(status)
                if status.is_server_error()
                    || status == StatusCode::REQUEST_TIMEOUT
                    || status == StatusCode::TOO_MANY_REQUESTS =>
            {
                Error::StoreUnavailable(format!("{}: {}", status, message))
            }
            Some(status) => Error::Store(format!("{}: {}", status, message)),
        }
    }
}

#[derive(Deserialize)]
struct CheckpointRow {
    last_legacy_id: i64,
}

#[derive(Deserialize)]
struct PieceRow {
    piece_count: i64,
}

/// Store backed by the hosted database.
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    runtime: tokio::runtime::Runtime,
}

impl RestStore {
    /// Create a store from configuration
    ///
    /// Fails if `url` or `api_key` is missing. No request is made here.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let base_url = config
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("store.url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("store.api_key is required".to_string()))?;

        let header = |value: &str, what: &str| {
            HeaderValue::from_str(value).map_err(|e| Error::Config(format!("invalid {}: {}", what, e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("apikey", header(api_key, "api_key")?);
        headers.insert(
            AUTHORIZATION,
            header(format!("Bearer {}", api_key).as_str(), "api_key")?,
        );
        headers.insert("Accept-Profile", header(config.schema.as_str(), "schema")?);
        headers.insert("Content-Profile", header(config.schema.as_str(), "schema")?);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            runtime,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
        prefer: Option<&str>,
    ) -> std::result::Result<Reply, HttpFailure> {
        tracing::debug!(method = %method, url = %url, "REST request");

        let mut request = self.client.request(method, &url);
        if let Some(prefer) = prefer {
            request = request.header("Prefer", prefer);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(HttpFailure::transport)?;
        let status = response.status();
        let content_range = response
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await.map_err(HttpFailure::transport)?;

        if status.is_success() {
            Ok(Reply {
                body: text,
                content_range,
            })
        } else {
            Err(HttpFailure {
                status: Some(status),
                body: text,
            })
        }
    }

    fn call(
        &self,
        method: Method,
        table: &str,
        params: &[(&'static str, String)],
        body: Option<serde_json::Value>,
        prefer: Option<&str>,
    ) -> std::result::Result<Reply, HttpFailure> {
        let url = table_url(&self.base_url, table, params);
        self.runtime.block_on(self.send(method, url, body, prefer))
    }

    fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        params: &[(&'static str, String)],
    ) -> Result<Vec<T>> {
        let reply = self
            .call(Method::GET, table, params, None, None)
            .map_err(HttpFailure::into_error)?;
        Ok(serde_json::from_str(&reply.body)?)
    }

    /// Every matching row up to `limit`, fetched one page at a time.
    fn select_paged<T: DeserializeOwned>(
        &self,
        table: &str,
        params: &[(&'static str, String)],
        limit: Option<usize>,
    ) -> Result<Vec<T>> {
        collect_pages(limit, |offset, size| {
            let mut page = params.to_vec();
            page.push(("offset", offset.to_string()));
            page.push(("limit", size.to_string()));
            let reply = self
                .call(Method::GET, table, &page, None, Some(COUNT_EXACT))
                .map_err(HttpFailure::into_error)?;
            let rows: Vec<T> = serde_json::from_str(&reply.body)?;
            let total = reply.content_range.as_deref().and_then(content_range_total);
            Ok((rows, total))
        })
    }

    fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        mut params: Params,
    ) -> Result<Option<T>> {
        params.push(("limit", "1".to_string()));
        Ok(self.select(table, &params)?.into_iter().next())
    }

    /// POSTs one row and returns the response body.
    fn insert_row(
        &self,
        table: &str,
        params: &[(&'static str, String)],
        row: serde_json::Value,
        prefer: &str,
    ) -> std::result::Result<String, HttpFailure> {
        let reply = self.call(Method::POST, table, params, Some(row), Some(prefer))?;
        Ok(reply.body)
    }

    /// PATCHes the matching rows and returns how many changed.
    fn update_rows(
        &self,
        table: &str,
        params: &[(&'static str, String)],
        changes: serde_json::Value,
    ) -> Result<usize> {
        let reply = self
            .call(Method::PATCH, table, params, Some(changes), Some(RETURN_ROWS))
            .map_err(HttpFailure::into_error)?;
        returned_rows(&reply.body)
    }
}

impl SessionStore for RestStore {
    fn get_session(&self, id: &str) -> Result<Option<ProductionSession>> {
        self.select_one(SESSIONS, vec![("id", eq(id))])
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ProductionSession>> {
        self.select_paged(SESSIONS, &session_params(filter), filter.limit)
    }

    fn insert_session(&self, session: &ProductionSession) -> Result<()> {
        match self.insert_row(SESSIONS, &[], serde_json::to_value(session)?, RETURN_ROWS) {
            Ok(_) => Ok(()),
            Err(f) if f.is_unique_violation() && session.is_in_progress() => {
                Err(Error::SessionAlreadyActive {
                    machine_id: session.machine_id.clone(),
                    plate: session.plate,
                })
            }
            Err(f) => Err(f.into_error()),
        }
    }

    fn update_session(&self, session: &ProductionSession) -> Result<()> {
        let changed = self.update_rows(
            SESSIONS,
            &[("id", eq(&session.id))],
            json!({
                "product_code": session.product_code,
                "operator_id": session.operator_id,
                "status": session.status,
                "ended_at": session.ended_at,
                "scrap_count": session.scrap_count,
            }),
        )?;
        if changed == 0 {
            return Err(Error::SessionNotFound(session.id.clone()));
        }
        Ok(())
    }
}

impl PulseStore for RestStore {
    fn latest_pulse(&self, session_id: &str) -> Result<Option<ProductionPulse>> {
        self.select_one(
            PULSES,
            vec![
                ("session_id", eq(session_id)),
                ("order", "cycle_at.desc".to_string()),
            ],
        )
    }

    fn insert_pulse(&self, pulse: &ProductionPulse) -> Result<bool> {
        let body = self
            .insert_row(
                PULSES,
                &[("on_conflict", "external_id".to_string())],
                serde_json::to_value(pulse)?,
                IGNORE_DUPLICATES,
            )
            .map_err(HttpFailure::into_error)?;
        Ok(returned_rows(&body)? > 0)
    }

    fn total_pieces(&self, session_id: &str) -> Result<i64> {
        let rows: Vec<PieceRow> = self.select_paged(
            PULSES,
            &[
                ("select", "piece_count".to_string()),
                ("session_id", eq(session_id)),
                ("order", "id.asc".to_string()),
            ],
            None,
        )?;
        Ok(rows.iter().map(|r| r.piece_count).sum())
    }
}

impl StoppageStore for RestStore {
    fn open_stoppage(&self, session_id: &str) -> Result<Option<MachineStoppage>> {
        self.select_one(
            STOPPAGES,
            vec![
                ("session_id", eq(session_id)),
                ("ended_at", "is.null".to_string()),
            ],
        )
    }

    fn get_stoppage(&self, id: &str) -> Result<Option<MachineStoppage>> {
        self.select_one(STOPPAGES, vec![("id", eq(id))])
    }

    fn list_stoppages(&self, filter: &StoppageFilter) -> Result<Vec<MachineStoppage>> {
        self.select_paged(STOPPAGES, &stoppage_params(filter), filter.limit)
    }

    fn insert_stoppage(&self, stoppage: &MachineStoppage) -> Result<()> {
        match self.insert_row(STOPPAGES, &[], serde_json::to_value(stoppage)?, RETURN_ROWS) {
            Ok(_) => Ok(()),
            Err(f) if f.is_unique_violation() && stoppage.is_open() => {
                Err(Error::StoppageAlreadyOpen(stoppage.session_id.clone()))
            }
            Err(f) => Err(f.into_error()),
        }
    }

    fn update_stoppage(&self, stoppage: &MachineStoppage) -> Result<()> {
        let changed = self.update_rows(
            STOPPAGES,
            &[("id", eq(&stoppage.id))],
            json!({
                "ended_at": stoppage.ended_at,
                "justified": stoppage.justified,
                "reason_code": stoppage.reason_code,
                "classification": stoppage.classification,
            }),
        )?;
        if changed == 0 {
            return Err(Error::StoppageNotFound(stoppage.id.clone()));
        }
        Ok(())
    }
}

impl ProductCatalog for RestStore {
    fn product(&self, code: &str) -> Result<Option<ProductReference>> {
        self.select_one(PRODUCTS, vec![("code", eq(code))])
    }

    fn upsert_product(&self, product: &ProductReference) -> Result<()> {
        self.insert_row(
            PRODUCTS,
            &[("on_conflict", "code".to_string())],
            serde_json::to_value(product)?,
            MERGE_DUPLICATES,
        )
        .map_err(HttpFailure::into_error)?;
        Ok(())
    }
}

impl MachineStore for RestStore {
    fn machine_by_number(&self, number: &str) -> Result<Option<Machine>> {
        self.select_one(MACHINES, vec![("number", eq(number))])
    }

    fn list_machines(&self) -> Result<Vec<Machine>> {
        self.select_paged(MACHINES, &[("order", "number.asc".to_string())], None)
    }

    fn upsert_machine(&self, machine: &Machine) -> Result<()> {
        self.insert_row(
            MACHINES,
            &[("on_conflict", "id".to_string())],
            serde_json::to_value(machine)?,
            MERGE_DUPLICATES,
        )
        .map_err(HttpFailure::into_error)?;
        Ok(())
    }
}

impl ReasonStore for RestStore {
    fn get_reason(&self, code: &str) -> Result<Option<StoppageReason>> {
        self.select_one(REASONS, vec![("code", eq(code))])
    }

    fn list_reasons(&self) -> Result<Vec<StoppageReason>> {
        self.select_paged(REASONS, &[("order", "code.asc".to_string())], None)
    }

    fn insert_reason(&self, reason: &StoppageReason) -> Result<()> {
        match self.insert_row(REASONS, &[], serde_json::to_value(reason)?, RETURN_ROWS) {
            Ok(_) => Ok(()),
            Err(f) if f.is_unique_violation() => Err(Error::InvalidInput(format!(
                "reason {} already exists",
                reason.code
            ))),
            Err(f) => Err(f.into_error()),
        }
    }

    fn update_reason(&self, reason: &StoppageReason) -> Result<()> {
        let changed = self.update_rows(
            REASONS,
            &[("code", eq(&reason.code))],
            json!({
                "description": reason.description,
                "active": reason.active,
            }),
        )?;
        if changed == 0 {
            return Err(Error::ReasonNotFound(reason.code.clone()));
        }
        Ok(())
    }

    fn delete_reason(&self, code: &str) -> Result<bool> {
        let reply = self
            .call(
                Method::DELETE,
                REASONS,
                &[("code", eq(code))],
                None,
                Some(RETURN_ROWS),
            )
            .map_err(HttpFailure::into_error)?;
        Ok(returned_rows(&reply.body)? > 0)
    }
}

impl ExportQueue for RestStore {
    fn enqueue_export(&self, record: &ExportRecord) -> Result<()> {
        match self.insert_row(EXPORTS, &[], serde_json::to_value(record)?, RETURN_ROWS) {
            Ok(_) => Ok(()),
            Err(f) if f.is_unique_violation() => {
                Err(Error::ExportAlreadyQueued(record.session_id.clone()))
            }
            Err(f) => Err(f.into_error()),
        }
    }

    fn export_for_session(&self, session_id: &str) -> Result<Option<ExportRecord>> {
        self.select_one(EXPORTS, vec![("session_id", eq(session_id))])
    }

    fn list_exports(&self, status: Option<ExportStatus>) -> Result<Vec<ExportRecord>> {
        let mut params = Params::new();
        if let Some(status) = status {
            params.push(("status", eq(status.as_str())));
        }
        params.push(("order", "created_at.asc".to_string()));
        self.select_paged(EXPORTS, &params, None)
    }
}

impl SyncStateStore for RestStore {
    fn last_legacy_id(&self) -> Result<i64> {
        let row: Option<CheckpointRow> = self.select_one(
            SYNC_STATE,
            vec![
                ("select", "last_legacy_id".to_string()),
                ("id", eq(1)),
            ],
        )?;
        Ok(row.map_or(0, |r| r.last_legacy_id))
    }

    fn set_last_legacy_id(&self, id: i64, synced_at: DateTime<Utc>) -> Result<()> {
        self.insert_row(
            SYNC_STATE,
            &[("on_conflict", "id".to_string())],
            json!({ "id": 1, "last_legacy_id": id, "synced_at": synced_at }),
            MERGE_DUPLICATES,
        )
        .map_err(HttpFailure::into_error)?;
        Ok(())
    }
}

impl Store for RestStore {
    fn backend_name(&self) -> &'static str {
        "rest"
    }
}
