//! CouchDB HTTP implementation of [`ChunkStore`]

use super::{is_file_record, path_matches_prefix, ChunkPut, ChunkStore};
use crate::chunk_id::{ChunkId, CHUNK_ID_PREFIX};
use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::types::{doc_id_for_path, Document, LEAF_DOC_TYPE};
use reqwest::blocking::{Client, Response};
use reqwest::{header, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

/// Rows requested per `_all_docs` page
const PAGE_SIZE: usize = 1000;
/// Upper bound of a prefix range query
const RANGE_END: char = '\u{fff0}';
/// First key after the chunk id range
const AFTER_CHUNK_RANGE: &str = "h;";
/// Longest response body quoted in an error
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    #[serde(default)]
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    rev: String,
}

/// Blocking CouchDB client
///
/// Every request carries Basic credentials and the configured user agent.
/// Server errors and connection failures are retried according to the
/// [`RetryPolicy`]; everything else is returned to the caller at once.
pub struct CouchStore {
    http: Client,
    base_url: Url,
    config: StoreConfig,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CouchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchStore")
            .field("base_url", &self.base_url.as_str())
            .field("database", &self.config.database)
            .finish()
    }
}

impl CouchStore {
    /// Create a client for the configured server and database
    pub fn new(config: StoreConfig, retry: RetryPolicy) -> Result<Self> {
        let base_url = Url::parse(&config.uri)
            .map_err(|e| SyncError::InvalidConfiguration(format!("invalid COUCHDB_URI {}: {}", config.uri, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidConfiguration(format!(
                "COUCHDB_URI cannot be used as a base URL: {}",
                config.uri
            )));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SyncError::InvalidConfiguration(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            config,
            retry,
        })
    }

    /// Database name this client writes to
    pub fn database(&self) -> &str {
        &self.config.database
    }

    /// URL of `/{db}/{segments...}` with each segment percent-encoded
    fn db_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| SyncError::InvalidConfiguration(format!("unusable COUCHDB_URI {}", self.config.uri)))?;
            path.pop_if_empty();
            path.push(&self.config.database);
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// Send a request, retrying transient failures
    ///
    /// Returns the response for any status the caller has to interpret;
    /// 5xx/429 are retried and 401/403 end the run.
    fn send(&self, method: Method, url: &Url, body: Option<&Value>) -> Result<Response> {
        let what = format!("{} {}", method, url.path());
        self.retry.run(&what, || {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .basic_auth(&self.config.username, Some(&self.config.password))
                .header(header::ACCEPT, "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send()?;
            let status = response.status();
            trace!("{} -> {}", what, status);

            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(SyncError::transport(format!("{} returned {}", what, status)));
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(SyncError::Unauthorized {
                    status: status.as_u16(),
                    url: url.path().to_string(),
                });
            }
            Ok(response)
        })
    }

    /// Error for a status the caller did not expect
    fn unexpected(response: Response, url: &Url) -> SyncError {
        let status = response.status().as_u16();
        let mut body = response.text().unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        SyncError::Http {
            status,
            url: url.path().to_string(),
            body,
        }
    }

    /// Current revision of a record from its ETag, without the body
    fn head_revision(&self, url: &Url) -> Result<Option<String>> {
        let response = self.send(Method::HEAD, url, None)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(response
                .headers()
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string())),
            _ => Err(Self::unexpected(response, url)),
        }
    }

    /// All rows between two keys, following pages
    fn fetch_range(&self, start: Option<&str>, end: Option<&str>) -> Result<Vec<(String, Value)>> {
        let mut rows = Vec::new();
        let mut cursor = start.map(str::to_string);
        let mut skip_cursor = false;

        loop {
            let mut url = self.db_url(&["_all_docs"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("include_docs", "true");
                query.append_pair("limit", &PAGE_SIZE.to_string());
                if let Some(cursor) = &cursor {
                    query.append_pair("startkey", &serde_json::to_string(cursor)?);
                }
                if let Some(end) = end {
                    query.append_pair("endkey", &serde_json::to_string(end)?);
                }
                if skip_cursor {
                    query.append_pair("skip", "1");
                }
            }

            let response = self.send(Method::GET, &url, None)?;
            if !response.status().is_success() {
                return Err(Self::unexpected(response, &url));
            }
            let page: AllDocsResponse = response.json()?;
            let count = page.rows.len();
            debug!("_all_docs page from {:?}: {} rows", cursor, count);

            let mut last = None;
            for row in page.rows {
                last = Some(row.id.clone());
                if let Some(doc) = row.doc {
                    rows.push((row.id, doc));
                }
            }

            match last {
                Some(last) if count >= PAGE_SIZE => {
                    cursor = Some(last);
                    skip_cursor = true;
                }
                _ => break,
            }
        }

        Ok(rows)
    }
}

impl ChunkStore for CouchStore {
    fn get_doc(&self, path: &str) -> Result<Option<Document>> {
        let url = self.db_url(&[&doc_id_for_path(path)])?;
        let response = self.send(Method::GET, &url, None)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.text()?;
                serde_json::from_str(&body).map(Some).map_err(|e| SyncError::MalformedDocument {
                    path: path.to_string(),
                    message: e.to_string(),
                })
            }
            _ => Err(Self::unexpected(response, &url)),
        }
    }

    fn put_doc(&self, doc: &Document, expected_revision: Option<&str>) -> Result<String> {
        let url = self.db_url(&[&doc.id])?;
        let mut body = serde_json::to_value(doc)?;
        if let Value::Object(fields) = &mut body {
            match expected_revision {
                Some(rev) => {
                    fields.insert("_rev".to_string(), Value::String(rev.to_string()));
                }
                None => {
                    fields.remove("_rev");
                }
            }
        }

        let response = self.send(Method::PUT, &url, Some(&body))?;
        match response.status() {
            StatusCode::CONFLICT => Err(SyncError::conflict(doc.vault_path())),
            status if status.is_success() => {
                let written: WriteResponse = response.json()?;
                debug!("Wrote {} at {}", doc.id, written.rev);
                Ok(written.rev)
            }
            _ => Err(Self::unexpected(response, &url)),
        }
    }

    fn get_chunk(&self, id: &ChunkId) -> Result<Option<String>> {
        let url = self.db_url(&[id.as_str()])?;
        let response = self.send(Method::GET, &url, None)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let leaf: Value = response.json()?;
                let data = leaf.get("data").and_then(Value::as_str).map(str::to_string);
                if data.is_none() {
                    warn!("Chunk {} has no data field", id);
                }
                Ok(data)
            }
            _ => Err(Self::unexpected(response, &url)),
        }
    }

    fn put_chunk_if_absent(&self, id: &ChunkId, data: &str) -> Result<ChunkPut> {
        let url = self.db_url(&[id.as_str()])?;
        if self.head_revision(&url)?.is_some() {
            return Ok(ChunkPut::AlreadyPresent);
        }

        let body = json!({
            "_id": id.as_str(),
            "data": data,
            "type": LEAF_DOC_TYPE,
        });
        let response = self.send(Method::PUT, &url, Some(&body))?;
        match response.status() {
            // Another writer stored the same content first
            StatusCode::CONFLICT => Ok(ChunkPut::AlreadyPresent),
            status if status.is_success() => Ok(ChunkPut::Created),
            _ => Err(Self::unexpected(response, &url)),
        }
    }

    fn list_docs(&self, prefix: Option<&str>) -> Result<Vec<Document>> {
        let rows = match prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => {
                let start = doc_id_for_path(prefix.trim_start_matches('/'));
                let end = format!("{}{}", start, RANGE_END);
                self.fetch_range(Some(&start), Some(&end))?
            }
            None => {
                let mut rows = self.fetch_range(None, Some(CHUNK_ID_PREFIX))?;
                rows.extend(self.fetch_range(Some(AFTER_CHUNK_RANGE), None)?);
                rows
            }
        };

        let mut docs = Vec::with_capacity(rows.len());
        for (id, value) in rows {
            if !is_file_record(&id, &value) {
                continue;
            }
            let doc = match Document::deserialize(&value) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Document {} does not decode: {}", id, e);
                    Document::unreadable(&id, &value, e.to_string())
                }
            };
            if path_matches_prefix(&doc, prefix) {
                docs.push(doc);
            }
        }
        debug!("Listed {} documents under {:?}", docs.len(), prefix);
        Ok(docs)
    }

    fn delete_chunk(&self, id: &ChunkId) -> Result<bool> {
        let url = self.db_url(&[id.as_str()])?;
        let Some(rev) = self.head_revision(&url)? else {
            return Ok(false);
        };

        let mut delete_url = url.clone();
        delete_url.query_pairs_mut().append_pair("rev", &rev);
        let response = self.send(Method::DELETE, &delete_url, None)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::CONFLICT => Err(SyncError::conflict(id.as_str())),
            status if status.is_success() => Ok(true),
            _ => Err(Self::unexpected(response, &url)),
        }
    }
}
