use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::transport::{BatchReply, BatchRequest, ListPage, RemoteTransport};
use crate::types::ObjectRecord;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,parents,size,md5Checksum,mimeType,trashed";
const LIST_FIELDS: &str =
    "nextPageToken,files(id,name,parents,size,md5Checksum,mimeType,trashed)";

/// File resource as the Drive REST API returns it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    /// Decimal string; absent for folders and native documents.
    size: Option<String>,
    md5_checksum: Option<String>,
    mime_type: Option<String>,
    #[serde(default)]
    trashed: bool,
}

impl From<WireFile> for ObjectRecord {
    fn from(wire: WireFile) -> Self {
        let is_container = wire.mime_type.as_deref() == Some(FOLDER_MIME_TYPE);
        ObjectRecord {
            id: wire.id,
            name: wire.name,
            size: wire.size.and_then(|s| s.trim().parse().ok()),
            content_hash: wire.md5_checksum.filter(|h| !h.is_empty()),
            parents: wire.parents,
            is_container,
            trashed: wire.trashed,
            mime_type: wire.mime_type,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireList {
    #[serde(default)]
    files: Vec<WireFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
}

/// Blocking Drive v3 client.
pub struct DriveTransport {
    agent: ureq::Agent,
    api_base: String,
    /// Path part of `api_base`, used for requests nested in a batch body.
    api_path: String,
    batch_url: String,
    token: String,
    page_size: u32,
}

impl DriveTransport {
    pub fn new(config: &RemoteConfig, token: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build();

        let api_base = config.api_base.trim_end_matches('/').to_string();
        let api_path = url_path(&api_base);

        Self {
            agent,
            api_base,
            api_path,
            batch_url: config.batch_url.clone(),
            token,
            page_size: config.page_size.clamp(1, 1000),
        }
    }

    fn authorized(&self, req: ureq::Request) -> ureq::Request {
        req.set("Authorization", &format!("Bearer {}", self.token))
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, id)
    }
}

impl RemoteTransport for DriveTransport {
    fn list_page(&self, page_token: Option<&str>) -> Result<ListPage, RemoteError> {
        let mut req = self
            .authorized(self.agent.get(&format!("{}/files", self.api_base)))
            .query("q", "trashed=false")
            .query("pageSize", &self.page_size.to_string())
            .query("fields", LIST_FIELDS);
        if let Some(token) = page_token {
            req = req.query("pageToken", token);
        }

        let resp = req.call().map_err(|e| remote_error("list files", e))?;
        let list: WireList = resp
            .into_json()
            .map_err(|e| RemoteError::transient(format!("list files: bad response body: {e}")))?;

        debug!(files = list.files.len(), more = list.next_page_token.is_some(), "listed page");
        Ok(ListPage {
            objects: list.files.into_iter().map(ObjectRecord::from).collect(),
            next_token: list.next_page_token,
        })
    }

    fn get(&self, id: &str) -> Result<ObjectRecord, RemoteError> {
        let resp = self
            .authorized(self.agent.get(&self.file_url(id)))
            .query("fields", FILE_FIELDS)
            .call()
            .map_err(|e| remote_error(&format!("get {id}"), e))?;
        let file: WireFile = resp
            .into_json()
            .map_err(|e| RemoteError::transient(format!("get {id}: bad response body: {e}")))?;
        Ok(file.into())
    }

    fn batch(
        &self,
        requests: &[BatchRequest],
    ) -> Result<Vec<Result<BatchReply, RemoteError>>, RemoteError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let boundary = format!("dupemap_batch_{}", chrono::Utc::now().timestamp_micros());
        let body = build_batch_body(&self.api_path, &boundary, requests);

        let resp = self
            .authorized(self.agent.post(&self.batch_url))
            .set("Content-Type", &format!("multipart/mixed; boundary={boundary}"))
            .send_string(&body)
            .map_err(|e| remote_error("batch", e))?;

        let content_type = resp.header("Content-Type").unwrap_or_default().to_string();
        let text = resp
            .into_string()
            .map_err(|e| RemoteError::transient(format!("batch: failed to read response: {e}")))?;

        parse_batch_response(&content_type, &text, requests)
    }

    fn trash(&self, id: &str) -> Result<(), RemoteError> {
        self.authorized(self.agent.request("PATCH", &self.file_url(id)))
            .query("fields", "id,trashed")
            .send_json(serde_json::json!({ "trashed": true }))
            .map_err(|e| remote_error(&format!("trash {id}"), e))?;
        Ok(())
    }
}

fn remote_error(op: &str, err: ureq::Error) -> RemoteError {
    match err {
        ureq::Error::Status(code, resp) => {
            let detail = resp
                .into_string()
                .ok()
                .map(|body| error_message(&body))
                .unwrap_or_default();
            RemoteError::from_status(code, format!("{op}: HTTP {code} {detail}").trim_end().to_string())
        }
        ureq::Error::Transport(t) => RemoteError::transient(format!("{op}: {t}")),
    }
}

/// Message from a Drive JSON error body, or the raw body when it is not one.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<WireErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.trim().chars().take(200).collect(),
    }
}

fn url_path(url: &str) -> String {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match after_scheme.find('/') {
        Some(i) => after_scheme[i..].to_string(),
        None => String::new(),
    }
}

/// `multipart/mixed` body with one `application/http` part per request.
fn build_batch_body(api_path: &str, boundary: &str, requests: &[BatchRequest]) -> String {
    let mut body = String::new();
    for (n, request) in requests.iter().enumerate() {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Type: application/http\r\nContent-ID: <item-{}>\r\n\r\n",
            n + 1
        ));
        match request {
            BatchRequest::Metadata(id) => {
                body.push_str(&format!(
                    "GET {api_path}/files/{id}?fields={FILE_FIELDS} HTTP/1.1\r\n\r\n"
                ));
            }
            BatchRequest::Trash(id) => {
                body.push_str(&format!(
                    "PATCH {api_path}/files/{id}?fields=id,trashed HTTP/1.1\r\n\
                     Content-Type: application/json; charset=UTF-8\r\n\r\n\
                     {{\"trashed\":true}}\r\n"
                ));
            }
        }
    }
    body.push_str(&format!("--{boundary}--\r\n"));
    body
}

fn boundary_of(content_type: &str) -> Option<&str> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.eq_ignore_ascii_case("boundary")
            .then(|| value.trim_matches('"'))
    })
}

/// Splits a multipart batch response into per-request outcomes, matched by
/// `Content-ID: <response-item-N>`. Requests with no part get a transient
/// error.
fn parse_batch_response(
    content_type: &str,
    body: &str,
    requests: &[BatchRequest],
) -> Result<Vec<Result<BatchReply, RemoteError>>, RemoteError> {
    let boundary = boundary_of(content_type)
        .ok_or_else(|| RemoteError::transient(format!("batch: no boundary in '{content_type}'")))?;
    let body = body.replace("\r\n", "\n");
    let delimiter = format!("--{boundary}");

    let mut parts: HashMap<usize, (u16, String)> = HashMap::new();
    for part in body.split(delimiter.as_str()) {
        let part = part.trim_start_matches('\n');
        if part.is_empty() || part.starts_with("--") {
            continue;
        }
        let Some((headers, http)) = part.split_once("\n\n") else {
            continue;
        };
        let Some(index) = headers.lines().find_map(content_index) else {
            continue;
        };
        let (head, payload) = http.split_once("\n\n").unwrap_or((http, ""));
        let status = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        parts.insert(index, (status, payload.trim().to_string()));
    }

    let outcomes = requests
        .iter()
        .enumerate()
        .map(|(n, request)| match parts.remove(&(n + 1)) {
            Some((status, payload)) => item_outcome(request, status, &payload),
            None => Err(RemoteError::transient(format!(
                "batch: no response for {}",
                request.id()
            ))),
        })
        .collect();
    Ok(outcomes)
}

fn content_index(header: &str) -> Option<usize> {
    let (name, value) = header.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-id") {
        return None;
    }
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .strip_prefix("response-item-")?
        .parse()
        .ok()
}

fn item_outcome(request: &BatchRequest, status: u16, payload: &str) -> Result<BatchReply, RemoteError> {
    let id = request.id();
    if !(200..300).contains(&status) {
        let detail = error_message(payload);
        return Err(RemoteError::from_status(status, format!("{id}: HTTP {status} {detail}").trim_end().to_string()));
    }
    match request {
        BatchRequest::Metadata(_) => serde_json::from_str::<WireFile>(payload)
            .map(|f| BatchReply::Metadata(f.into()))
            .map_err(|e| RemoteError::transient(format!("{id}: bad response body: {e}"))),
        BatchRequest::Trash(_) => Ok(BatchReply::Trashed),
    }
}
