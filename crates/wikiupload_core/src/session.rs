use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::{Credentials, DEFAULT_CHUNK_SIZE, LoginFlow, UploadConfig};
use crate::error::{RemoteResult, UploadError};
use crate::resolve::ContentKind;
use crate::rewrite::page_url;

const DEFAULT_RATE_LIMIT_READ_MS: u64 = 300;
const ANONYMOUS_CSRF_TOKEN: &str = "+\\";

/// Error codes MediaWiki uses when the request arrived without a valid login.
const SESSION_ERROR_CODES: &[&str] = &[
    "assertuserfailed",
    "assertnameduserfailed",
    "assertbotfailed",
    "notloggedin",
    "badtoken",
];
const TRANSIENT_ERROR_CODES: &[&str] = &["ratelimited", "maxlag", "readonly"];

/// Raw wiki operations. One call is one attempt; retries belong to the caller.
pub trait WikiApi: Sync {
    fn login(&self, credentials: &Credentials) -> RemoteResult<()>;
    fn csrf_token(&self) -> RemoteResult<String>;
    fn edit_page(&self, title: &str, text: &str, summary: &str, token: &str) -> RemoteResult<()>;
    fn upload_file(
        &self,
        filename: &str,
        content: &[u8],
        mime_type: &str,
        comment: &str,
        token: &str,
    ) -> RemoteResult<()>;
    /// Send one piece of a file into the upload stash.
    fn upload_chunk(&self, chunk: &FileChunk<'_>, token: &str) -> RemoteResult<ChunkReceipt>;
    /// Publish a fully stashed file under its page name.
    fn commit_upload(&self, filename: &str, filekey: &str, comment: &str, token: &str) -> RemoteResult<()>;
    /// Stored content of a page, or `None` when it does not exist.
    fn fetch_raw(&self, title: &str, kind: ContentKind) -> RemoteResult<Option<Vec<u8>>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
pub struct FileChunk<'a> {
    pub filename: &'a str,
    pub filesize: usize,
    pub offset: usize,
    pub bytes: &'a [u8],
    /// Stash key returned for the first chunk; absent on the first request.
    pub filekey: Option<&'a str>,
    pub mime_type: &'a str,
    pub comment: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub filekey: String,
    /// Next offset the server expects.
    pub offset: Option<usize>,
    /// The server has assembled the whole file.
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub wiki_url: String,
    pub api_url: String,
    pub user_agent: String,
    pub login: LoginFlow,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &UploadConfig) -> Result<Self> {
        let endpoints = config.endpoints()?;
        Ok(Self {
            wiki_url: endpoints.url,
            api_url: endpoints.api_url,
            user_agent: config.user_agent(),
            login: config.login_flow(),
            timeout_ms: config.timeout_ms(),
            rate_limit_read_ms: DEFAULT_RATE_LIMIT_READ_MS,
            rate_limit_write_ms: config.rate_limit_write_ms(),
        })
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Mutex<Option<Instant>>,
    request_count: AtomicUsize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: Mutex::new(None),
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &MediaWikiClientConfig {
        &self.config
    }

    fn request_json_get(&self, params: &[(&str, String)]) -> RemoteResult<Value> {
        let base_url = Url::parse(&self.config.api_url).map_err(|error| {
            UploadError::Permanent(format!("invalid api_url {}: {error}", self.config.api_url))
        })?;
        self.apply_rate_limit(false);
        let response = self
            .client
            .get(base_url)
            .query(&api_pairs(params))
            .send()
            .map_err(classify_send_error)?;
        decode_api_response(response)
    }

    fn request_json_post(&self, params: &[(&str, String)]) -> RemoteResult<Value> {
        self.apply_rate_limit(true);
        let response = self
            .client
            .post(&self.config.api_url)
            .form(&api_pairs(params))
            .send()
            .map_err(classify_send_error)?;
        decode_api_response(response)
    }

    fn request_multipart(&self, form: Form) -> RemoteResult<Value> {
        self.apply_rate_limit(true);
        let response = self
            .client
            .post(&self.config.api_url)
            .multipart(form)
            .send()
            .map_err(classify_send_error)?;
        decode_api_response(response)
    }

    fn apply_rate_limit(&self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        // Held across the sleep so concurrent workers queue behind one another.
        let mut last = self
            .last_request_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        *last = Some(Instant::now());
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    fn login_with_api(&self, credentials: &Credentials) -> RemoteResult<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .map_err(|error| malformed("login token response", error))?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| UploadError::Auth("failed to get MediaWiki login token".to_string()))?;

        let login_response = self.request_json_post(&[
            ("action", "login".to_string()),
            ("lgname", credentials.username.clone()),
            ("lgpassword", credentials.password().to_string()),
            ("lgtoken", login_token),
        ])?;
        let login_payload: LoginResponse = serde_json::from_value(login_response)
            .map_err(|error| malformed("login response", error))?;
        match login_payload.login.result.as_deref() {
            Some("Success") => Ok(()),
            other => Err(UploadError::Auth(format!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }

    fn login_with_form(
        &self,
        credentials: &Credentials,
        url: &str,
        confirmed_suffix: &str,
    ) -> RemoteResult<()> {
        self.apply_rate_limit(true);
        let response = self
            .client
            .post(url)
            .form(&[
                ("return_to", ""),
                ("username", credentials.username.as_str()),
                ("password", credentials.password()),
                ("Login", "Login"),
            ])
            .send()
            .map_err(classify_send_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Auth(format!("login form returned HTTP {status}")));
        }
        let landed = response.url().path().trim_end_matches('/').to_string();
        if landed.ends_with(confirmed_suffix) {
            Ok(())
        } else {
            Err(UploadError::Auth(format!(
                "login was not confirmed (landed on {landed})"
            )))
        }
    }

    fn raw_url(&self, title: &str, kind: ContentKind) -> RemoteResult<Url> {
        let candidate = if kind.is_text() {
            page_url(&self.config.wiki_url, title)
        } else {
            page_url(&self.config.wiki_url, &format!("Special:FilePath/{title}"))
        };
        Url::parse(&candidate).map_err(|error| {
            UploadError::Permanent(format!("invalid page URL {candidate}: {error}"))
        })
    }
}

impl WikiApi for MediaWikiClient {
    fn login(&self, credentials: &Credentials) -> RemoteResult<()> {
        let result = match &self.config.login {
            LoginFlow::Api => self.login_with_api(credentials),
            LoginFlow::Form {
                url,
                confirmed_suffix,
            } => self.login_with_form(credentials, url, confirmed_suffix),
        };
        result.map_err(into_auth)
    }

    fn csrf_token(&self) -> RemoteResult<String> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse = serde_json::from_value(response)
            .map_err(|error| malformed("csrf token response", error))?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| UploadError::Permanent("failed to get MediaWiki csrf token".to_string()))?;
        if token == ANONYMOUS_CSRF_TOKEN {
            return Err(UploadError::SessionExpired(
                "wiki issued an anonymous edit token".to_string(),
            ));
        }
        Ok(token)
    }

    fn edit_page(&self, title: &str, text: &str, summary: &str, token: &str) -> RemoteResult<()> {
        let response = self.request_json_post(&[
            ("action", "edit".to_string()),
            ("title", title.to_string()),
            ("text", text.to_string()),
            ("summary", summary.to_string()),
            ("assert", "user".to_string()),
            ("bot", "1".to_string()),
            ("token", token.to_string()),
        ])?;
        let edit_payload: EditResponse =
            serde_json::from_value(response).map_err(|error| malformed("edit response", error))?;
        let edit = edit_payload
            .edit
            .ok_or_else(|| UploadError::Permanent("missing edit payload in API response".to_string()))?;
        if edit.result.as_deref() != Some("Success") {
            return Err(UploadError::Permanent(format!(
                "MediaWiki edit failed for {title}: {}",
                edit.result.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        trace!(page = title, "edit accepted");
        Ok(())
    }

    fn upload_file(
        &self,
        filename: &str,
        content: &[u8],
        mime_type: &str,
        comment: &str,
        token: &str,
    ) -> RemoteResult<()> {
        let part = Part::bytes(content.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|error| UploadError::Permanent(format!("invalid mime type {mime_type}: {error}")))?;
        let form = Form::new()
            .text("action", "upload")
            .text("format", "json")
            .text("formatversion", "2")
            .text("filename", filename.to_string())
            .text("comment", comment.to_string())
            .text("ignorewarnings", "1")
            .text("token", token.to_string())
            .part("file", part);
        let response = self.request_multipart(form)?;
        let payload: UploadResponse =
            serde_json::from_value(response).map_err(|error| malformed("upload response", error))?;
        let upload = payload
            .upload
            .ok_or_else(|| UploadError::Permanent("missing upload payload in API response".to_string()))?;
        if upload.result.as_deref() != Some("Success") {
            return Err(UploadError::Permanent(format!(
                "MediaWiki upload failed for {filename}: {}",
                upload.result.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        trace!(file = filename, "upload accepted");
        Ok(())
    }

    fn upload_chunk(&self, chunk: &FileChunk<'_>, token: &str) -> RemoteResult<ChunkReceipt> {
        let part = Part::bytes(chunk.bytes.to_vec())
            .file_name(chunk.filename.to_string())
            .mime_str(chunk.mime_type)
            .map_err(|error| {
                UploadError::Permanent(format!("invalid mime type {}: {error}", chunk.mime_type))
            })?;
        let mut form = Form::new()
            .text("action", "upload")
            .text("format", "json")
            .text("formatversion", "2")
            .text("filename", chunk.filename.to_string())
            .text("filesize", chunk.filesize.to_string())
            .text("offset", chunk.offset.to_string())
            .text("stash", "1")
            .text("comment", chunk.comment.to_string())
            .text("ignorewarnings", "1")
            .text("token", token.to_string());
        if let Some(filekey) = chunk.filekey {
            form = form.text("filekey", filekey.to_string());
        }
        let response = self.request_multipart(form.part("chunk", part))?;
        let payload: ChunkResponse =
            serde_json::from_value(response).map_err(|error| malformed("chunk response", error))?;
        let upload = payload
            .upload
            .ok_or_else(|| UploadError::Permanent("missing upload payload in chunk response".to_string()))?;
        let complete = match upload.result.as_deref() {
            Some("Success") => true,
            Some("Continue") => false,
            other => {
                return Err(UploadError::Permanent(format!(
                    "MediaWiki rejected chunk at offset {} of {}: {}",
                    chunk.offset,
                    chunk.filename,
                    other.unwrap_or("unknown")
                )));
            }
        };
        let filekey = upload
            .filekey
            .or_else(|| chunk.filekey.map(ToString::to_string))
            .ok_or_else(|| UploadError::Permanent("chunk response carried no filekey".to_string()))?;
        trace!(file = chunk.filename, offset = chunk.offset, complete, "chunk stashed");
        Ok(ChunkReceipt {
            filekey,
            offset: upload.offset,
            complete,
        })
    }

    fn commit_upload(&self, filename: &str, filekey: &str, comment: &str, token: &str) -> RemoteResult<()> {
        let response = self.request_json_post(&[
            ("action", "upload".to_string()),
            ("filename", filename.to_string()),
            ("filekey", filekey.to_string()),
            ("comment", comment.to_string()),
            ("ignorewarnings", "1".to_string()),
            ("token", token.to_string()),
        ])?;
        let payload: UploadResponse =
            serde_json::from_value(response).map_err(|error| malformed("upload response", error))?;
        let upload = payload
            .upload
            .ok_or_else(|| UploadError::Permanent("missing upload payload in API response".to_string()))?;
        if upload.result.as_deref() != Some("Success") {
            return Err(UploadError::Permanent(format!(
                "MediaWiki failed to publish stashed {filename}: {}",
                upload.result.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        trace!(file = filename, "stashed upload published");
        Ok(())
    }

    fn fetch_raw(&self, title: &str, kind: ContentKind) -> RemoteResult<Option<Vec<u8>>> {
        let url = self.raw_url(title, kind)?;
        self.apply_rate_limit(false);
        let mut request = self.client.get(url);
        if kind.is_text() {
            request = request.query(&[("action", "raw")]);
        }
        let response = request.send().map_err(classify_send_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if let Some(error) = classify_status(status) {
            return Err(error);
        }
        let bytes = response
            .bytes()
            .map_err(|error| UploadError::Transient(format!("failed to read page body: {error}")))?;
        Ok(Some(bytes.to_vec()))
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// Login state. Owned by [`SessionClient`]; the cookie jar lives in the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub authenticated: bool,
    csrf_token: Option<String>,
    generation: u64,
}

impl Session {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Authenticated access to the wiki, shareable between upload workers.
pub struct SessionClient<A> {
    api: A,
    credentials: Credentials,
    summary: String,
    session: Mutex<Session>,
    relogins: AtomicUsize,
    chunk_size: usize,
}

impl<A: WikiApi> SessionClient<A> {
    /// Log in and fetch an edit token. Any failure is an `Auth` error.
    pub fn login(api: A, credentials: Credentials, summary: impl Into<String>) -> RemoteResult<Self> {
        let client = Self {
            api,
            credentials,
            summary: summary.into(),
            session: Mutex::new(Session::default()),
            relogins: AtomicUsize::new(0),
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        {
            let mut session = client.lock_session();
            client.authenticate(&mut session)?;
        }
        Ok(client)
    }

    /// Binary files of at least `chunk_size` bytes are uploaded in stashed chunks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Write one page. An expired session triggers exactly one re-login and one retry.
    pub fn write_page(
        &self,
        remote_page_name: &str,
        content: &[u8],
        kind: ContentKind,
        content_type: &str,
    ) -> RemoteResult<()> {
        let (token, generation) = self.current_token()?;
        match self.send(remote_page_name, content, kind, content_type, &token) {
            Err(UploadError::SessionExpired(detail)) => {
                warn!(page = remote_page_name, error = %detail, "session expired, logging in again");
                let token = self.reauthenticate(generation)?;
                match self.send(remote_page_name, content, kind, content_type, &token) {
                    Err(UploadError::SessionExpired(detail)) => Err(UploadError::Permanent(format!(
                        "session expired again after re-login: {detail}"
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    pub fn read_page(&self, remote_page_name: &str, kind: ContentKind) -> RemoteResult<Option<Vec<u8>>> {
        self.api.fetch_raw(remote_page_name, kind)
    }

    pub fn session(&self) -> Session {
        self.lock_session().clone()
    }

    pub fn relogin_count(&self) -> usize {
        self.relogins.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> usize {
        self.api.request_count()
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn send(
        &self,
        remote_page_name: &str,
        content: &[u8],
        kind: ContentKind,
        content_type: &str,
        token: &str,
    ) -> RemoteResult<()> {
        if kind.is_text() {
            let text = String::from_utf8_lossy(content);
            self.api
                .edit_page(remote_page_name, &text, &self.summary, token)
        } else if content.len() >= self.chunk_size {
            self.upload_chunked(remote_page_name, content, content_type, token)
        } else {
            self.api
                .upload_file(remote_page_name, content, content_type, &self.summary, token)
        }
    }

    fn upload_chunked(
        &self,
        filename: &str,
        content: &[u8],
        content_type: &str,
        token: &str,
    ) -> RemoteResult<()> {
        let mut filekey: Option<String> = None;
        let mut offset = 0usize;
        let mut complete = false;
        while !complete && offset < content.len() {
            let end = offset.saturating_add(self.chunk_size).min(content.len());
            let receipt = self.api.upload_chunk(
                &FileChunk {
                    filename,
                    filesize: content.len(),
                    offset,
                    bytes: &content[offset..end],
                    filekey: filekey.as_deref(),
                    mime_type: content_type,
                    comment: &self.summary,
                },
                token,
            )?;
            complete = receipt.complete;
            offset = receipt.offset.filter(|next| *next > offset).unwrap_or(end);
            filekey = Some(receipt.filekey);
            debug!(file = filename, offset, size = content.len(), "chunk sent");
        }
        let (true, Some(filekey)) = (complete, filekey) else {
            return Err(UploadError::Permanent(format!(
                "chunked upload of {filename} ended before the wiki assembled it"
            )));
        };
        self.api.commit_upload(filename, &filekey, &self.summary, token)
    }

    fn current_token(&self) -> RemoteResult<(String, u64)> {
        let session = self.lock_session();
        match (&session.csrf_token, session.authenticated) {
            (Some(token), true) => Ok((token.clone(), session.generation)),
            _ => Err(UploadError::Auth("session is not authenticated".to_string())),
        }
    }

    /// Log in again unless another worker already did since `observed_generation`.
    fn reauthenticate(&self, observed_generation: u64) -> RemoteResult<String> {
        let mut session = self.lock_session();
        if session.generation == observed_generation || !session.authenticated {
            self.relogins.fetch_add(1, Ordering::Relaxed);
            self.authenticate(&mut session)?;
        } else {
            debug!(generation = session.generation, "session already refreshed");
        }
        session
            .csrf_token
            .clone()
            .ok_or_else(|| UploadError::Auth("no edit token after login".to_string()))
    }

    fn authenticate(&self, session: &mut Session) -> RemoteResult<()> {
        session.authenticated = false;
        session.csrf_token = None;
        self.api.login(&self.credentials).map_err(into_auth)?;
        let token = self.api.csrf_token().map_err(into_auth)?;
        session.csrf_token = Some(token);
        session.authenticated = true;
        session.generation += 1;
        info!(user = %self.credentials.username, "logged in to wiki");
        Ok(())
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn api_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        pairs.push(((*key).to_string(), value.clone()));
    }
    pairs
}

fn decode_api_response(response: Response) -> RemoteResult<Value> {
    let status = response.status();
    if let Some(error) = classify_status(status) {
        return Err(error);
    }
    let payload: Value = response
        .json()
        .map_err(|error| malformed("MediaWiki API JSON response", error))?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return Err(classify_api_error(code, info));
    }
    Ok(payload)
}

fn classify_status(status: StatusCode) -> Option<UploadError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("MediaWiki request failed with HTTP {status}");
    Some(if status == StatusCode::UNAUTHORIZED {
        UploadError::SessionExpired(detail)
    } else if is_retryable_status(status) {
        UploadError::Transient(detail)
    } else {
        UploadError::Permanent(detail)
    })
}

fn classify_api_error(code: &str, info: &str) -> UploadError {
    let detail = format!("MediaWiki API error [{code}]: {info}");
    if SESSION_ERROR_CODES.contains(&code) {
        UploadError::SessionExpired(detail)
    } else if TRANSIENT_ERROR_CODES.contains(&code) {
        UploadError::Transient(detail)
    } else {
        UploadError::Permanent(detail)
    }
}

fn classify_send_error(error: reqwest::Error) -> UploadError {
    if is_retryable_error(&error) {
        UploadError::Transient(format!("failed to call MediaWiki: {error}"))
    } else {
        UploadError::Permanent(format!("failed to call MediaWiki: {error}"))
    }
}

fn malformed(what: &str, error: impl std::fmt::Display) -> UploadError {
    UploadError::Permanent(format!("failed to decode {what}: {error}"))
}

fn into_auth(error: UploadError) -> UploadError {
    match error {
        UploadError::Auth(_) => error,
        other => UploadError::Auth(other.to_string()),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<ResultPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadResponse {
    upload: Option<ResultPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct ResultPayload {
    result: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkResponse {
    upload: Option<ChunkPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkPayload {
    result: Option<String>,
    filekey: Option<String>,
    offset: Option<usize>,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reqwest::StatusCode;

    use super::{ChunkReceipt, FileChunk, SessionClient, WikiApi, classify_api_error, classify_status};
    use crate::config::Credentials;
    use crate::error::{RemoteResult, UploadError};
    use crate::resolve::ContentKind;

    #[derive(Default)]
    struct MockApi {
        reject_login: bool,
        expire_next_writes: AtomicUsize,
        logins: AtomicUsize,
        edits: Mutex<Vec<(String, String, String)>>,
        uploads: Mutex<Vec<(String, String)>>,
        /// (offset, length, filekey sent) per stashed chunk.
        chunks: Mutex<Vec<(usize, usize, Option<String>)>>,
        commits: Mutex<Vec<(String, String, String)>>,
        pages: BTreeMap<String, Vec<u8>>,
    }

    impl MockApi {
        fn expiring(times: usize) -> Self {
            Self {
                expire_next_writes: AtomicUsize::new(times),
                ..Self::default()
            }
        }

        fn take_expiry(&self) -> bool {
            self.expire_next_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        }
    }

    impl WikiApi for MockApi {
        fn login(&self, _credentials: &Credentials) -> RemoteResult<()> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.reject_login {
                return Err(UploadError::Auth("WrongPass".to_string()));
            }
            Ok(())
        }

        fn csrf_token(&self) -> RemoteResult<String> {
            Ok(format!("token-{}", self.logins.load(Ordering::SeqCst)))
        }

        fn edit_page(&self, title: &str, text: &str, _summary: &str, token: &str) -> RemoteResult<()> {
            if self.take_expiry() {
                return Err(UploadError::SessionExpired("assertuserfailed".to_string()));
            }
            self.edits
                .lock()
                .expect("edits lock")
                .push((title.to_string(), text.to_string(), token.to_string()));
            Ok(())
        }

        fn upload_file(
            &self,
            filename: &str,
            _content: &[u8],
            mime_type: &str,
            _comment: &str,
            _token: &str,
        ) -> RemoteResult<()> {
            if self.take_expiry() {
                return Err(UploadError::SessionExpired("badtoken".to_string()));
            }
            self.uploads
                .lock()
                .expect("uploads lock")
                .push((filename.to_string(), mime_type.to_string()));
            Ok(())
        }

        fn upload_chunk(&self, chunk: &FileChunk<'_>, _token: &str) -> RemoteResult<ChunkReceipt> {
            if self.take_expiry() {
                return Err(UploadError::SessionExpired("badtoken".to_string()));
            }
            let mut chunks = self.chunks.lock().expect("chunks lock");
            chunks.push((
                chunk.offset,
                chunk.bytes.len(),
                chunk.filekey.map(ToString::to_string),
            ));
            let next = chunk.offset + chunk.bytes.len();
            Ok(ChunkReceipt {
                filekey: "stash-1".to_string(),
                offset: Some(next),
                complete: next == chunk.filesize,
            })
        }

        fn commit_upload(&self, filename: &str, filekey: &str, _comment: &str, token: &str) -> RemoteResult<()> {
            self.commits.lock().expect("commits lock").push((
                filename.to_string(),
                filekey.to_string(),
                token.to_string(),
            ));
            Ok(())
        }

        fn fetch_raw(&self, title: &str, _kind: ContentKind) -> RemoteResult<Option<Vec<u8>>> {
            Ok(self.pages.get(title).cloned())
        }

        fn request_count(&self) -> usize {
            0
        }
    }

    fn credentials() -> Credentials {
        Credentials::new("bot", "secret", Some("Amsterdam".to_string()))
    }

    #[test]
    fn login_authenticates_and_stores_token() {
        let client = SessionClient::login(MockApi::default(), credentials(), "sync").expect("login");
        let session = client.session();
        assert!(session.authenticated);
        assert_eq!(session.generation(), 1);
        assert_eq!(client.relogin_count(), 0);
    }

    #[test]
    fn rejected_credentials_are_auth_errors() {
        let api = MockApi {
            reject_login: true,
            ..MockApi::default()
        };
        let error = SessionClient::login(api, credentials(), "sync").err().expect("must fail");
        assert!(error.is_fatal());
    }

    #[test]
    fn text_targets_are_edited_and_resources_uploaded() {
        let client = SessionClient::login(MockApi::default(), credentials(), "sync").expect("login");
        client
            .write_page("Team:Amsterdam/style", b"body{}", ContentKind::Css, "text/css")
            .expect("edit");
        client
            .write_page("Team:Amsterdam/logo.png", &[0x89, 0x50], ContentKind::Image, "image/png")
            .expect("upload");

        let edits = client.api().edits.lock().expect("edits lock");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].0, "Team:Amsterdam/style");
        assert_eq!(edits[0].1, "body{}");
        let uploads = client.api().uploads.lock().expect("uploads lock");
        assert_eq!(
            uploads.as_slice(),
            &[("Team:Amsterdam/logo.png".to_string(), "image/png".to_string())]
        );
    }

    #[test]
    fn large_files_are_stashed_in_chunks_then_committed() {
        let client = SessionClient::login(MockApi::default(), credentials(), "sync")
            .expect("login")
            .with_chunk_size(4);
        let content = b"0123456789";
        client
            .write_page("Team:Amsterdam/video.mp4", content, ContentKind::Other, "video/mp4")
            .expect("chunked upload");

        let chunks = client.api().chunks.lock().expect("chunks lock");
        assert_eq!(
            chunks.as_slice(),
            &[
                (0, 4, None),
                (4, 4, Some("stash-1".to_string())),
                (8, 2, Some("stash-1".to_string())),
            ]
        );
        let commits = client.api().commits.lock().expect("commits lock");
        assert_eq!(
            commits.as_slice(),
            &[(
                "Team:Amsterdam/video.mp4".to_string(),
                "stash-1".to_string(),
                "token-1".to_string()
            )]
        );
        assert!(client.api().uploads.lock().expect("uploads lock").is_empty());
    }

    #[test]
    fn files_below_chunk_size_use_a_single_upload() {
        let client = SessionClient::login(MockApi::default(), credentials(), "sync")
            .expect("login")
            .with_chunk_size(4);
        client
            .write_page("Team:Amsterdam/a.png", b"abc", ContentKind::Image, "image/png")
            .expect("upload");
        assert!(client.api().chunks.lock().expect("chunks lock").is_empty());
        assert_eq!(client.api().uploads.lock().expect("uploads lock").len(), 1);
    }

    #[test]
    fn chunked_upload_restarts_after_session_expiry() {
        let client = SessionClient::login(MockApi::expiring(1), credentials(), "sync")
            .expect("login")
            .with_chunk_size(4);
        client
            .write_page("Team:Amsterdam/video.mp4", b"01234567", ContentKind::Other, "video/mp4")
            .expect("chunked upload after relogin");

        assert_eq!(client.relogin_count(), 1);
        let chunks = client.api().chunks.lock().expect("chunks lock");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (0, 4, None));
        let commits = client.api().commits.lock().expect("commits lock");
        assert_eq!(commits[0].2, "token-2");
    }

    #[test]
    fn expired_session_relogs_once_and_retries() {
        let client = SessionClient::login(MockApi::expiring(1), credentials(), "sync").expect("login");
        client
            .write_page("Team:Amsterdam/about", b"<p>hi</p>", ContentKind::Html, "text/html")
            .expect("write after relogin");

        assert_eq!(client.relogin_count(), 1);
        assert_eq!(client.api().logins.load(Ordering::SeqCst), 2);
        let edits = client.api().edits.lock().expect("edits lock");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].2, "token-2");
    }

    #[test]
    fn second_expiry_surfaces_write_error_without_another_relogin() {
        let client = SessionClient::login(MockApi::expiring(2), credentials(), "sync").expect("login");
        let error = client
            .write_page("Team:Amsterdam/about", b"<p>hi</p>", ContentKind::Html, "text/html")
            .expect_err("must fail");

        assert!(matches!(error, UploadError::Permanent(_)));
        assert_eq!(client.relogin_count(), 1);
    }

    #[test]
    fn read_page_reports_missing_pages_as_none() {
        let mut api = MockApi::default();
        api.pages
            .insert("Team:Amsterdam/style".to_string(), b"body{}".to_vec());
        let client = SessionClient::login(api, credentials(), "sync").expect("login");
        assert_eq!(
            client
                .read_page("Team:Amsterdam/style", ContentKind::Css)
                .expect("read"),
            Some(b"body{}".to_vec())
        );
        assert_eq!(
            client
                .read_page("Team:Amsterdam/missing", ContentKind::Css)
                .expect("read"),
            None
        );
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(UploadError::SessionExpired(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(UploadError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            Some(UploadError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            Some(UploadError::Permanent(_))
        ));
    }

    #[test]
    fn api_error_classification() {
        assert!(matches!(
            classify_api_error("assertuserfailed", "not logged in"),
            UploadError::SessionExpired(_)
        ));
        assert!(matches!(
            classify_api_error("ratelimited", "slow down"),
            UploadError::Transient(_)
        ));
        assert!(matches!(
            classify_api_error("protectedpage", "protected"),
            UploadError::Permanent(_)
        ));
    }
}
