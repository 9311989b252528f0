//! REST client for the hosted document database.
//!
//! One-shot queries go to the `:runQuery` endpoint. Change feeds are served
//! by re-running the query on a jittered interval and publishing a snapshot
//! whenever the result set differs from the last one delivered.

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;

use harvestdesk_core::config::{SyncConfig, DEFAULT_INCLUSION_LIMIT};
use harvestdesk_core::store::{CollectionPath, Document, DocumentStore, Query, Subscription};

use crate::encoding::{decode_run_query_response, structured_query};
use crate::error::{DocumentStoreError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const QUERY_MAX_ATTEMPTS: usize = 3;
const QUERY_BASE_BACKOFF_MS: u64 = 200;
const QUERY_MAX_BACKOFF_MS: u64 = 4_000;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

fn backoff_with_jitter(attempt: usize) -> Duration {
    let exp = (attempt.saturating_sub(1) as u32).min(8);
    let backoff = (QUERY_BASE_BACKOFF_MS.saturating_mul(1_u64 << exp)).min(QUERY_MAX_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..=(backoff / 5).max(1));
    Duration::from_millis(backoff.saturating_add(jitter))
}

/// Poll delay spread by up to a fifth of the interval so many feeds opened
/// together do not hit the backend in lockstep.
fn poll_delay_with_jitter(interval: Duration) -> Duration {
    let base = interval.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=(base / 5).max(1));
    Duration::from_millis(base.saturating_add(jitter))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

/// Error payloads arrive either bare or wrapped in a one-element array.
fn parse_api_error(status: u16, body: &str) -> DocumentStoreError {
    let envelope = serde_json::from_str::<ApiErrorEnvelope>(body).ok().or_else(|| {
        serde_json::from_str::<Vec<ApiErrorEnvelope>>(body)
            .ok()
            .and_then(|mut items| items.pop())
    });
    match envelope {
        Some(ApiErrorEnvelope { error }) => DocumentStoreError::api(
            status,
            match error.status {
                Some(code) => format!("{}: {}", code, error.message),
                None => error.message,
            },
        ),
        None => DocumentStoreError::api(status, format!("Request failed: {}", body)),
    }
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// e.g. `https://firestore.googleapis.com/v1`
    pub base_url: String,
    pub project_id: String,
    pub database_id: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Largest inclusion set the backend accepts in one filter.
    pub inclusion_limit: usize,
    /// Fields stored as timestamps; RFC 3339 filter values on them are sent
    /// as timestamp values.
    pub timestamp_fields: Vec<String>,
}

impl FirestoreConfig {
    pub fn new(base_url: &str, project_id: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            database_id: "(default)".to_string(),
            poll_interval: SyncConfig::default().subscription_poll_interval(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            inclusion_limit: DEFAULT_INCLUSION_LIMIT,
            timestamp_fields: vec!["updatedAt".to_string(), "createdAt".to_string()],
        }
    }

    /// Takes the poll cadence and inclusion ceiling from the engine config.
    pub fn with_sync_config(mut self, config: &SyncConfig) -> Self {
        self.poll_interval = config.subscription_poll_interval();
        self.inclusion_limit = config.inclusion_limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// [`DocumentStore`] over the REST API. Cheap to clone; clones share the
/// HTTP connection pool and the access token.
#[derive(Debug, Clone)]
pub struct FirestoreRestStore {
    client: reqwest::Client,
    documents_url: String,
    config: Arc<FirestoreConfig>,
    token: Arc<RwLock<Option<String>>>,
}

impl FirestoreRestStore {
    pub fn new(config: FirestoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let documents_url = format!(
            "{}/projects/{}/databases/{}/documents",
            config.base_url, config.project_id, config.database_id
        );
        Ok(Self {
            client,
            documents_url,
            config: Arc::new(config),
            token: Arc::new(RwLock::new(None)),
        })
    }

    /// Replaces the bearer token used by every subsequent request, including
    /// those of already-open change feeds.
    pub fn set_access_token(&self, token: Option<String>) {
        if let Ok(mut current) = self.token.write() {
            *current = token;
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let token = self
            .token
            .read()
            .map_err(|_| DocumentStoreError::auth("Token lock is poisoned"))?
            .clone()
            .ok_or_else(|| DocumentStoreError::auth("No access token set"))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| DocumentStoreError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    /// `:runQuery` is addressed at the parent of the queried collection.
    fn run_query_url(&self, collection: &CollectionPath) -> String {
        match collection {
            CollectionPath::Root(_) => format!("{}:runQuery", self.documents_url),
            CollectionPath::Nested {
                parent, parent_id, ..
            } => format!("{}/{}/{}:runQuery", self.documents_url, parent, parent_id),
        }
    }

    fn validate(&self, query: &Query) -> Result<()> {
        let widest = query.max_inclusion_len();
        if widest > self.config.inclusion_limit {
            return Err(DocumentStoreError::invalid_query(format!(
                "Inclusion set of {} values on {} exceeds the limit of {}",
                widest, query.collection, self.config.inclusion_limit
            )));
        }
        Ok(())
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[DocumentStore] Response status: {}", status);
            return;
        }
        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[DocumentStore] Response error ({}): {}", status, preview);
    }

    /// Runs `query` once, retrying transient failures with backoff.
    pub async fn run_query(&self, query: &Query) -> Result<Vec<Document>> {
        self.validate(query)?;
        let url = self.run_query_url(&query.collection);
        let body = structured_query(query, &self.config.timestamp_fields);
        let mut attempt = 0usize;

        loop {
            attempt = attempt.saturating_add(1);
            let send_result = self
                .client
                .post(&url)
                .headers(self.headers()?)
                .json(&body)
                .send()
                .await;

            match send_result {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await?;
                    Self::log_response(status, &text);
                    if status.is_success() {
                        return decode_run_query_response(&text);
                    }
                    if is_retryable_status(status.as_u16()) && attempt < QUERY_MAX_ATTEMPTS {
                        debug!(
                            "[DocumentStore] Retry {}/{} for {} after HTTP {}",
                            attempt + 1,
                            QUERY_MAX_ATTEMPTS,
                            query.collection,
                            status.as_u16()
                        );
                        sleep(backoff_with_jitter(attempt)).await;
                        continue;
                    }
                    return Err(parse_api_error(status.as_u16(), &text));
                }
                Err(err) => {
                    if is_retryable_transport_error(&err) && attempt < QUERY_MAX_ATTEMPTS {
                        debug!(
                            "[DocumentStore] Retry {}/{} for {} after transport error: {}",
                            attempt + 1,
                            QUERY_MAX_ATTEMPTS,
                            query.collection,
                            err
                        );
                        sleep(backoff_with_jitter(attempt)).await;
                        continue;
                    }
                    return Err(DocumentStoreError::Http(err));
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for FirestoreRestStore {
    async fn query(&self, query: &Query) -> harvestdesk_core::Result<Vec<Document>> {
        Ok(self.run_query(query).await?)
    }

    fn subscribe(&self, query: Query) -> harvestdesk_core::Result<Subscription> {
        self.validate(&query)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DocumentStoreError::Runtime(e.to_string()))?;
        let (mut feed, subscription) = Subscription::channel();
        let store = self.clone();
        let interval = self.config.poll_interval;

        runtime.spawn(async move {
            let mut last: Option<Vec<Document>> = None;
            loop {
                match store.run_query(&query).await {
                    Ok(docs) => {
                        if last.as_ref() != Some(&docs) {
                            if !feed.publish(docs.clone()) {
                                break;
                            }
                            last = Some(docs);
                        }
                    }
                    Err(err) => {
                        warn!(
                            "[DocumentStore] Poll of {} failed ({:?}): {}",
                            query.collection,
                            err.retry_class(),
                            err
                        );
                    }
                }
                tokio::select! {
                    _ = feed.closed() => break,
                    _ = sleep(poll_delay_with_jitter(interval)) => {}
                }
            }
            debug!("[DocumentStore] Feed on {} closed", query.collection);
        });

        Ok(subscription)
    }
}
