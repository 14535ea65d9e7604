//! Hand-off of assembled bundles to the downstream platform.
//!
//! A dispatch is two calls: [`Dispatcher::initiate_work`] registers a unit of
//! work under a human-readable label, then [`Dispatcher::send`] delivers the
//! bundle bytes against it. Before the first bundle the producer identity that
//! every object references is handed over with
//! [`Dispatcher::register_identity`]. Two sinks ship here:
//!
//! - [`DirectorySink`] drops bundles into a local outbox directory
//! - [`HttpSink`] POSTs them to an HTTP ingestion endpoint

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use ctirelay_graph::Identity;
use ctirelay_shared::{AppConfig, CtiRelayError, Result, SinkKind};

use crate::bundle;

/// File name of the registered identity inside the outbox.
const IDENTITY_FILE: &str = "identity.json";

/// User-Agent string for sink requests.
const USER_AGENT: &str = concat!("ctirelay/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// WorkId / Dispatcher
// ---------------------------------------------------------------------------

/// Identifier of one unit of work on the downstream platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(String);

impl WorkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Downstream sink for bundles.
pub trait Dispatcher: Send + Sync {
    /// Make the producer identity known downstream. Idempotent.
    fn register_identity(&self, identity: &Identity) -> impl Future<Output = Result<()>> + Send;

    /// Register a unit of work and return its id.
    fn initiate_work(&self, label: &str) -> impl Future<Output = Result<WorkId>> + Send;

    /// Deliver serialized bundle bytes for a previously initiated work unit.
    fn send(
        &self,
        bundle: &[u8],
        work_id: &WorkId,
        update_existing: bool,
    ) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// DirectorySink
// ---------------------------------------------------------------------------

/// Sidecar written next to each bundle in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMeta {
    pub work_id: WorkId,
    pub label: String,
    pub update_existing: bool,
    pub object_count: usize,
    pub sha256: String,
    pub size_bytes: usize,
}

/// Writes each bundle to `<outbox>/<work-id>.json` plus a `.meta.json` sidecar.
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
    labels: Mutex<HashMap<WorkId, String>>,
}

impl DirectorySink {
    /// Open (creating if absent) an outbox directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CtiRelayError::io(&dir, e))?;
        Ok(Self {
            dir,
            labels: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the registered identity.
    pub fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    /// Path of the bundle file for `work_id`.
    pub fn bundle_path(&self, work_id: &WorkId) -> PathBuf {
        self.dir.join(format!("{work_id}.json"))
    }

    /// Path of the metadata sidecar for `work_id`.
    pub fn meta_path(&self, work_id: &WorkId) -> PathBuf {
        self.dir.join(format!("{work_id}.meta.json"))
    }

    fn take_label(&self, work_id: &WorkId) -> Result<String> {
        let mut labels = self
            .labels
            .lock()
            .map_err(|_| CtiRelayError::Dispatch("outbox label table poisoned".into()))?;
        labels
            .remove(work_id)
            .ok_or_else(|| CtiRelayError::Dispatch(format!("unknown work id {work_id}")))
    }
}

impl Dispatcher for DirectorySink {
    async fn register_identity(&self, identity: &Identity) -> Result<()> {
        let json = serde_json::to_vec_pretty(identity)?;
        write_atomic(&self.identity_path(), &json)?;
        debug!(identity = %identity.id, "identity written to outbox");
        Ok(())
    }

    async fn initiate_work(&self, label: &str) -> Result<WorkId> {
        let work_id = WorkId::new(Uuid::now_v7().to_string());
        self.labels
            .lock()
            .map_err(|_| CtiRelayError::Dispatch("outbox label table poisoned".into()))?
            .insert(work_id.clone(), label.to_string());
        debug!(%work_id, label, "initiated outbox work");
        Ok(work_id)
    }

    #[instrument(skip_all, fields(work_id = %work_id, size = bundle.len()))]
    async fn send(&self, bundle: &[u8], work_id: &WorkId, update_existing: bool) -> Result<()> {
        let label = self.take_label(work_id)?;

        let object_count = serde_json::from_slice::<serde_json::Value>(bundle)?
            .get("objects")
            .and_then(serde_json::Value::as_array)
            .map_or(0, Vec::len);

        let meta = BundleMeta {
            work_id: work_id.clone(),
            label,
            update_existing,
            object_count,
            sha256: bundle::digest(bundle),
            size_bytes: bundle.len(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)?;

        // Bundle first: a sidecar never points at a missing bundle.
        write_atomic(&self.bundle_path(work_id), bundle)?;
        write_atomic(&self.meta_path(work_id), &meta_json)?;

        info!(object_count, sha256 = %meta.sha256, "bundle written to outbox");
        Ok(())
    }
}

/// Write to a dot-prefixed temp file, then rename over the target.
fn write_atomic(target: &Path, content: &[u8]) -> Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = target.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&temp, content).map_err(|e| CtiRelayError::io(&temp, e))?;
    std::fs::rename(&temp, target).map_err(|e| CtiRelayError::io(target, e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// HttpSink
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WorkRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct WorkResponse {
    id: String,
}

/// POSTs the identity to `<base>/identities`, work registrations to
/// `<base>/work` and bundles to `<base>/bundles`.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSink {
    /// Build a sink for `base_url`; `token` is sent as a bearer token.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| CtiRelayError::Dispatch(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-2xx response to a dispatch error carrying status and body.
async fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CtiRelayError::Dispatch(format!("{url}: HTTP {status}: {body}")))
}

impl Dispatcher for HttpSink {
    #[instrument(skip_all, fields(identity = %identity.id))]
    async fn register_identity(&self, identity: &Identity) -> Result<()> {
        let url = self.endpoint("identities");
        let response = self
            .authorized(self.client.post(&url))
            .json(identity)
            .send()
            .await
            .map_err(|e| CtiRelayError::Dispatch(format!("{url}: {e}")))?;

        check_status(&url, response).await?;
        debug!("identity registered");
        Ok(())
    }

    #[instrument(skip_all, fields(label = %label))]
    async fn initiate_work(&self, label: &str) -> Result<WorkId> {
        let url = self.endpoint("work");
        let response = self
            .authorized(self.client.post(&url))
            .json(&WorkRequest { name: label })
            .send()
            .await
            .map_err(|e| CtiRelayError::Dispatch(format!("{url}: {e}")))?;

        let work: WorkResponse = check_status(&url, response)
            .await?
            .json()
            .await
            .map_err(|e| CtiRelayError::Dispatch(format!("{url}: invalid work response: {e}")))?;

        debug!(work_id = %work.id, "initiated remote work");
        Ok(WorkId::new(work.id))
    }

    #[instrument(skip_all, fields(work_id = %work_id, size = bundle.len()))]
    async fn send(&self, bundle: &[u8], work_id: &WorkId, update_existing: bool) -> Result<()> {
        let url = self.endpoint("bundles");
        let response = self
            .authorized(self.client.post(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Work-Id", work_id.as_str())
            .header("X-Update-Existing", update_existing.to_string())
            .body(bundle.to_vec())
            .send()
            .await
            .map_err(|e| CtiRelayError::Dispatch(format!("{url}: {e}")))?;

        check_status(&url, response).await?;
        info!(sha256 = %bundle::digest(bundle), "bundle posted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sink (config-selected)
// ---------------------------------------------------------------------------

/// The sink chosen by `[sink] kind`.
#[derive(Debug)]
pub enum Sink {
    Directory(DirectorySink),
    Http(HttpSink),
}

impl Sink {
    /// Build the configured sink. The HTTP token is read from the env var
    /// named by `sink.token_env`; an unset or empty var means no token.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        match config.sink.kind {
            SinkKind::Directory => Ok(Self::Directory(DirectorySink::open(config.outbox_dir()?)?)),
            SinkKind::Http => {
                if config.sink.url.trim().is_empty() {
                    return Err(CtiRelayError::config(
                        "sink.url is required when sink.kind = \"http\"",
                    ));
                }
                let token = std::env::var(&config.sink.token_env)
                    .ok()
                    .filter(|t| !t.is_empty());
                if token.is_none() {
                    debug!(env = %config.sink.token_env, "no sink token set");
                }
                Ok(Self::Http(HttpSink::new(
                    &config.sink.url,
                    token,
                    Duration::from_secs(config.sink.timeout_secs),
                )?))
            }
        }
    }
}

impl Dispatcher for Sink {
    async fn register_identity(&self, identity: &Identity) -> Result<()> {
        match self {
            Self::Directory(sink) => sink.register_identity(identity).await,
            Self::Http(sink) => sink.register_identity(identity).await,
        }
    }

    async fn initiate_work(&self, label: &str) -> Result<WorkId> {
        match self {
            Self::Directory(sink) => sink.initiate_work(label).await,
            Self::Http(sink) => sink.initiate_work(label).await,
        }
    }

    async fn send(&self, bundle: &[u8], work_id: &WorkId, update_existing: bool) -> Result<()> {
        match self {
            Self::Directory(sink) => sink.send(bundle, work_id, update_existing).await,
            Self::Http(sink) => sink.send(bundle, work_id, update_existing).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("ctirelay-outbox-test-{}", Uuid::now_v7()))
    }

    const BUNDLE: &[u8] = br#"{"type":"bundle","id":"bundle--1","objects":[{"type":"url"},{"type":"indicator"}]}"#;

    #[tokio::test]
    async fn directory_sink_writes_bundle_and_meta() {
        let tmp = temp_dir();
        let sink = DirectorySink::open(&tmp).unwrap();

        let work_id = sink.initiate_work("ctirelay run @ 2024-01-01T00:00:00Z").await.unwrap();
        sink.send(BUNDLE, &work_id, true).await.unwrap();

        let written = std::fs::read(sink.bundle_path(&work_id)).unwrap();
        assert_eq!(written, BUNDLE);

        let meta: BundleMeta =
            serde_json::from_slice(&std::fs::read(sink.meta_path(&work_id)).unwrap()).unwrap();
        assert_eq!(meta.work_id, work_id);
        assert_eq!(meta.label, "ctirelay run @ 2024-01-01T00:00:00Z");
        assert!(meta.update_existing);
        assert_eq!(meta.object_count, 2);
        assert_eq!(meta.sha256, bundle::digest(BUNDLE));
        assert_eq!(meta.size_bytes, BUNDLE.len());

        // No temp files left behind.
        let leftovers = std::fs::read_dir(&tmp)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn directory_sink_writes_identity() {
        let tmp = temp_dir();
        let sink = DirectorySink::open(&tmp).unwrap();
        let identity = Identity::new("VNCERT", "National CERT", "organization");

        sink.register_identity(&identity).await.unwrap();
        // Registering again overwrites in place.
        sink.register_identity(&identity).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sink.identity_path()).unwrap()).unwrap();
        assert_eq!(written["type"], "identity");
        assert_eq!(written["id"], identity.id.as_str());
        assert_eq!(written["spec_version"], "2.1");
        assert_eq!(written["description"], "National CERT");
        assert_eq!(written["identity_class"], "organization");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn directory_sink_rejects_unknown_work() {
        let tmp = temp_dir();
        let sink = DirectorySink::open(&tmp).unwrap();

        let err = sink.send(BUNDLE, &WorkId::new("nope"), false).await.unwrap_err();
        assert!(matches!(err, CtiRelayError::Dispatch(_)));
        assert!(!sink.bundle_path(&WorkId::new("nope")).exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn directory_sink_rejects_invalid_json() {
        let tmp = temp_dir();
        let sink = DirectorySink::open(&tmp).unwrap();

        let work_id = sink.initiate_work("label").await.unwrap();
        let err = sink.send(b"not json", &work_id, false).await.unwrap_err();
        assert!(matches!(err, CtiRelayError::Serialization(_)));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn http_sink_posts_work_then_bundle() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/work"))
            .and(wiremock::matchers::header("authorization", "Bearer s3cret"))
            .and(wiremock::matchers::body_json(serde_json::json!({"name": "run @ now"})))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "work-42"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/bundles"))
            .and(wiremock::matchers::header("x-work-id", "work-42"))
            .and(wiremock::matchers::header("x-update-existing", "false"))
            .and(wiremock::matchers::header("authorization", "Bearer s3cret"))
            .and(wiremock::matchers::body_bytes(BUNDLE))
            .respond_with(wiremock::ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(
            &format!("{}/", server.uri()),
            Some("s3cret".into()),
            Duration::from_secs(5),
        )
        .unwrap();

        let work_id = sink.initiate_work("run @ now").await.unwrap();
        assert_eq!(work_id.as_str(), "work-42");
        sink.send(BUNDLE, &work_id, false).await.unwrap();
    }

    #[tokio::test]
    async fn http_sink_posts_identity() {
        let server = wiremock::MockServer::start().await;
        let identity = Identity::new("VNCERT", "National CERT", "organization");

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/identities"))
            .and(wiremock::matchers::header("authorization", "Bearer s3cret"))
            .and(wiremock::matchers::body_json(serde_json::json!({
                "type": "identity",
                "spec_version": "2.1",
                "id": identity.id.clone(),
                "name": "VNCERT",
                "description": "National CERT",
                "identity_class": "organization",
            })))
            .respond_with(wiremock::ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(&server.uri(), Some("s3cret".into()), Duration::from_secs(5))
            .unwrap();
        sink.register_identity(&identity).await.unwrap();
    }

    #[tokio::test]
    async fn http_sink_identity_rejection_is_dispatch_error() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/identities"))
            .respond_with(wiremock::ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let sink = HttpSink::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let identity = Identity::new("VNCERT", "", "organization");
        let err = sink.register_identity(&identity).await.unwrap_err();
        assert!(matches!(err, CtiRelayError::Dispatch(ref msg) if msg.contains("401")));
    }

    #[tokio::test]
    async fn http_sink_maps_error_status() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/bundles"))
            .respond_with(wiremock::ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let sink = HttpSink::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = sink
            .send(BUNDLE, &WorkId::new("w"), true)
            .await
            .unwrap_err();

        match err {
            CtiRelayError::Dispatch(msg) => {
                assert!(msg.contains("503"));
                assert!(msg.contains("busy"));
            }
            other => panic!("expected Dispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_sink_rejects_malformed_work_response() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/work"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let sink = HttpSink::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let err = sink.initiate_work("label").await.unwrap_err();
        assert!(matches!(err, CtiRelayError::Dispatch(_)));
    }

    #[test]
    fn sink_from_config() {
        let tmp = temp_dir();
        let mut config = AppConfig::default();
        config.sink.outbox_dir = tmp.display().to_string();

        let sink = Sink::from_config(&config).unwrap();
        assert!(matches!(sink, Sink::Directory(_)));
        assert!(tmp.is_dir());

        config.sink.kind = SinkKind::Http;
        assert!(Sink::from_config(&config).is_err());

        config.sink.url = "http://127.0.0.1:9/api".into();
        config.sink.token_env = format!("CTIRELAY_TEST_TOKEN_{}", Uuid::now_v7().simple());
        assert!(matches!(Sink::from_config(&config).unwrap(), Sink::Http(_)));

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
