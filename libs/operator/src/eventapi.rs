//! Event intake for runs of the external engine.
//!
//! Each run gets its own HTTP endpoint on a UNIX domain socket; the engine
//! POSTs one JSON-encoded [`JobEvent`] per request. Events are forwarded in
//! arrival order over a bounded channel that closes exactly once, when the
//! receiver is shut down and all in-flight connections have drained.

use crate::error::{Error, Result};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal event closing every run.
pub const PLAYBOOK_ON_STATS: &str = "playbook_on_stats";
pub const PLAYBOOK_ON_TASK_START: &str = "playbook_on_task_start";
pub const RUNNER_ON_OK: &str = "runner_on_ok";
pub const RUNNER_ON_FAILED: &str = "runner_on_failed";

const EVENT_CHANNEL_CAPACITY: usize = 20;
const SERIALIZE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";
const PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Engine timestamp with nanosecond precision.
///
/// The engine's wire format (`2006-01-02T15:04:05.999999999`) is neither
/// RFC 3339 nor zoned, so it gets its own serde impls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime(pub NaiveDateTime);

impl Default for EventTime {
    fn default() -> Self {
        EventTime(chrono::DateTime::UNIX_EPOCH.naive_utc())
    }
}

impl EventTime {
    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        NaiveDateTime::parse_from_str(s, PARSE_FORMAT).map(EventTime)
    }
}

impl std::fmt::Display for EventTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(SERIALIZE_FORMAT))
    }
}

impl Serialize for EventTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.format(SERIALIZE_FORMAT))
    }
}

impl<'de> Deserialize<'de> for EventTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventTime::parse(s.trim_matches(|c| c == '"' || c == '\\')).map_err(D::Error::custom)
    }
}

/// One structured event of an engine run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub counter: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub start_line: i64,
    #[serde(default)]
    pub end_line: i64,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub event_data: Map<String, Value>,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub created: EventTime,
}

/// Typed `event_data` of the terminal stats event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsEventData {
    #[serde(default)]
    pub playbook: String,
    #[serde(default)]
    pub playbook_uuid: String,
    #[serde(default)]
    pub changed: HashMap<String, i64>,
    #[serde(default)]
    pub ok: HashMap<String, i64>,
    #[serde(default)]
    pub failures: HashMap<String, i64>,
    #[serde(default)]
    pub skipped: HashMap<String, i64>,
}

/// The terminal event reshaped with typed stats.
#[derive(Debug, Clone, Default)]
pub struct StatusJobEvent {
    pub uuid: String,
    pub counter: i64,
    pub event: String,
    pub event_data: StatsEventData,
    pub created: EventTime,
}

impl TryFrom<&JobEvent> for StatusJobEvent {
    type Error = Error;

    fn try_from(event: &JobEvent) -> Result<Self> {
        let event_data: StatsEventData =
            serde_json::from_value(Value::Object(event.event_data.clone()))?;
        Ok(StatusJobEvent {
            uuid: event.uuid.clone(),
            counter: event.counter,
            event: event.event.clone(),
            event_data,
            created: event.created,
        })
    }
}

impl StatusJobEvent {
    /// True when any host reported a failed task.
    pub fn any_failures(&self) -> bool {
        self.event_data.failures.values().any(|count| *count > 0)
    }
}

/// Per-run event intake endpoint.
///
/// Bound to a fresh UNIX socket; `socket_path` and `url_path` are handed to
/// the engine through the run settings.
pub struct EventReceiver {
    pub socket_path: PathBuf,
    pub url_path: String,
    events: Option<mpsc::Receiver<JobEvent>>,
    errors: mpsc::Receiver<Error>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl EventReceiver {
    /// Bind the socket and start serving.
    pub async fn bind(ident: &str, socket_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(socket_dir).await?;
        let socket_path = socket_dir.join(format!("{ident}.sock"));
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| Error::EventApiError(format!("failed to bind {}: {e}", socket_path.display())))?;

        let url_path = format!("/events/{ident}");
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            url_path.clone(),
            event_tx,
            error_tx,
            shutdown.clone(),
        ));

        Ok(EventReceiver {
            socket_path,
            url_path,
            events: Some(event_rx),
            errors: error_rx,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    /// Take the ordered event stream. Yields `None` once per receiver.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<JobEvent>> {
        self.events.take()
    }

    /// Stop accepting connections and close the event stream.
    ///
    /// Waits for in-flight connections to drain, so after this returns the
    /// event channel is guaranteed closed.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            if task.await.is_err() {
                warn!(msg = "event receiver task panicked");
            }
        }
        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(msg = "failed to remove event socket", %e);
            }
        }
    }

    /// Pull the pending serve error, if any. Clean shutdown leaves nothing.
    pub fn drain_error(&mut self) -> Option<Error> {
        self.errors.try_recv().ok()
    }
}

async fn accept_loop(
    listener: UnixListener,
    url_path: String,
    event_tx: mpsc::Sender<JobEvent>,
    error_tx: mpsc::Sender<Error>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let url_path = url_path.clone();
                    let event_tx = event_tx.clone();
                    connections.spawn(async move {
                        let service = service_fn(move |req| {
                            handle_event_post(req, url_path.clone(), event_tx.clone())
                        });
                        http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                    });
                }
                Err(e) => {
                    let _ = error_tx.try_send(Error::EventApiError(format!("accept failed: {e}")));
                    break;
                }
            },
        }
    }
    // Drain in-flight connections before the last sender drops; this is what
    // closes the event stream.
    while let Some(finished) = connections.join_next().await {
        match finished {
            // Peers tearing the connection down mid-keepalive is a clean close.
            Ok(Err(e)) if !e.is_incomplete_message() => {
                let _ = error_tx.try_send(Error::EventApiError(format!("serve failed: {e}")));
            }
            _ => {}
        }
    }
}

async fn handle_event_post(
    req: Request<Incoming>,
    url_path: String,
    event_tx: mpsc::Sender<JobEvent>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let events_prefix = format!("{url_path}/job_events/");
    if req.method() != Method::POST || !req.uri().path().starts_with(&events_prefix) {
        return Ok(status_response(StatusCode::NOT_FOUND));
    }
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(status_response(StatusCode::BAD_REQUEST)),
    };
    match serde_json::from_slice::<JobEvent>(&body) {
        Ok(event) => {
            debug!(msg = "received job event", counter = event.counter, event = %event.event);
            if event_tx.send(event).await.is_err() {
                // Receiver side is gone; the run is over.
                return Ok(status_response(StatusCode::GONE));
            }
            Ok(status_response(StatusCode::OK))
        }
        Err(e) => {
            warn!(msg = "failed to decode job event", %e);
            Ok(status_response(StatusCode::BAD_REQUEST))
        }
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
