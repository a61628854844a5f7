//! The streaming gateway
//!
//! Turns an adversarial upstream into a deterministic, client-safe MPEG-TS
//! byte stream. Candidates from the channel's ranked `stream_urls` go
//! through header-stage checks (status, the Cloudflare empty-body
//! signature, HLS playlist validity) before the client sees a status line;
//! exhaustion at that stage is the 502 path. Once the 200 is on the wire
//! the startup gate holds upstream bytes back while keepalive packets tick
//! out, and a candidate that never produces a byte within the header
//! timeout is swapped for the next one mid-gate, invisibly to the client.
//!
//! Backpressure is a small bounded channel: a slow client throttles
//! upstream reads, nothing queues unbounded.

pub mod gate;
pub mod mpegts;
pub mod remux;

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::catalog::model::LiveChannel;
use crate::config::{Config, TranscodeMode};
use crate::httpx::HttpPool;
use crate::netutil;
use crate::server::tuner::SlotGuard;
use gate::{GateConfig, StartupGate};
use remux::Remuxer;

/// Response-header budget for candidate opens, also the first-byte budget
const CANDIDATE_HEADER_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on how much of an HLS playlist body is read for validation
const HLS_BODY_LIMIT: usize = 512 * 1024;

/// Read chunk size for the remux pipe
const REMUX_READ_SIZE: usize = 64 * 1024;

/// Error types for session setup
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Every ranked candidate was rejected; the client gets a 502
    #[error("all upstream candidates failed")]
    AllUpstreamsFailed,
}

/// Why one candidate was rejected at the header stage
#[derive(Debug)]
enum CandidateReject {
    NonSuccess(u16),
    EmptyBody,
    NoFirstBytes,
    BadHls(&'static str),
    Transport(String),
    Remux(String),
}

impl std::fmt::Display for CandidateReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateReject::NonSuccess(status) => write!(f, "status {}", status),
            CandidateReject::EmptyBody => write!(f, "Content-Length 0 (dead host)"),
            CandidateReject::NoFirstBytes => write!(f, "no bytes within header timeout"),
            CandidateReject::BadHls(reason) => write!(f, "bad HLS playlist: {}", reason),
            CandidateReject::Transport(e) => write!(f, "transport: {}", e),
            CandidateReject::Remux(e) => write!(f, "remux spawn: {}", e),
        }
    }
}

/// Per-session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Gated,
    Flowing,
    Closing,
    Failed,
}

/// What the gateway needs to open further candidates mid-session
#[derive(Clone)]
struct OpenContext {
    pool: HttpPool,
    transcode: TranscodeMode,
    session_id: String,
}

/// A successfully opened upstream plus the untried backups
pub struct OpenedUpstream {
    source: UpstreamSource,
    url: String,
    remaining: VecDeque<String>,
    context: OpenContext,
}

/// The two byte sources a session can read from
enum UpstreamSource {
    /// Raw TS body streamed straight through
    Ts {
        body: Box<dyn futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin>,
    },
    /// FFmpeg remux pipe
    Remux {
        _remuxer: Remuxer,
        stdout: tokio::process::ChildStdout,
    },
}

impl UpstreamSource {
    /// Next chunk of upstream bytes; `None` on EOF
    async fn next_chunk(&mut self) -> Option<std::io::Result<Bytes>> {
        match self {
            UpstreamSource::Ts { body } => body.next().await.map(|r| {
                r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            }),
            UpstreamSource::Remux { stdout, .. } => {
                let mut buf = BytesMut::with_capacity(REMUX_READ_SIZE);
                match stdout.read_buf(&mut buf).await {
                    Ok(0) => None,
                    Ok(_) => Some(Ok(buf.freeze())),
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }

    fn is_raw_ts(&self) -> bool {
        matches!(self, UpstreamSource::Ts { .. })
    }
}

/// Open the first candidate that survives the header-stage checks
///
/// Rejections are logged with redacted URLs and the next base is tried;
/// exhaustion maps to a 502. The untried tail travels with the session so
/// a candidate that later fails to produce bytes can be replaced without
/// the client noticing.
pub async fn open_upstream(
    pool: &HttpPool,
    channel: &LiveChannel,
    config: &Config,
    session_id: &str,
) -> Result<OpenedUpstream, GatewayError> {
    let context = OpenContext {
        pool: pool.clone(),
        transcode: config.stream_transcode_mode,
        session_id: session_id.to_string(),
    };

    let mut candidates: VecDeque<String> = channel.stream_urls.iter().cloned().collect();
    while let Some(url) = candidates.pop_front() {
        match open_candidate(&context, &url).await {
            Ok(source) => {
                tracing::info!(
                    session_id,
                    url = %netutil::redact(&url),
                    "upstream opened"
                );
                return Ok(OpenedUpstream {
                    source,
                    url,
                    remaining: candidates,
                    context,
                });
            }
            Err(reject) => {
                tracing::warn!(
                    session_id,
                    url = %netutil::redact(&url),
                    reason = %reject,
                    "candidate rejected, trying next"
                );
            }
        }
    }
    Err(GatewayError::AllUpstreamsFailed)
}

/// Header-stage open: status, empty-body signature, HLS classification
///
/// Deliberately does not wait for body bytes; the gated session handles
/// first-byte timeouts so keepalive can flow to the client meanwhile.
async fn open_candidate(
    context: &OpenContext,
    url: &str,
) -> Result<UpstreamSource, CandidateReject> {
    let send = context.pool.stream_client().get(url).send();
    let response = tokio::time::timeout(CANDIDATE_HEADER_TIMEOUT, send)
        .await
        .map_err(|_| CandidateReject::NoFirstBytes)?
        .map_err(|e| CandidateReject::Transport(e.to_string()))?;

    let status = response.status();
    if !(status.is_success() || status.as_u16() == 206) {
        return Err(CandidateReject::NonSuccess(status.as_u16()));
    }

    // Cloudflare's dead-host signature: 200 with an explicit empty body
    if response.content_length() == Some(0) {
        return Err(CandidateReject::EmptyBody);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if is_hls_type(&content_type, url) {
        return open_hls(context, response, url).await;
    }

    Ok(UpstreamSource::Ts {
        body: Box::new(response.bytes_stream()),
    })
}

/// Validate an HLS-typed response body, then hand the URL to FFmpeg
async fn open_hls(
    context: &OpenContext,
    response: reqwest::Response,
    url: &str,
) -> Result<UpstreamSource, CandidateReject> {
    let mut body = response.bytes_stream();
    let mut playlist = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| CandidateReject::Transport(e.to_string()))?;
        playlist.extend_from_slice(&chunk);
        if playlist.len() >= HLS_BODY_LIMIT {
            break;
        }
    }

    validate_hls_body(&playlist)?;
    spawn_remux(context, url).await
}

async fn spawn_remux(
    context: &OpenContext,
    url: &str,
) -> Result<UpstreamSource, CandidateReject> {
    let mut remuxer = Remuxer::open(url, context.transcode, &context.session_id)
        .await
        .map_err(|e| CandidateReject::Remux(e.to_string()))?;
    let stdout = remuxer
        .take_stdout()
        .ok_or(CandidateReject::Remux("no stdout pipe".to_string()))?;

    Ok(UpstreamSource::Remux {
        _remuxer: remuxer,
        stdout,
    })
}

/// HLS content types, plus the extension for panels that lie about types
fn is_hls_type(content_type: &str, url: &str) -> bool {
    content_type.contains("mpegurl")
        || url.split('?').next().unwrap_or("").ends_with(".m3u8")
}

/// An HLS body must carry the header and at least one segment or variant
fn validate_hls_body(body: &[u8]) -> Result<(), CandidateReject> {
    let text = String::from_utf8_lossy(body);
    if !text.contains("#EXTM3U") {
        return Err(CandidateReject::BadHls("missing #EXTM3U"));
    }
    let has_segment = text.lines().any(|line| {
        let line = line.trim();
        (!line.is_empty() && !line.starts_with('#')) || line.starts_with("#EXT-X-STREAM-INF")
    });
    if !has_segment {
        return Err(CandidateReject::BadHls("no segments"));
    }
    Ok(())
}

/// Run a session: gate with keepalive, flush, flow
///
/// Returns the channel receiver feeding the response body. The spawned
/// task owns the tuner slot; every exit path (client gone, upstream EOF,
/// dead read, gate failure) releases it by dropping the guard.
pub fn run_session(
    upstream: OpenedUpstream,
    slot: SlotGuard,
    config: &Config,
    session_id: String,
) -> mpsc::Receiver<std::io::Result<Bytes>> {
    let gate_config = GateConfig::from_config(config);
    let dead_read = Duration::from_millis(config.dead_read_timeout_ms);
    let capacity = channel_capacity(config.stream_buffer_bytes.resolve());
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(capacity);

    tokio::spawn(async move {
        let _slot = slot;
        let state = drive_session(upstream, tx, gate_config, dead_read, &session_id).await;
        tracing::info!(session_id, state = ?state, "session ended");
    });

    rx
}

/// Bounded channel size for the configured stream buffer
///
/// 0 (unbuffered) degenerates to a single-chunk rendezvous: each upstream
/// read waits for the previous chunk to reach the client socket.
fn channel_capacity(buffer_bytes: usize) -> usize {
    const ASSUMED_CHUNK: usize = 16 * 1024;
    (buffer_bytes / ASSUMED_CHUNK).max(1)
}

async fn drive_session(
    upstream: OpenedUpstream,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    gate_config: GateConfig,
    dead_read: Duration,
    session_id: &str,
) -> SessionState {
    let OpenedUpstream {
        mut source,
        mut url,
        mut remaining,
        context,
    } = upstream;

    let timeout_policy = gate_config.timeout_policy;
    let mut gate = StartupGate::new(gate_config);
    let gate_deadline = tokio::time::Instant::now() + gate.config().timeout;
    let mut got_upstream_bytes = false;
    let mut first_byte_deadline = tokio::time::Instant::now() + CANDIDATE_HEADER_TIMEOUT;

    // Keepalive ticker; effectively disabled when no keepalive is configured
    let tick = gate
        .config()
        .keepalive_tick()
        .unwrap_or(Duration::from_secs(3600));
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);

    // ---- Gate phase: hold upstream bytes, tick keepalive ----
    let gated_ok = loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if let Some(burst) = gate.keepalive_burst() {
                    if tx.send(Ok(Bytes::from(burst))).await.is_err() {
                        return SessionState::Closing;
                    }
                }
            }
            chunk = source.next_chunk() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        // Panels sometimes serve HLS under a generic content
                        // type; the body prefix is the tell
                        if !got_upstream_bytes
                            && source.is_raw_ts()
                            && bytes.starts_with(b"#EXTM3U")
                        {
                            tracing::info!(
                                session_id,
                                url = %netutil::redact(&url),
                                "TS-typed body is an HLS playlist, switching to remux"
                            );
                            match spawn_remux(&context, &url).await {
                                Ok(remux) => {
                                    source = remux;
                                    first_byte_deadline =
                                        tokio::time::Instant::now() + CANDIDATE_HEADER_TIMEOUT;
                                    continue;
                                }
                                Err(reject) => {
                                    tracing::warn!(session_id, reason = %reject, "remux failed");
                                    return SessionState::Failed;
                                }
                            }
                        }

                        got_upstream_bytes = true;
                        if gate.push(&bytes) {
                            break true;
                        }
                    }
                    Some(Err(_)) | None if !got_upstream_bytes => {
                        // Accepted at header stage but never produced a byte:
                        // reject without counting toward the client
                        match next_candidate(&context, &mut remaining, session_id).await {
                            Some((new_source, new_url)) => {
                                source = new_source;
                                url = new_url;
                                first_byte_deadline =
                                    tokio::time::Instant::now() + CANDIDATE_HEADER_TIMEOUT;
                            }
                            None => return SessionState::Failed,
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session_id, error = %e, "upstream error during gate");
                        return SessionState::Failed;
                    }
                    None => {
                        tracing::warn!(session_id, "upstream EOF during gate");
                        return SessionState::Failed;
                    }
                }
            }
            _ = tokio::time::sleep_until(first_byte_deadline), if !got_upstream_bytes => {
                tracing::warn!(
                    session_id,
                    url = %netutil::redact(&url),
                    "no first bytes within header timeout"
                );
                match next_candidate(&context, &mut remaining, session_id).await {
                    Some((new_source, new_url)) => {
                        source = new_source;
                        url = new_url;
                        first_byte_deadline =
                            tokio::time::Instant::now() + CANDIDATE_HEADER_TIMEOUT;
                    }
                    None => return SessionState::Failed,
                }
            }
            _ = tokio::time::sleep_until(gate_deadline) => {
                tracing::warn!(
                    session_id,
                    buffered = gate.buffered_len(),
                    policy = ?timeout_policy,
                    "startup gate timed out"
                );
                match timeout_policy {
                    crate::config::GateTimeoutPolicy::Fail => return SessionState::Failed,
                    crate::config::GateTimeoutPolicy::Stream => {
                        if let Some(bootstrap) = gate.bootstrap() {
                            if tx.send(Ok(Bytes::from(bootstrap))).await.is_err() {
                                return SessionState::Closing;
                            }
                        }
                        break false;
                    }
                }
            }
        }
    };

    // ---- Flush: buffered upstream bytes, in order, nothing dropped ----
    let buffered = gate.take_buffer();
    if !buffered.is_empty() && tx.send(Ok(Bytes::from(buffered))).await.is_err() {
        return SessionState::Closing;
    }
    if gated_ok {
        tracing::debug!(session_id, "startup gate satisfied");
    }

    // ---- Flow phase: upstream reads driven by client writes ----
    loop {
        let chunk = match tokio::time::timeout(dead_read, source.next_chunk()).await {
            Ok(chunk) => chunk,
            Err(_) => {
                tracing::warn!(session_id, "no upstream bytes within dead-read timeout");
                return SessionState::Failed;
            }
        };

        match chunk {
            Some(Ok(bytes)) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    // Client went away
                    return SessionState::Closing;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(session_id, error = %e, "upstream read error");
                return SessionState::Failed;
            }
            None => {
                tracing::info!(session_id, "upstream EOF");
                return SessionState::Closing;
            }
        }
    }
}

/// Header-open the next untried candidate, skipping ones that reject
async fn next_candidate(
    context: &OpenContext,
    remaining: &mut VecDeque<String>,
    session_id: &str,
) -> Option<(UpstreamSource, String)> {
    while let Some(url) = remaining.pop_front() {
        match open_candidate(context, &url).await {
            Ok(source) => {
                tracing::info!(
                    session_id,
                    url = %netutil::redact(&url),
                    "failed over to next candidate"
                );
                return Some((source, url));
            }
            Err(reject) => {
                tracing::warn!(
                    session_id,
                    url = %netutil::redact(&url),
                    reason = %reject,
                    "candidate rejected, trying next"
                );
            }
        }
    }
    tracing::warn!(session_id, "all upstream candidates exhausted mid-gate");
    None
}
