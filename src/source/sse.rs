//! Server-Sent Events implementation of [`EventSource`].
//!
//! Streams `{base_url}/events/projects/{id}/stream`. Each blank-line
//! terminated block with `data:` lines is one event; comment lines (`:ok`)
//! and other fields are ignored.

use super::{Connection, ConnectionHandle, EventSource, SourceEvent};
use crate::api::http::normalize_base;
use crate::error::{SyncError, SyncResult};
use crate::types::ProjectId;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Upper bound on establishing the TCP/TLS connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for the response headers of a stream request.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Largest line or event the decoder buffers before dropping it.
pub const MAX_EVENT_BYTES: usize = 256 * 1024;

/// Push channel over SSE.
#[derive(Debug, Clone)]
pub struct SseEventSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl SseEventSource {
    /// Build a source. Opening a stream is bounded by [`CONNECT_TIMEOUT`] and
    /// [`OPEN_TIMEOUT`]; the body itself has no read timeout, so a dead
    /// connection is noticed when the body ends.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> SyncResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(SyncError::transport)?;
        Ok(Self {
            client,
            base_url: normalize_base(base_url.into()),
            token,
        })
    }

    pub fn stream_url(&self, scope: ProjectId) -> String {
        format!("{}/events/projects/{scope}/stream", self.base_url)
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn open(&self, scope: ProjectId) -> SyncResult<Connection> {
        let url = self.stream_url(scope);
        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = match tokio::time::timeout(OPEN_TIMEOUT, request.send()).await {
            Ok(sent) => sent.map_err(SyncError::transport)?,
            Err(_) => {
                return Err(SyncError::transport(format!(
                    "no response from {url} within {}s",
                    OPEN_TIMEOUT.as_secs()
                )));
            }
        };
        if !response.status().is_success() {
            return Err(SyncError::HttpStatus {
                endpoint: format!("/events/projects/{scope}/stream"),
                status: response.status().as_u16(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut parser = SseParser::default();

            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for data in parser.feed(&bytes) {
                            if tx.send(SourceEvent::Message(data)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(SourceEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            debug!(scope, "Event stream ended");
        });

        info!(scope, "Opened event stream");
        let abort = reader.abort_handle();
        Ok(Connection {
            scope,
            events: rx,
            handle: ConnectionHandle::new(move || abort.abort()),
        })
    }
}

/// Incremental SSE decoder.
///
/// A line or event larger than [`MAX_EVENT_BYTES`] is discarded up to the
/// next blank line, after which decoding resumes.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
    /// Drop bytes until the end of the current line.
    skip_line: bool,
    /// Drop data lines until the end of the current event.
    skip_event: bool,
}

impl SseParser {
    /// Feed raw bytes; returns the data of every event completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if std::mem::take(&mut self.skip_line) {
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() && !self.skip_event {
                    events.push(self.data.join("\n"));
                }
                self.reset_event();
                continue;
            }
            if line.starts_with(':') || self.skip_event {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field == "data" {
                self.data_len += value.len() + 1;
                if self.data_len > MAX_EVENT_BYTES {
                    self.drop_event();
                } else {
                    self.data.push(value.to_string());
                }
            }
        }

        if self.pending.len() > MAX_EVENT_BYTES {
            self.pending = Vec::new();
            self.skip_line = true;
            self.drop_event();
        }
        events
    }

    fn reset_event(&mut self) {
        self.data.clear();
        self.data_len = 0;
        self.skip_event = false;
    }

    fn drop_event(&mut self) {
        if !self.skip_event {
            warn!(limit = MAX_EVENT_BYTES, "Dropping oversized event");
        }
        self.data.clear();
        self.data_len = 0;
        self.skip_event = true;
    }
}
