//! Server-Sent Events transport for the push stream

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use pushshare_core::models::{InstanceId, RelayFrame};

use super::{FrameStream, StreamConnector};
use crate::error::{Error, Result};
use crate::registration::http::{build_client, normalize_base_url};

/// Incremental `text/event-stream` decoder yielding the `data` of each event
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let event = self.data.join("\n");
            self.data.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        // event, id and retry carry nothing the relay needs
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

/// Parse one event's data as a relay frame, skipping anything malformed
fn parse_frame(data: &str) -> Option<RelayFrame> {
    match serde_json::from_str::<RelayFrame>(data) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, data = %data, "Skipping malformed stream frame");
            None
        }
    }
}

/// Opens `event?instance_id=` on the push server
#[derive(Debug, Clone)]
pub struct SseConnector {
    client: Client,
    base_url: Url,
    connect_timeout: Duration,
}

impl SseConnector {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        Self::with_client(build_client()?, base_url, connect_timeout)
    }

    /// Open streams through an existing client and its connection pool
    pub fn with_client(client: Client, base_url: &str, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            connect_timeout,
        })
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn connect(&self, instance_id: &InstanceId) -> Result<FrameStream> {
        let url = self
            .base_url
            .join("event")
            .map_err(|e| Error::Configuration(format!("Invalid event endpoint: {e}")))?;

        let request = self
            .client
            .get(url)
            .query(&[("instance_id", instance_id.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();

        let response = tokio::time::timeout(self.connect_timeout, request)
            .await
            .map_err(|_| Error::Timeout(format!("opening push stream after {:?}", self.connect_timeout)))?
            .map_err(|e| Error::StreamFailed(format!("opening push stream: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::StreamFailed(format!(
                "push stream rejected with status {}",
                response.status()
            )));
        }

        debug!(instance_id = %instance_id, "Push stream opened");

        let frames = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let items: Vec<Result<RelayFrame>> = match chunk {
                    Ok(bytes) => decoder
                        .feed(&bytes)
                        .iter()
                        .filter_map(|data| parse_frame(data))
                        .map(Ok)
                        .collect(),
                    Err(e) => vec![Err(Error::StreamFailed(format!("reading push stream: {e}")))],
                };
                futures::future::ready(Some(items))
            })
            .flat_map(futures::stream::iter)
            .boxed();

        Ok(frames)
    }
}
