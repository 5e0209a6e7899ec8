//! Where progress frames come from

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tracing::debug;
use url::Url;

use switchboard_core::{Error, Result};

use crate::frame::{FrameDecoder, ProgressFrame};

/// Frames of one open progress connection. The stream ending means the
/// connection is gone.
pub type FrameStream = BoxStream<'static, Result<ProgressFrame>>;

/// Opens per-task progress connections
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn open(&self, task_id: &str) -> Result<FrameStream>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streams `GET {base_url}/tasks/{task_id}/progress` over HTTP
pub struct HttpProgressSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpProgressSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid progress base url '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "progress base url '{}' cannot carry a path",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    /// The progress endpoint of a task
    pub fn task_url(&self, task_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["tasks", task_id, "progress"]);
        }
        url
    }
}

#[async_trait]
impl ProgressSource for HttpProgressSource {
    async fn open(&self, task_id: &str) -> Result<FrameStream> {
        let url = self.task_url(task_id);
        debug!("Opening progress stream at {}", url);

        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?
            .error_for_status()
            .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;

        // The decoder is flushed once the body ends cleanly
        let body = response.bytes_stream().boxed();
        let frames = stream::unfold(
            (body, Some(FrameDecoder::new())),
            |(mut body, decoder)| async move {
                let Some(mut decoder) = decoder else {
                    return None;
                };
                match body.next().await {
                    Some(Ok(bytes)) => {
                        let frames = decoder.push_bytes(&bytes);
                        Some((frames, (body, Some(decoder))))
                    }
                    Some(Err(e)) => {
                        let failed = Err(Error::Connection(format!("progress body failed: {}", e)));
                        Some((vec![failed], (body, None)))
                    }
                    None => Some((decoder.finish(), (body, None))),
                }
            },
        )
        .flat_map(stream::iter);
        Ok(frames.boxed())
    }
}
