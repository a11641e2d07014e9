//! HTTP plumbing shared by the generator adapters.

use std::time::Duration;

use futures::StreamExt;
use kestrel_core::{GenerateContentResponse, ProviderError, ResponseStream};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::sse::{Frame, FrameParser};

/// Build a client with the given request timeout.
pub(crate) fn client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

pub(crate) fn network(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Map non-success statuses to provider errors.
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }

    if status == 429 {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        return Err(ProviderError::RateLimited { retry_after_secs });
    }

    let body = response.text().await.unwrap_or_default();
    if status == 401 || status == 403 {
        return Err(ProviderError::AuthenticationFailed(format!(
            "{provider} rejected the credentials: {body}"
        )));
    }
    if status == 404 {
        return Err(ProviderError::ModelNotFound(format!("{provider}: {body}")));
    }

    warn!(provider, status, body = %body, "Provider returned error");
    Err(ProviderError::ApiError {
        status_code: status,
        message: body,
    })
}

/// Turns frames of one wire protocol into partial responses.
pub(crate) trait FrameDecoder: Send + 'static {
    fn decode(&mut self, frame: Frame) -> Result<Vec<GenerateContentResponse>, ProviderError>;

    /// Responses still owed when the body ends.
    fn finish(&mut self) -> Vec<GenerateContentResponse> {
        Vec::new()
    }

    /// True once a terminal frame was seen; remaining bytes are ignored.
    fn is_done(&self) -> bool {
        false
    }
}

/// Drive a response body through a frame parser on a background task.
///
/// Protocol and transport errors are sent as the final item. Dropping the
/// receiver stops the task and closes the connection.
pub(crate) fn spawn_stream<D: FrameDecoder>(
    provider: String,
    response: reqwest::Response,
    mut parser: FrameParser,
    mut decoder: D,
) -> ResponseStream {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                    return;
                }
            };

            let (responses, failure) = match parser.feed(&bytes) {
                Ok(frames) => decode_all(&mut decoder, frames),
                Err(e) => (Vec::new(), Some(e)),
            };
            for r in responses {
                if tx.send(Ok(r)).await.is_err() {
                    trace!(provider = %provider, "Stream receiver dropped");
                    return;
                }
            }
            if let Some(e) = failure {
                warn!(provider = %provider, error = %e, "Aborting stream");
                let _ = tx.send(Err(e)).await;
                return;
            }
            if decoder.is_done() {
                break;
            }
        }

        let (mut responses, failure) = if decoder.is_done() {
            (Vec::new(), None)
        } else {
            match parser.finish() {
                Ok(frame) => decode_all(&mut decoder, frame.into_iter().collect()),
                Err(e) => (Vec::new(), Some(e)),
            }
        };
        if failure.is_none() {
            responses.extend(decoder.finish());
        }
        for r in responses {
            if tx.send(Ok(r)).await.is_err() {
                return;
            }
        }
        if let Some(e) = failure {
            warn!(provider = %provider, error = %e, "Aborting stream");
            let _ = tx.send(Err(e)).await;
        }
    });

    rx
}

/// Decode frames in order, stopping at the first error. Responses decoded
/// before the error are returned with it.
fn decode_all<D: FrameDecoder>(
    decoder: &mut D,
    frames: Vec<Frame>,
) -> (Vec<GenerateContentResponse>, Option<ProviderError>) {
    let mut out = Vec::new();
    for frame in frames {
        if decoder.is_done() {
            break;
        }
        match decoder.decode(frame) {
            Ok(responses) => out.extend(responses),
            Err(e) => return (out, Some(e)),
        }
    }
    (out, None)
}
