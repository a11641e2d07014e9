//! Scripted generator and registry helpers for agent tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kestrel_core::{
    Content, ContentGenerator, FunctionCall, GenerateContentRequest, GenerateContentResponse,
    Part, ProviderError, ResponseStream, Tool,
};
use kestrel_tools::{ToolContext, ToolRegistry};
use serde_json::Value;
use tokio::sync::mpsc;

/// Replies with pre-recorded batches, one per request. Each part of a
/// batch arrives as its own stream chunk. Once the script runs out it
/// answers "done".
pub struct Scripted {
    replies: Mutex<VecDeque<Result<Vec<Part>, ProviderError>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerateContentRequest>>,
}

impl Scripted {
    pub fn new(batches: Vec<Vec<Part>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(batches.into_iter().map(Ok).collect()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// A stream that fails with `error` on its first chunk.
    pub fn failing(error: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::from([Err(error)])),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerateContentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentGenerator for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_content(
        &self,
        _request: GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ProviderError> {
        Err(ProviderError::NotImplemented("scripted generator only streams".into()))
    }

    async fn generate_content_stream(
        &self,
        request: GenerateContentRequest,
    ) -> Result<ResponseStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![text_part("done")]));

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            match reply {
                Ok(parts) => {
                    for part in parts {
                        let chunk = GenerateContentResponse::from_content(Content::model(vec![part]));
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        Ok(rx)
    }
}

pub fn text_part(text: &str) -> Part {
    Part::text(text)
}

pub fn call_part(id: Option<&str>, name: &str, args: Value) -> Part {
    Part::function_call(FunctionCall {
        id: id.map(str::to_string),
        name: name.to_string(),
        args,
    })
}

pub fn registry_with(tools: Vec<Arc<dyn Tool>>) -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new(Arc::new(ToolContext::new(std::env::temp_dir())));
    for tool in tools {
        registry.register_tool(tool);
    }
    Arc::new(registry)
}
