use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_providers::{ClientInfo, Completion, CompletionRequest, GenerationClient, ProviderError};

/// Answers calls from a fixed script, in order.
pub(crate) struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub(crate) fn new(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    fn info(&self) -> ClientInfo {
        ClientInfo {
            provider_id: "scripted".to_string(),
            model_id: "scripted-model".to_string(),
            max_tokens: 4096,
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().expect("requests lock").push(request);
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Envelope("script exhausted".to_string())));
        reply.map(|content| Completion {
            content,
            usage: None,
        })
    }
}

/// Accepts calls and never answers them.
#[derive(Default)]
pub(crate) struct StalledClient {
    pub(crate) calls: AtomicUsize,
}

#[async_trait]
impl GenerationClient for StalledClient {
    fn info(&self) -> ClientInfo {
        ClientInfo {
            provider_id: "stalled".to_string(),
            model_id: "stalled-model".to_string(),
            max_tokens: 4096,
        }
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}
