use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::constants; // For OLLAMA_URL, SNKR_CHAT_MODEL and friends
use crate::error::{Result, SnkrError};
use crate::prompt::{ChatMessage, MessageSequence};

/// Text fragments of one model response, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Which model to ask for: a (vendor, family) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelector {
    pub vendor: String,
    pub family: String,
}

impl ModelSelector {
    pub fn new(vendor: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            family: family.into(),
        }
    }
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(
            constants::SNKR_MODEL_VENDOR.clone(),
            constants::SNKR_CHAT_MODEL.clone(),
        )
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn id(&self) -> &str;

    /// Family the model belongs to: its id up to the first `:`.
    fn family(&self) -> &str {
        model_family(self.id())
    }

    /// Prompt budget in tokens.
    fn max_input_tokens(&self) -> usize;

    /// Start a streaming completion.
    ///
    /// Cancelling `cancel` before the response arrives yields an empty stream;
    /// cancelling later ends the stream early.
    async fn send_request(
        &self,
        messages: MessageSequence,
        cancel: CancellationToken,
    ) -> Result<FragmentStream>;
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Models matching `selector`; an empty list is not an error.
    async fn select_chat_models(&self, selector: &ModelSelector) -> Result<Vec<Arc<dyn ChatModel>>>;
}

/// First model matching `selector`, if any.
pub async fn select_model(
    provider: &dyn ModelProvider,
    selector: &ModelSelector,
) -> Result<Option<Arc<dyn ChatModel>>> {
    Ok(provider.select_chat_models(selector).await?.into_iter().next())
}

// Structures matching Ollama's /api/tags and /api/chat endpoints
#[derive(Deserialize, Debug)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelInfo>,
}

#[derive(Deserialize, Debug)]
struct OllamaModelInfo {
    name: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug)]
struct OllamaErrorBody {
    error: String,
}

/// Model provider backed by an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    max_input_tokens: usize,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_input_tokens: *constants::SNKR_MAX_INPUT_TOKENS,
        }
    }

    pub fn from_env() -> Self {
        Self::new(constants::OLLAMA_URL.clone())
    }

    pub fn with_max_input_tokens(mut self, max_input_tokens: usize) -> Self {
        self.max_input_tokens = max_input_tokens;
        self
    }
}

/// `llama3.2:latest` belongs to family `llama3.2`.
fn model_family(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn select_chat_models(&self, selector: &ModelSelector) -> Result<Vec<Arc<dyn ChatModel>>> {
        if selector.vendor != "ollama" {
            warn!(vendor = %selector.vendor, "Unsupported model vendor");
            return Ok(Vec::new());
        }

        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let tags: OllamaTagsResponse = response.json().await?;
        let models: Vec<Arc<dyn ChatModel>> = tags
            .models
            .into_iter()
            .filter(|m| m.name == selector.family || model_family(&m.name) == selector.family)
            .map(|m| {
                Arc::new(OllamaChatModel {
                    client: self.client.clone(),
                    base_url: self.base_url.clone(),
                    name: m.name,
                    max_input_tokens: self.max_input_tokens,
                }) as Arc<dyn ChatModel>
            })
            .collect();

        debug!(family = %selector.family, matches = models.len(), "Selected chat models");
        Ok(models)
    }
}

/// A single model served by Ollama.
#[derive(Debug, Clone)]
pub struct OllamaChatModel {
    client: Client,
    base_url: String,
    name: String,
    max_input_tokens: usize,
}

#[async_trait]
impl ChatModel for OllamaChatModel {
    fn id(&self) -> &str {
        &self.name
    }

    fn max_input_tokens(&self) -> usize {
        self.max_input_tokens
    }

    #[instrument(skip(self, messages, cancel), fields(model = %self.name, turns = messages.len()))]
    async fn send_request(
        &self,
        messages: MessageSequence,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let url = format!("{}/api/chat", self.base_url);
        let payload = OllamaChatRequest {
            model: &self.name,
            messages: messages.messages(),
            stream: true,
        };

        info!("Sending chat request to Ollama");
        let request = self.client.post(&url).json(&payload).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Chat request cancelled before Ollama responded");
                return Ok(stream::empty::<Result<String>>().boxed());
            }
            response = request => response?,
        };
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let fragments = decode_chat_stream(response.bytes_stream());
        Ok(fragments.take_until(cancel.cancelled_owned()).boxed())
    }
}

/// Turn a non-2xx Ollama response into a capability error carrying the server's message.
async fn status_error(response: reqwest::Response) -> SnkrError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    let cause = serde_json::from_str::<OllamaErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    error!(%status, %cause, "Ollama API request failed");
    SnkrError::ModelCapability {
        message: format!("Ollama API request failed with status {}", status),
        code: format!("http_{}", status.as_u16()),
        cause: Some(cause),
    }
}

enum Decoded {
    Fragment(String),
    Done(String),
    Skip,
}

fn decode_line(line: &[u8]) -> Result<Decoded> {
    let text = String::from_utf8_lossy(line);
    if let Cow::Owned(_) = text {
        warn!("Replaced invalid UTF-8 in Ollama stream line");
    }
    let line = text.trim();
    if line.is_empty() {
        return Ok(Decoded::Skip);
    }

    let chunk: OllamaChatChunk = serde_json::from_str(line)?;
    if let Some(cause) = chunk.error {
        return Err(SnkrError::ModelCapability {
            message: "Ollama reported an error while streaming".to_string(),
            code: "stream_error".to_string(),
            cause: Some(cause),
        });
    }

    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    if chunk.done {
        Ok(Decoded::Done(text))
    } else if text.is_empty() {
        Ok(Decoded::Skip)
    } else {
        Ok(Decoded::Fragment(text))
    }
}

struct ChatStreamState<S> {
    body: S,
    buffer: Vec<u8>,
    eof: bool,
    finished: bool,
}

/// Decode Ollama's newline-delimited JSON into text fragments.
///
/// Lines may be split across network chunks, so bytes are buffered until a
/// newline arrives. The stream ends after a `done` line, an error, or EOF.
fn decode_chat_stream<S, B>(body: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = ChatStreamState {
        body,
        buffer: Vec::new(),
        eof: false,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match decode_line(&line) {
                    Ok(Decoded::Skip) => continue,
                    Ok(Decoded::Fragment(text)) => return Some((Ok(text), state)),
                    Ok(Decoded::Done(text)) => {
                        state.finished = true;
                        if text.is_empty() {
                            return None;
                        }
                        return Some((Ok(text), state));
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            if state.eof {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    error!("Stream error: {}", e);
                    state.finished = true;
                    return Some((Err(SnkrError::Http(e)), state));
                }
                None => {
                    // Flush a final line that had no trailing newline.
                    state.eof = true;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
            }
        }
    })
}
