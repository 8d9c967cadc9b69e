//! Chat command dispatch.
//!
//! One [`ChatParticipant::handle`] call is one chat turn: classify the
//! command, gather dependency context when the command needs it, compose the
//! messages, and relay the model's streamed answer into a [`ResponseStream`].

use std::fmt;
use std::io::BufRead;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::constants::{PYPROJECT_FILE, REQUIREMENTS_FILE};
use crate::error::{handle_error, Disposition, Result, SnkrError};
use crate::llm_interaction::{select_model, ChatModel, ModelProvider, ModelSelector};
use crate::manifest::{load_dependencies, DependencyListing, Workspace};
use crate::prompt::{
    default_messages, list_messages, poetry_messages, render_prompt, MessageSequence, PoetryPrompt,
    PromptSizing,
};
use crate::response::ResponseStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatCommand {
    #[default]
    Default,
    Poetry,
    PoetryPrompt,
    List,
}

impl ChatCommand {
    /// Name used on the command line and in `/command` prefixes; empty for the default.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatCommand::Default => "",
            ChatCommand::Poetry => "poetry",
            ChatCommand::PoetryPrompt => "poetryprompt",
            ChatCommand::List => "list",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "poetry" => Some(ChatCommand::Poetry),
            "poetryprompt" => Some(ChatCommand::PoetryPrompt),
            "list" => Some(ChatCommand::List),
            _ => None,
        }
    }

    fn needs_manifest(&self) -> bool {
        !matches!(self, ChatCommand::Default)
    }

    fn progress_message(&self) -> String {
        let file = match self {
            ChatCommand::List => REQUIREMENTS_FILE,
            _ => PYPROJECT_FILE,
        };
        format!("Looking for your {} file...", file)
    }
}

impl fmt::Display for ChatCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatRequest {
    pub command: ChatCommand,
    pub prompt: String,
}

impl ChatRequest {
    pub fn new(command: ChatCommand, prompt: impl Into<String>) -> Self {
        Self {
            command,
            prompt: prompt.into(),
        }
    }

    /// Parse chat input, honouring a leading `/command`.
    ///
    /// Unknown slash words are left in the prompt of a default request.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix('/') {
            let (name, prompt) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if let Some(command) = ChatCommand::from_name(name) {
                return Self::new(command, prompt.trim());
            }
        }
        Self::new(ChatCommand::Default, input)
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOutcome {
    /// The response stream ran to completion (or was cancelled).
    Completed,
    /// No model matched the selector; nothing was written.
    NoModel,
    /// The model refused the prompt as off-topic and the apology was written.
    Declined,
    /// The model failed; details were logged and nothing was written.
    Swallowed,
}

impl From<Disposition> for ChatOutcome {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Declined => ChatOutcome::Declined,
            Disposition::Swallowed => ChatOutcome::Swallowed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResultMetadata {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResult {
    pub metadata: ChatResultMetadata,
    pub outcome: ChatOutcome,
}

impl ChatResult {
    fn new(command: ChatCommand, outcome: ChatOutcome) -> Self {
        Self {
            metadata: ChatResultMetadata {
                command: command.as_str().to_string(),
            },
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Followup {
    pub prompt: String,
    pub label: String,
    pub command: String,
}

/// Suggestions offered after a turn; `None` when the turn failed with an error.
///
/// Listing dependencies is offered after every turn, failed or not.
pub fn provide_followups(_result: Option<&ChatResult>) -> Vec<Followup> {
    vec![Followup {
        prompt: String::new(),
        label: "List Dependencies".to_string(),
        command: ChatCommand::List.as_str().to_string(),
    }]
}

/// Dispatches chat turns against a workspace and a model provider.
pub struct ChatParticipant {
    workspace: Workspace,
    provider: Arc<dyn ModelProvider>,
    selector: ModelSelector,
}

impl ChatParticipant {
    pub fn new(workspace: Workspace, provider: Arc<dyn ModelProvider>, selector: ModelSelector) -> Self {
        Self {
            workspace,
            provider,
            selector,
        }
    }

    /// Handle one chat turn.
    ///
    /// Manifest errors are returned before any model call. Capability errors
    /// from the model are resolved by [`handle_error`] and the turn still
    /// reports its command; any other error is returned.
    pub async fn handle(
        &self,
        request: &ChatRequest,
        stream: &mut dyn ResponseStream,
        cancel: CancellationToken,
    ) -> Result<ChatResult> {
        let span = info_span!("chat_turn", command = %request.command);
        self.dispatch(request, stream, cancel).instrument(span).await
    }

    async fn dispatch(
        &self,
        request: &ChatRequest,
        stream: &mut dyn ResponseStream,
        cancel: CancellationToken,
    ) -> Result<ChatResult> {
        let command = request.command;
        info!("Handling chat request");

        let dependencies = if command.needs_manifest() {
            stream.progress(&command.progress_message());
            Some(load_dependencies(&self.workspace)?)
        } else {
            None
        };

        let outcome = match self.respond(request, dependencies, stream, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => handle_error(err, stream)?.into(),
        };

        if outcome == ChatOutcome::NoModel {
            warn!(vendor = %self.selector.vendor, family = %self.selector.family, "No chat model available");
        }
        Ok(ChatResult::new(command, outcome))
    }

    async fn respond(
        &self,
        request: &ChatRequest,
        dependencies: Option<DependencyListing>,
        stream: &mut dyn ResponseStream,
        cancel: CancellationToken,
    ) -> Result<ChatOutcome> {
        let selected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Turn cancelled during model selection");
                return Ok(ChatOutcome::Completed);
            }
            selected = select_model(self.provider.as_ref(), &self.selector) => selected?,
        };
        let Some(model) = selected else {
            return Ok(ChatOutcome::NoModel);
        };

        let dependencies = dependencies.unwrap_or_default();
        let messages = compose_messages(request, &dependencies, model.as_ref())?;
        relay(model.as_ref(), messages, stream, cancel).await?;
        Ok(ChatOutcome::Completed)
    }
}

fn compose_messages(
    request: &ChatRequest,
    dependencies: &DependencyListing,
    model: &dyn ChatModel,
) -> Result<MessageSequence> {
    match request.command {
        ChatCommand::Poetry => Ok(poetry_messages(dependencies, &request.prompt)),
        ChatCommand::PoetryPrompt => render_prompt(
            &PoetryPrompt {
                user_query: &request.prompt,
                dependency_list: dependencies,
            },
            PromptSizing {
                model_max_prompt_tokens: model.max_input_tokens(),
            },
        ),
        ChatCommand::List => Ok(list_messages(dependencies)),
        ChatCommand::Default => Ok(default_messages(&request.prompt)),
    }
}

/// Forward every fragment to the sink as it arrives.
async fn relay(
    model: &dyn ChatModel,
    messages: MessageSequence,
    stream: &mut dyn ResponseStream,
    cancel: CancellationToken,
) -> Result<()> {
    let mut fragments = model.send_request(messages, cancel).await?;
    let mut count = 0usize;
    while let Some(fragment) = fragments.next().await {
        stream.markdown(&fragment?);
        count += 1;
    }
    info!(model = model.id(), family = model.family(), fragments = count, "Response stream finished");
    Ok(())
}

/// Read chat input line by line until EOF or `exit`, handling each line as its own turn.
///
/// Each turn runs under a token from `begin_turn`, which is cancelled once the
/// turn is over.
pub async fn run_chat<R, F, S>(
    participant: &ChatParticipant,
    input: R,
    mut begin_turn: impl FnMut() -> CancellationToken,
    mut make_stream: F,
    mut on_turn: impl FnMut(&mut S, &Result<ChatResult>),
) -> Result<()>
where
    R: BufRead,
    F: FnMut() -> S,
    S: ResponseStream,
{
    info!("Starting chat session...");
    for line in input.lines() {
        let line = line.map_err(|source| SnkrError::Io {
            path: "<stdin>".into(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        let request = ChatRequest::parse(line);
        let mut stream = make_stream();
        let cancel = begin_turn();
        let result = participant.handle(&request, &mut stream, cancel.clone()).await;
        cancel.cancel();
        on_turn(&mut stream, &result);
    }
    info!("Chat session finished.");
    Ok(())
}
