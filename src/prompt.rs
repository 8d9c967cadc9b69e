//! Message assembly for each chat command.
//!
//! The inline builders produce fixed turn lists. [`PoetryPrompt`] renders the
//! same structure through minijinja templates and then fits it into the
//! model's input budget, shrinking the lowest-priority turns first.

use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{CHARS_PER_TOKEN, MESSAGE_OVERHEAD_TOKENS};
use crate::error::Result;
use crate::manifest::DependencyListing;

pub const POETRY_INSTRUCTIONS: &str = "The following is a list of dependencies and their versions. \
When replying with code, use the versions of the dependency libraries found in the list. \
At the beginning of the response show the full list of dependencies and their versions. \
At the end of the response show the list of dependencies you utilized and their versions. \
If you require a different version of a dependency because of an incompatibility please specify the version you require. ";

pub const LIST_INSTRUCTIONS: &str = "Below is a list of dependencies and their versions from a poetry file. \
Return the list to me using the format \"dependency\": \"version\".";

pub const QUOTE_INSTRUCTIONS: &str =
    "Provide a random Michael Jordan quote and how it relates to computer science concepts. ";

const POETRY_INSTRUCTIONS_TEMPLATE: &str = "The following is a list of dependencies and their versions.
When replying with code, use the versions of the dependency libraries found in the list.
At the beginning of the response show the full list of dependencies and their versions.
At the end of the response, outside of any code block, show the list of dependencies you utilized and their versions using the format \"dependency: version\".";

const INSTRUCTIONS_PRIORITY: u32 = 80;
const DEPENDENCIES_PRIORITY: u32 = 50;
const QUERY_PRIORITY: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Ordered turns sent to the model for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSequence(Vec<ChatMessage>);

impl MessageSequence {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self(messages)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.0
            .iter()
            .map(|m| MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&m.content))
            .sum()
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// `poetry`: instructions, dependency listing, query.
pub fn poetry_messages(dependencies: &DependencyListing, query: &str) -> MessageSequence {
    MessageSequence::new(vec![
        ChatMessage::user(POETRY_INSTRUCTIONS),
        ChatMessage::user(dependencies.as_str()),
        ChatMessage::user(query),
    ])
}

/// `list`: instructions and dependency listing, no query.
pub fn list_messages(dependencies: &DependencyListing) -> MessageSequence {
    MessageSequence::new(vec![
        ChatMessage::user(LIST_INSTRUCTIONS),
        ChatMessage::user(dependencies.as_str()),
    ])
}

/// No command: the quote instruction followed by the query.
pub fn default_messages(query: &str) -> MessageSequence {
    MessageSequence::new(vec![
        ChatMessage::user(QUOTE_INSTRUCTIONS),
        ChatMessage::user(query),
    ])
}

/// Limits a rendered prompt has to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptSizing {
    pub model_max_prompt_tokens: usize,
}

/// A rendered turn before budgeting. Higher priority survives longer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptElement {
    pub role: Role,
    pub priority: u32,
    pub content: String,
}

/// A reusable prompt made of templated turns.
pub trait PromptTemplate {
    fn render(&self, env: &Environment<'_>) -> Result<Vec<PromptElement>>;
}

/// Templated form of the `poetry` prompt.
#[derive(Debug, Clone, Copy)]
pub struct PoetryPrompt<'a> {
    pub user_query: &'a str,
    pub dependency_list: &'a DependencyListing,
}

impl PromptTemplate for PoetryPrompt<'_> {
    fn render(&self, env: &Environment<'_>) -> Result<Vec<PromptElement>> {
        let ctx = context! {
            user_query => self.user_query,
            dependency_list => self.dependency_list.as_str(),
        };
        let turn = |name: &str, priority: u32| -> Result<PromptElement> {
            let content = env.get_template(name)?.render(&ctx)?;
            Ok(PromptElement {
                role: Role::User,
                priority,
                content,
            })
        };
        Ok(vec![
            turn("poetry/instructions", INSTRUCTIONS_PRIORITY)?,
            turn("poetry/dependencies", DEPENDENCIES_PRIORITY)?,
            turn("poetry/query", QUERY_PRIORITY)?,
        ])
    }
}

pub fn create_prompt_env() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("poetry/instructions", POETRY_INSTRUCTIONS_TEMPLATE)?;
    env.add_template("poetry/dependencies", "{{ dependency_list }}")?;
    env.add_template("poetry/query", "{{ user_query }}")?;
    Ok(env)
}

/// Render `template` and shrink it until it fits `sizing`.
pub fn render_prompt(template: &impl PromptTemplate, sizing: PromptSizing) -> Result<MessageSequence> {
    let env = create_prompt_env()?;
    let elements = template.render(&env)?;
    let fitted = fit_to_budget(elements, sizing.model_max_prompt_tokens);
    Ok(MessageSequence::new(
        fitted
            .into_iter()
            .map(|e| ChatMessage {
                role: e.role,
                content: e.content,
            })
            .collect(),
    ))
}

/// Cut the lowest-priority turn from its end until the total fits; drop turns
/// that cannot keep any content. Relative order is preserved.
fn fit_to_budget(mut elements: Vec<PromptElement>, max_tokens: usize) -> Vec<PromptElement> {
    let cost = |e: &PromptElement| MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&e.content);
    let mut total: usize = elements.iter().map(cost).sum();

    while total > max_tokens {
        let Some(idx) = elements
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.priority)
            .map(|(i, _)| i)
        else {
            break;
        };

        let excess = total - max_tokens;
        let tokens = estimate_tokens(&elements[idx].content);
        if tokens <= excess {
            let removed = elements.remove(idx);
            debug!(priority = removed.priority, "Dropped prompt turn over budget");
            total -= MESSAGE_OVERHEAD_TOKENS + tokens;
        } else {
            let keep_chars = (tokens - excess) * CHARS_PER_TOKEN;
            let element = &mut elements[idx];
            element.content = element.content.chars().take(keep_chars).collect();
            debug!(priority = element.priority, keep_chars, "Truncated prompt turn");
            total = elements.iter().map(cost).sum();
        }
    }

    elements
}
