// Runtime settings loaded from the environment (or a .env file via dotenvy).

use std::env;

/// Manifest probed first; also named in progress notices.
pub const PYPROJECT_FILE: &str = "pyproject.toml";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Separator placed between rendered `name: version` entries.
pub const LISTING_SEPARATOR: &str = ", \n";

/// Rough characters-per-token ratio used for prompt budgeting.
pub const CHARS_PER_TOKEN: usize = 4;
/// Framing overhead (role, delimiters) charged per message.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

lazy_static::lazy_static! {
    pub static ref OLLAMA_URL: String = env::var("OLLAMA_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());
    pub static ref SNKR_MODEL_VENDOR: String = env::var("SNKR_MODEL_VENDOR").unwrap_or_else(|_| "ollama".to_string());
    pub static ref SNKR_CHAT_MODEL: String = env::var("SNKR_CHAT_MODEL").unwrap_or_else(|_| "llama3.2".to_string());
    pub static ref SNKR_MAX_INPUT_TOKENS: usize = env::var("SNKR_MAX_INPUT_TOKENS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4096);
}
