use bevy::log::info;

use crate::image::ImageConfig;
use crate::protocol::FramingMode;

/// environment variable holding the bearer credential.
pub const CREDENTIAL_VAR: &str = "API_KEY";

/// endpoint + credential configuration shared by the stream client and the
/// image path. the credential is resolved once, when the config is built.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub chat_url: String,
    pub model: String,
    /// bearer token; empty means requests go out unauthenticated.
    pub credential: String,
    pub framing: FramingMode,
    pub image: ImageConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            chat_url: "https://gen.pollinations.ai/v1/chat/completions".to_string(),
            model: "gemini-flash".to_string(),
            credential: String::new(),
            framing: FramingMode::default(),
            image: ImageConfig::default(),
        }
    }
}

impl ChatConfig {
    /// defaults plus the credential from the environment (empty if absent).
    pub fn from_env() -> Self {
        let credential = read_credential();
        info!(target: "bevy_chat_stream", "ChatConfig::from_env: credential_present={}", !credential.is_empty());
        Self { credential, ..Default::default() }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_chat_url(mut self, url: impl Into<String>) -> Self {
        self.chat_url = url.into();
        self
    }
}

/// resolve the credential through `lookup`; empty when the variable is unset.
fn credential_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup(CREDENTIAL_VAR).unwrap_or_default()
}

#[cfg(not(target_arch = "wasm32"))]
fn read_credential() -> String {
    credential_from(|name| std::env::var(name).ok())
}

// browsers have no process environment; take it from the build environment.
#[cfg(target_arch = "wasm32")]
fn read_credential() -> String {
    credential_from(|_| option_env!("API_KEY").map(str::to_string))
}
