//! conversation turns as the ui layer stores them, and their wire projection.

use serde::{Deserialize, Serialize};

/// who authored a turn; serialized lowercase on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// opaque, session-local turn identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

/// one message in the conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    /// milliseconds since the unix epoch.
    pub created_at: u64,
    pub is_streaming: bool,
    pub image_url: Option<String>,
}

impl Turn {
    pub fn new(id: TurnId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            created_at: now_millis(),
            is_streaming: false,
            image_url: None,
        }
    }

    /// empty assistant turn that fragments will be appended to.
    pub fn streaming_placeholder(id: TurnId) -> Self {
        Self {
            is_streaming: true,
            ..Self::new(id, Role::Assistant, String::new())
        }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn as_wire(&self) -> WireMessage<'_> {
        WireMessage { role: self.role, content: &self.content }
    }
}

/// the `{role, content}` pair sent to the completion endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WireMessage<'a> {
    pub role: Role,
    pub content: &'a str,
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(target_arch = "wasm32")]
pub(crate) fn now_millis() -> u64 {
    js_sys::Date::now() as u64
}
