//! Connection options builder
//!
//! `ConnectionOptions` is cheap to clone and never mutated in place: every
//! `with_*` call returns a new value, so options handed to one session cannot
//! leak changes into another.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Agent-level overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOverrides {
    pub first_message: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
}

impl AgentOverrides {
    pub fn first_message(mut self, message: impl Into<String>) -> Self {
        self.first_message = Some(message.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Fields set in `other` win
    fn merged(&self, other: &AgentOverrides) -> Self {
        Self {
            first_message: other.first_message.clone().or_else(|| self.first_message.clone()),
            language: other.language.clone().or_else(|| self.language.clone()),
            prompt: other.prompt.clone().or_else(|| self.prompt.clone()),
        }
    }
}

/// Language model overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmOverrides {
    pub temperature: Option<f32>,
    pub prompt: Option<String>,
    pub max_tokens: Option<u32>,
}

impl LlmOverrides {
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn merged(&self, other: &LlmOverrides) -> Self {
        Self {
            temperature: other.temperature.or(self.temperature),
            prompt: other.prompt.clone().or_else(|| self.prompt.clone()),
            max_tokens: other.max_tokens.or(self.max_tokens),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Inner {
    voice_id: Option<String>,
    agent: AgentOverrides,
    llm: LlmOverrides,
}

/// Initialization bundle for a connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionOptions {
    inner: Arc<Inner>,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_voice(&self, voice_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.inner).voice_id = Some(voice_id.into());
        next
    }

    pub fn with_agent(&self, agent: AgentOverrides) -> Self {
        let mut next = self.clone();
        let inner = Arc::make_mut(&mut next.inner);
        inner.agent = inner.agent.merged(&agent);
        next
    }

    pub fn with_llm(&self, llm: LlmOverrides) -> Self {
        let mut next = self.clone();
        let inner = Arc::make_mut(&mut next.inner);
        inner.llm = inner.llm.merged(&llm);
        next
    }

    pub fn voice_id(&self) -> Option<&str> {
        self.inner.voice_id.as_deref()
    }

    pub fn agent(&self) -> &AgentOverrides {
        &self.inner.agent
    }

    pub fn llm(&self) -> &LlmOverrides {
        &self.inner.llm
    }

    /// Payload of the `initClientData` frame. Only set fields are emitted.
    pub fn to_overrides(&self) -> Value {
        let mut config = Map::new();

        let agent = &self.inner.agent;
        let mut agent_json = Map::new();
        if let Some(first_message) = &agent.first_message {
            agent_json.insert("first_message".into(), json!(first_message));
        }
        if let Some(language) = &agent.language {
            agent_json.insert("language".into(), json!(language));
        }
        if let Some(prompt) = &agent.prompt {
            agent_json.insert("prompt".into(), json!({ "prompt": prompt }));
        }
        if !agent_json.is_empty() {
            config.insert("agent".into(), Value::Object(agent_json));
        }

        if let Some(voice_id) = &self.inner.voice_id {
            config.insert("tts".into(), json!({ "voice_id": voice_id }));
        }

        let mut root = Map::new();
        root.insert("conversation_config_override".into(), Value::Object(config));

        let llm = &self.inner.llm;
        let mut llm_json = Map::new();
        if let Some(temperature) = llm.temperature {
            llm_json.insert("temperature".into(), json!(temperature));
        }
        if let Some(prompt) = &llm.prompt {
            llm_json.insert("prompt".into(), json!(prompt));
        }
        if let Some(max_tokens) = llm.max_tokens {
            llm_json.insert("max_tokens".into(), json!(max_tokens));
        }
        if !llm_json.is_empty() {
            root.insert("custom_llm_extra_body".into(), Value::Object(llm_json));
        }

        Value::Object(root)
    }
}
