use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poller::PollSettings;

const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert web developer. Build the website the user describes \
as a single self-contained HTML document with inline CSS and JavaScript. When the user asks for changes, \
return the complete updated document. Always put the document in one ```html fenced code block, starting \
with <!DOCTYPE html>, and keep any explanation short.";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
  pub bind_addr: String,
  /// Sessions untouched this long are dropped. Zero keeps them until DELETE.
  pub session_idle_timeout_secs: u64,
  pub client: ClientConfig,
  pub relay: RelayConfig,
}

/// Where the session sends its requests and how long it waits.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
  pub chat_url: String,
  pub image_url: String,
  pub video_url: String,
  /// Deadline for whole JSON exchanges. Streamed replies are bounded by
  /// `stream_idle_timeout_secs` instead.
  pub request_timeout_secs: u64,
  pub connect_timeout_secs: u64,
  /// Longest silence allowed between two chunks of a response body.
  pub stream_idle_timeout_secs: u64,
  pub poll_interval_ms: u64,
  pub max_poll_attempts: u32,
}

/// Upstream providers behind the relay functions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
  pub chat_completions_url: String,
  pub chat_model: String,
  pub system_prompt: String,
  pub images_url: String,
  pub image_model: String,
  pub image_size: String,
  pub predictions_url: String,
  pub video_version: String,
  pub video_frames: u32,
  pub guidance_scale: f64,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      bind_addr: "127.0.0.1:8787".to_string(),
      session_idle_timeout_secs: 1800,
      client: ClientConfig::default(),
      relay: RelayConfig::default(),
    }
  }
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      chat_url: "http://127.0.0.1:8787/functions/generate-website".to_string(),
      image_url: "http://127.0.0.1:8787/functions/generate-website".to_string(),
      video_url: "http://127.0.0.1:8787/functions/generate-video".to_string(),
      request_timeout_secs: 120,
      connect_timeout_secs: 10,
      stream_idle_timeout_secs: 60,
      poll_interval_ms: 3000,
      max_poll_attempts: 100,
    }
  }
}

/// Timeouts shared by the session client and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
  pub connect: Duration,
  pub idle: Duration,
  pub request: Duration,
}

impl ClientConfig {
  pub fn timeouts(&self) -> HttpTimeouts {
    HttpTimeouts {
      connect: Duration::from_secs(self.connect_timeout_secs),
      idle: Duration::from_secs(self.stream_idle_timeout_secs),
      request: Duration::from_secs(self.request_timeout_secs),
    }
  }

  pub fn poll_settings(&self) -> PollSettings {
    PollSettings {
      interval: Duration::from_millis(self.poll_interval_ms),
      max_attempts: self.max_poll_attempts,
    }
  }
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      chat_completions_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
      chat_model: "openai/gpt-4o-mini".to_string(),
      system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
      images_url: "https://api.openai.com/v1/images/generations".to_string(),
      image_model: "dall-e-3".to_string(),
      image_size: "1024x1024".to_string(),
      predictions_url: "https://api.replicate.com/v1/predictions".to_string(),
      video_version: "animagine-xl-3.1".to_string(),
      video_frames: 25,
      guidance_scale: 7.5,
    }
  }
}

/// Provider keys. Read from the environment only, never written to disk.
#[derive(Clone, Default)]
pub struct RelayKeys {
  pub chat: Option<String>,
  pub images: Option<String>,
  pub replicate: Option<String>,
}

impl RelayKeys {
  pub fn from_env() -> Self {
    let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
    let chat = read("OPENROUTER_API_KEY");
    Self {
      images: read("OPENAI_API_KEY").or_else(|| chat.clone()),
      chat,
      replicate: read("REPLICATE_API_KEY"),
    }
  }
}

pub fn load_or_init(path: &Path) -> anyhow::Result<AppConfig> {
  if path.exists() {
    let data = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&data)?;
    Ok(config)
  } else {
    let config = AppConfig::default();
    save_config(path, &config)?;
    Ok(config)
  }
}

pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(config)?;
  std::fs::write(path, json)?;
  Ok(())
}
