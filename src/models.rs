use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  User,
  Assistant,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Role::User => "user",
      Role::Assistant => "assistant",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "user" => Some(Role::User),
      "assistant" => Some(Role::Assistant),
      _ => None,
    }
  }
}

/// Roles on the chat wire. `System` is only ever added by the relay.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
  System,
  User,
  Assistant,
}

impl From<Role> for ChatRole {
  fn from(role: Role) -> Self {
    match role {
      Role::User => ChatRole::User,
      Role::Assistant => ChatRole::Assistant,
    }
  }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
  Image,
  Video,
}

impl MediaType {
  pub fn as_str(&self) -> &'static str {
    match self {
      MediaType::Image => "image",
      MediaType::Video => "video",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "image" => Some(MediaType::Image),
      "video" => Some(MediaType::Video),
      _ => None,
    }
  }
}

/// One entry of the conversation as the UI shows it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
  pub role: Role,
  pub content: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub media_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub media_type: Option<MediaType>,
}

impl Message {
  pub fn user(content: impl Into<String>) -> Self {
    Self {
      role: Role::User,
      content: content.into(),
      media_url: None,
      media_type: None,
    }
  }

  pub fn assistant(content: impl Into<String>) -> Self {
    Self {
      role: Role::Assistant,
      content: content.into(),
      media_url: None,
      media_type: None,
    }
  }

  pub fn with_media(mut self, url: impl Into<String>, media_type: MediaType) -> Self {
    self.media_url = Some(url.into());
    self.media_type = Some(media_type);
    self
  }
}

/// The `{role, content}` pair sent to the chat and image endpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
  pub role: ChatRole,
  pub content: String,
}

impl From<&Message> for ChatMessage {
  fn from(message: &Message) -> Self {
    Self {
      role: message.role.into(),
      content: message.content.clone(),
    }
  }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatRequest {
  pub messages: Vec<ChatMessage>,
  #[serde(rename = "generateImage", default, skip_serializing_if = "std::ops::Not::not")]
  pub generate_image: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImageResponse {
  #[serde(rename = "imageUrl")]
  pub image_url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VideoRequest {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prompt: Option<String>,
  #[serde(rename = "predictionId", default, skip_serializing_if = "Option::is_none")]
  pub prediction_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Starting,
  Pending,
  Processing,
  Succeeded,
  Failed,
  Canceled,
}

impl JobStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled)
  }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum PredictionOutput {
  Many(Vec<String>),
  One(String),
}

impl PredictionOutput {
  pub fn first(&self) -> Option<&str> {
    match self {
      PredictionOutput::Many(urls) => urls.first().map(String::as_str),
      PredictionOutput::One(url) => Some(url.as_str()),
    }
  }
}

/// Status record of a video generation job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Prediction {
  pub id: String,
  pub status: JobStatus,
  #[serde(default)]
  pub output: Option<PredictionOutput>,
  #[serde(default)]
  pub error: Option<serde_json::Value>,
}

impl Prediction {
  pub fn output_url(&self) -> Option<&str> {
    self.output.as_ref().and_then(PredictionOutput::first)
  }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
  pub id: String,
  pub user_id: String,
  pub title: String,
  pub created_at: String,
  pub updated_at: String,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
  pub error: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_omits_absent_media() {
    let json = serde_json::to_value(Message::user("hi")).unwrap();
    assert_eq!(json, serde_json::json!({ "role": "user", "content": "hi" }));
  }

  #[test]
  fn message_serializes_media_fields() {
    let msg = Message::assistant("done").with_media("https://x/v.mp4", MediaType::Video);
    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(json["media_url"], "https://x/v.mp4");
    assert_eq!(json["media_type"], "video");
  }

  #[test]
  fn stored_roles_exclude_system() {
    assert_eq!(Role::parse("system"), None);
    assert!(serde_json::from_str::<Message>(r#"{"role":"system","content":"x"}"#).is_err());
    let wire = ChatMessage::from(&Message::assistant("ok"));
    assert_eq!(wire.role, ChatRole::Assistant);
  }

  #[test]
  fn chat_request_flags_image_generation_only_when_set() {
    let req = ChatRequest {
      messages: vec![],
      generate_image: false,
    };
    let json = serde_json::to_value(&req).unwrap();
    assert!(json.get("generateImage").is_none());

    let req = ChatRequest {
      messages: vec![],
      generate_image: true,
    };
    let json = serde_json::to_value(&req).unwrap();
    assert_eq!(json["generateImage"], true);
  }

  #[test]
  fn prediction_accepts_array_or_string_output() {
    let many: Prediction = serde_json::from_str(
      r#"{"id":"abc","status":"succeeded","output":["https://x/a.mp4","https://x/b.mp4"]}"#,
    )
    .unwrap();
    assert_eq!(many.output_url(), Some("https://x/a.mp4"));

    let one: Prediction =
      serde_json::from_str(r#"{"id":"abc","status":"succeeded","output":"https://x/a.mp4"}"#).unwrap();
    assert_eq!(one.output_url(), Some("https://x/a.mp4"));

    let pending: Prediction = serde_json::from_str(r#"{"id":"abc","status":"starting","output":null}"#).unwrap();
    assert_eq!(pending.output_url(), None);
    assert!(!pending.status.is_terminal());
  }
}
