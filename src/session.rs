use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;

use crate::client::{ClientError, GenerationClient};
use crate::extract::extract_html;
use crate::models::{ChatMessage, MediaType, Message, Role};
use crate::poller::{wait_for_output, PollError, PollSettings};
use crate::storage::{ConversationStore, StoreError};
use crate::stream::{ChatStreamConsumer, FeedOutcome};

const TITLE_CHARS: usize = 50;
const EVENT_CAPACITY: usize = 256;
const VIDEO_PLACEHOLDER: &str = "Generating your video. This can take a minute...";

/// Collaborators a session talks to while running an operation.
pub struct Backends {
  pub client: GenerationClient,
  pub store: Arc<dyn ConversationStore>,
  pub poll: PollSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("A generation is already in progress")]
  Busy,
  #[error("Description required")]
  EmptyPrompt,
  #[error("The model returned an empty reply")]
  EmptyReply,
  #[error(transparent)]
  Client(#[from] ClientError),
  #[error(transparent)]
  Poll(#[from] PollError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Change notifications for anyone rendering the session.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
  MessageAppended { index: usize, message: Message },
  MessageUpdated { index: usize, content: String },
  MessageReplaced { index: usize, message: Message },
  MessageRemoved { index: usize },
  DocumentUpdated { html: String },
  Busy { busy: bool },
  Error { message: String },
  /// The whole message list changed (conversation opened or cleared).
  Reset { document: Option<String> },
}

impl SessionEvent {
  pub fn kind(&self) -> &'static str {
    match self {
      SessionEvent::MessageAppended { .. } => "message_appended",
      SessionEvent::MessageUpdated { .. } => "message_updated",
      SessionEvent::MessageReplaced { .. } => "message_replaced",
      SessionEvent::MessageRemoved { .. } => "message_removed",
      SessionEvent::DocumentUpdated { .. } => "document_updated",
      SessionEvent::Busy { .. } => "busy",
      SessionEvent::Error { .. } => "error",
      SessionEvent::Reset { .. } => "reset",
    }
  }
}

#[derive(Serialize, Clone, Debug)]
pub struct SessionSnapshot {
  pub id: String,
  pub user_id: Option<String>,
  pub conversation_id: Option<String>,
  pub messages: Vec<Message>,
  pub draft: String,
  pub document: Option<String>,
  pub busy: bool,
}

/// One user's conversation state. Operations run one at a time.
pub struct Session {
  id: String,
  user_id: Option<String>,
  conversation_id: Option<String>,
  messages: Vec<Message>,
  draft: String,
  document: Option<String>,
  busy: bool,
  /// Index of the assistant placeholder owned by the running operation.
  pending: Option<usize>,
  events: broadcast::Sender<SessionEvent>,
}

/// Puts the session back to idle if an operation is dropped before it ends.
struct InFlight<'a> {
  session: &'a mut Session,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if self.session.busy {
      self.session.abandon();
    }
  }
}

impl Session {
  pub fn new(user_id: Option<String>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      user_id: user_id.filter(|id| !id.trim().is_empty()),
      conversation_id: None,
      messages: Vec::new(),
      draft: String::new(),
      document: None,
      busy: false,
      pending: None,
      events,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  pub fn document(&self) -> Option<&str> {
    self.document.as_deref()
  }

  pub fn conversation_id(&self) -> Option<&str> {
    self.conversation_id.as_deref()
  }

  pub fn is_busy(&self) -> bool {
    self.busy
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.events.subscribe()
  }

  /// Sender handle, so feeds can subscribe without holding the session.
  pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
    self.events.clone()
  }

  pub fn snapshot(&self) -> SessionSnapshot {
    SessionSnapshot {
      id: self.id.clone(),
      user_id: self.user_id.clone(),
      conversation_id: self.conversation_id.clone(),
      messages: self.messages.clone(),
      draft: self.draft.clone(),
      document: self.document.clone(),
      busy: self.busy,
    }
  }

  pub fn set_draft(&mut self, text: impl Into<String>) {
    self.draft = text.into();
  }

  pub async fn send_chat(&mut self, backends: &Backends) -> Result<(), SessionError> {
    let prompt = self.begin()?;
    let mut turn = InFlight { session: self };
    let result = turn.session.chat_turn(backends, &prompt).await;
    turn.session.end(&result);
    result
  }

  pub async fn request_image(&mut self, backends: &Backends) -> Result<(), SessionError> {
    let prompt = self.begin()?;
    let mut turn = InFlight { session: self };
    let result = turn.session.image_turn(backends, &prompt).await;
    turn.session.end(&result);
    result
  }

  pub async fn request_video(&mut self, backends: &Backends) -> Result<(), SessionError> {
    let prompt = self.begin()?;
    let mut turn = InFlight { session: self };
    let result = turn.session.video_turn(backends, &prompt).await;
    turn.session.end(&result);
    result
  }

  /// Replaces the local state with a persisted conversation.
  pub async fn open_conversation(&mut self, store: &dyn ConversationStore, conversation_id: &str) -> Result<(), SessionError> {
    if self.busy {
      return Err(SessionError::Busy);
    }
    let messages = store.load_messages(conversation_id).await?;
    self.document = messages
      .iter()
      .rev()
      .filter(|m| m.role == Role::Assistant)
      .find_map(|m| extract_html(&m.content))
      .map(str::to_string);
    self.messages = messages;
    self.conversation_id = Some(conversation_id.to_string());
    self.emit(SessionEvent::Reset {
      document: self.document.clone(),
    });
    Ok(())
  }

  pub fn new_conversation(&mut self) -> Result<(), SessionError> {
    if self.busy {
      return Err(SessionError::Busy);
    }
    self.messages.clear();
    self.document = None;
    self.conversation_id = None;
    self.draft.clear();
    self.emit(SessionEvent::Reset { document: None });
    Ok(())
  }

  fn begin(&mut self) -> Result<String, SessionError> {
    if self.busy {
      return Err(SessionError::Busy);
    }
    let prompt = self.draft.trim().to_string();
    if prompt.is_empty() {
      return Err(SessionError::EmptyPrompt);
    }
    self.draft.clear();
    self.busy = true;
    self.emit(SessionEvent::Busy { busy: true });
    Ok(prompt)
  }

  fn end(&mut self, result: &Result<(), SessionError>) {
    if let Err(err) = result {
      log::error!("session {}: {err}", self.id);
      self.emit(SessionEvent::Error {
        message: err.to_string(),
      });
    }
    self.pending = None;
    self.busy = false;
    self.emit(SessionEvent::Busy { busy: false });
  }

  fn abandon(&mut self) {
    log::warn!("session {}: operation dropped before it finished", self.id);
    if let Some(index) = self.pending.take() {
      self.remove(index);
    }
    self.busy = false;
    self.emit(SessionEvent::Busy { busy: false });
  }

  async fn chat_turn(&mut self, backends: &Backends, prompt: &str) -> Result<(), SessionError> {
    self.record_user_message(backends, prompt).await;

    let history: Vec<ChatMessage> = self.messages.iter().map(ChatMessage::from).collect();
    let index = self.push(Message::assistant(""));
    self.pending = Some(index);

    let resp = match backends.client.open_chat_stream(history).await {
      Ok(resp) => resp,
      Err(err) => {
        self.remove(index);
        return Err(err.into());
      }
    };

    let mut consumer = ChatStreamConsumer::new();
    let mut bytes_stream = resp.bytes_stream();
    while let Some(chunk) = bytes_stream.next().await {
      let chunk = match chunk {
        Ok(c) => c,
        Err(err) => {
          self.remove(index);
          return Err(ClientError::from(err).into());
        }
      };
      let outcome = consumer.feed(&chunk);
      self.apply_stream(index, &consumer, outcome);
      if consumer.is_done() {
        break;
      }
    }
    let outcome = consumer.finish();
    self.apply_stream(index, &consumer, outcome);

    if consumer.reply().is_empty() {
      self.remove(index);
      return Err(SessionError::EmptyReply);
    }
    let reply = self.messages[index].clone();
    self.persist(backends, &reply).await;
    Ok(())
  }

  async fn image_turn(&mut self, backends: &Backends, prompt: &str) -> Result<(), SessionError> {
    self.record_user_message(backends, prompt).await;

    let history: Vec<ChatMessage> = self.messages.iter().map(ChatMessage::from).collect();
    let url = backends.client.generate_image(history).await?;

    let reply = Message::assistant(format!("Here's the image I generated for: {prompt}")).with_media(url, MediaType::Image);
    self.push(reply.clone());
    self.persist(backends, &reply).await;
    Ok(())
  }

  async fn video_turn(&mut self, backends: &Backends, prompt: &str) -> Result<(), SessionError> {
    self.record_user_message(backends, prompt).await;

    let submitted = backends.client.submit_video(prompt).await?;
    log::info!("session {}: video prediction {} submitted", self.id, submitted.id);
    let index = self.push(Message::assistant(VIDEO_PLACEHOLDER));
    self.pending = Some(index);

    match wait_for_output(&backends.client, submitted, backends.poll).await {
      Ok(url) => {
        let reply = Message::assistant("Here's your generated video:").with_media(url, MediaType::Video);
        self.replace(index, reply.clone());
        self.persist(backends, &reply).await;
        Ok(())
      }
      Err(err) => {
        self.remove(index);
        Err(err.into())
      }
    }
  }

  async fn record_user_message(&mut self, backends: &Backends, prompt: &str) {
    let message = Message::user(prompt);
    self.push(message.clone());
    self.ensure_conversation(backends.store.as_ref(), prompt).await;
    self.persist(backends, &message).await;
  }

  /// Creates the persisted conversation on the first message of a signed-in user.
  async fn ensure_conversation(&mut self, store: &dyn ConversationStore, prompt: &str) {
    if self.conversation_id.is_some() {
      return;
    }
    let Some(user_id) = self.user_id.as_deref() else {
      return;
    };
    let title: String = prompt.chars().take(TITLE_CHARS).collect();
    match store.create_conversation(user_id, &title).await {
      Ok(conversation) => {
        log::info!("session {}: created conversation {}", self.id, conversation.id);
        self.conversation_id = Some(conversation.id);
      }
      Err(err) => log::warn!("session {}: could not create conversation: {err}", self.id),
    }
  }

  async fn persist(&self, backends: &Backends, message: &Message) {
    let Some(conversation_id) = self.conversation_id.as_deref() else {
      return;
    };
    if let Err(err) = backends.store.save_message(conversation_id, message).await {
      log::warn!("session {}: could not save message: {err}", self.id);
    }
  }

  fn apply_stream(&mut self, index: usize, consumer: &ChatStreamConsumer, outcome: FeedOutcome) {
    if outcome.reply_grew {
      let content = consumer.reply().to_string();
      self.messages[index].content = content.clone();
      self.emit(SessionEvent::MessageUpdated { index, content });
    }
    if outcome.document_updated {
      if let Some(html) = consumer.document() {
        self.document = Some(html.to_string());
        self.emit(SessionEvent::DocumentUpdated { html: html.to_string() });
      }
    }
  }

  fn push(&mut self, message: Message) -> usize {
    let index = self.messages.len();
    self.messages.push(message.clone());
    self.emit(SessionEvent::MessageAppended { index, message });
    index
  }

  fn replace(&mut self, index: usize, message: Message) {
    self.messages[index] = message.clone();
    self.emit(SessionEvent::MessageReplaced { index, message });
  }

  fn remove(&mut self, index: usize) {
    if self.pending == Some(index) {
      self.pending = None;
    }
    if index < self.messages.len() {
      self.messages.remove(index);
      self.emit(SessionEvent::MessageRemoved { index });
    }
  }

  fn emit(&self, event: SessionEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }
}
