use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};

use crate::client::{ClientError, GenerationClient};
use crate::config::{AppConfig, RelayKeys};
use crate::poller::PollError;
use crate::relay::{self, RelayState};
use crate::session::{Backends, Session, SessionError, SessionEvent, SessionSnapshot};
use crate::storage::{ConversationStore, StoreError};

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct RouterState {
  pub started_at: Instant,
  pub backends: Backends,
  pub relay: RelayState,
  pub session_idle: Duration,
  sessions: RwLock<HashMap<String, SessionEntry>>,
}

#[derive(Clone)]
struct SessionEntry {
  session: Arc<Mutex<Session>>,
  events: broadcast::Sender<SessionEvent>,
  /// Latest document, readable while the session is locked by an operation.
  document: Arc<StdRwLock<Option<String>>>,
  last_used: Arc<StdMutex<Instant>>,
}

impl SessionEntry {
  fn touch(&self) {
    if let Ok(mut last_used) = self.last_used.lock() {
      *last_used = Instant::now();
    }
  }

  fn idle_for(&self) -> Duration {
    self.last_used.lock().map(|t| t.elapsed()).unwrap_or_default()
  }

  /// Running an operation, or watched by an event feed. The document
  /// tracker always holds one receiver.
  fn in_use(&self) -> bool {
    self.session.try_lock().is_err() || self.events.receiver_count() > 1
  }
}

impl RouterState {
  pub fn new(config: &AppConfig, keys: RelayKeys, store: Arc<dyn ConversationStore>) -> anyhow::Result<Self> {
    let client = GenerationClient::new(&config.client)?;
    let relay = RelayState::new(config.relay.clone(), keys, config.client.timeouts())?;
    Ok(Self {
      started_at: Instant::now(),
      backends: Backends {
        client,
        store,
        poll: config.client.poll_settings(),
      },
      relay,
      session_idle: Duration::from_secs(config.session_idle_timeout_secs),
      sessions: RwLock::new(HashMap::new()),
    })
  }

  pub async fn insert_session(&self, user_id: Option<String>) -> SessionSnapshot {
    let session = Session::new(user_id);
    let id = session.id().to_string();
    let snapshot = session.snapshot();
    let events = session.event_sender();
    let document = Arc::new(StdRwLock::new(None));
    track_document(events.subscribe(), document.clone());

    let entry = SessionEntry {
      session: Arc::new(Mutex::new(session)),
      events,
      document,
      last_used: Arc::new(StdMutex::new(Instant::now())),
    };
    self.sessions.write().await.insert(id.clone(), entry);
    log::info!("session {id} created");
    snapshot
  }

  async fn entry(&self, id: &str) -> Result<SessionEntry, Response> {
    let entry = self
      .sessions
      .read()
      .await
      .get(id)
      .cloned()
      .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "session_not_found", "Unknown session."))?;
    entry.touch();
    Ok(entry)
  }

  /// Drops sessions idle for at least `idle` that are not in use.
  pub async fn evict_idle(&self, idle: Duration) -> usize {
    let mut sessions = self.sessions.write().await;
    let before = sessions.len();
    sessions.retain(|id, entry| {
      let keep = entry.in_use() || entry.idle_for() < idle;
      if !keep {
        log::info!("session {id} evicted after {}s idle", entry.idle_for().as_secs());
      }
      keep
    });
    before - sessions.len()
  }
}

async fn sweep_idle_sessions(state: Arc<RouterState>) {
  let idle = state.session_idle;
  let mut ticker = tokio::time::interval(idle.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL));
  loop {
    ticker.tick().await;
    let evicted = state.evict_idle(idle).await;
    if evicted > 0 {
      log::debug!("evicted {evicted} idle sessions");
    }
  }
}

pub fn build_router(state: Arc<RouterState>) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/api/sessions", post(create_session))
    .route("/api/sessions/:id", get(get_session).delete(delete_session))
    .route("/api/sessions/:id/draft", put(set_draft))
    .route("/api/sessions/:id/chat", post(send_chat))
    .route("/api/sessions/:id/image", post(request_image))
    .route("/api/sessions/:id/video", post(request_video))
    .route("/api/sessions/:id/events", get(session_events))
    .route("/api/sessions/:id/preview", get(preview))
    .route(
      "/api/sessions/:id/conversation",
      post(open_conversation).delete(new_conversation),
    )
    .route("/api/conversations", get(list_conversations))
    .route("/api/conversations/:id/messages", get(conversation_messages))
    .route("/functions/generate-website", post(relay::generate_website))
    .route("/functions/generate-video", post(relay::generate_video))
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
    .with_state(state)
}

pub async fn run_router(listener: TcpListener, state: RouterState) -> anyhow::Result<()> {
  let state = Arc::new(state);
  if !state.session_idle.is_zero() {
    tokio::spawn(sweep_idle_sessions(state.clone()));
  }
  let app = build_router(state);
  listener.set_nonblocking(true)?;
  let listener = tokio::net::TcpListener::from_std(listener)?;
  axum::serve(listener, app).await?;
  Ok(())
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
  let body = Json(serde_json::json!({ "error": message, "code": code }));
  (status, body).into_response()
}

fn session_error_response(err: &SessionError) -> Response {
  let (status, code) = match err {
    SessionError::Busy => (StatusCode::CONFLICT, "session_busy"),
    SessionError::EmptyPrompt => (StatusCode::BAD_REQUEST, "prompt_missing"),
    SessionError::EmptyReply => (StatusCode::BAD_GATEWAY, "empty_reply"),
    SessionError::Client(ClientError::Status { .. }) => (StatusCode::BAD_GATEWAY, "upstream_error"),
    SessionError::Client(ClientError::Transport(_)) => (StatusCode::BAD_GATEWAY, "network_error"),
    SessionError::Client(ClientError::Decode(_)) => (StatusCode::BAD_GATEWAY, "upstream_error"),
    SessionError::Poll(PollError::Exhausted { .. }) => (StatusCode::GATEWAY_TIMEOUT, "generation_timeout"),
    SessionError::Poll(PollError::Client(_)) => (StatusCode::BAD_GATEWAY, "network_error"),
    SessionError::Poll(_) => (StatusCode::BAD_GATEWAY, "generation_failed"),
    SessionError::Store(StoreError::ConversationNotFound(_)) => (StatusCode::NOT_FOUND, "conversation_not_found"),
    SessionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
  };
  error_response(status, code, &err.to_string())
}

fn busy_response() -> Response {
  session_error_response(&SessionError::Busy)
}

async fn health(State(state): State<Arc<RouterState>>) -> Json<serde_json::Value> {
  let uptime = state.started_at.elapsed().as_millis();
  Json(serde_json::json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
    "uptime_ms": uptime
  }))
}

#[derive(Deserialize, Default)]
struct CreateSessionRequest {
  #[serde(default)]
  user_id: Option<String>,
}

#[derive(Deserialize)]
struct DraftRequest {
  text: String,
}

#[derive(Deserialize, Default)]
struct OperationRequest {
  #[serde(default)]
  prompt: Option<String>,
}

#[derive(Deserialize)]
struct OpenConversationRequest {
  conversation_id: String,
}

#[derive(Deserialize)]
struct ListConversationsQuery {
  user_id: String,
}

#[derive(Clone, Copy)]
enum Operation {
  Chat,
  Image,
  Video,
}

async fn create_session(
  State(state): State<Arc<RouterState>>,
  Json(req): Json<CreateSessionRequest>,
) -> Response {
  let snapshot = state.insert_session(req.user_id).await;
  (StatusCode::CREATED, Json(snapshot)).into_response()
}

/// Mirrors document changes into `cache` until the session goes away.
fn track_document(mut rx: broadcast::Receiver<SessionEvent>, cache: Arc<StdRwLock<Option<String>>>) {
  tokio::spawn(async move {
    loop {
      let document = match rx.recv().await {
        Ok(SessionEvent::DocumentUpdated { html }) => Some(html),
        Ok(SessionEvent::Reset { document }) => document,
        Ok(_) => continue,
        Err(RecvError::Lagged(skipped)) => {
          log::warn!("document tracker skipped {skipped} events");
          continue;
        }
        Err(RecvError::Closed) => break,
      };
      if let Ok(mut slot) = cache.write() {
        *slot = document;
      }
    }
  });
}

async fn get_session(State(state): State<Arc<RouterState>>, Path(id): Path<String>) -> Response {
  let entry = match state.entry(&id).await {
    Ok(e) => e,
    Err(resp) => return resp,
  };
  let Ok(session) = entry.session.try_lock() else {
    return busy_response();
  };
  Json(session.snapshot()).into_response()
}

async fn delete_session(State(state): State<Arc<RouterState>>, Path(id): Path<String>) -> Response {
  match state.sessions.write().await.remove(&id) {
    Some(_) => StatusCode::NO_CONTENT.into_response(),
    None => error_response(StatusCode::NOT_FOUND, "session_not_found", "Unknown session."),
  }
}

async fn set_draft(
  State(state): State<Arc<RouterState>>,
  Path(id): Path<String>,
  Json(req): Json<DraftRequest>,
) -> Response {
  let entry = match state.entry(&id).await {
    Ok(e) => e,
    Err(resp) => return resp,
  };
  let Ok(mut session) = entry.session.try_lock() else {
    return busy_response();
  };
  session.set_draft(req.text);
  Json(session.snapshot()).into_response()
}

async fn send_chat(
  State(state): State<Arc<RouterState>>,
  Path(id): Path<String>,
  Json(req): Json<OperationRequest>,
) -> Response {
  run_operation(state, &id, req, Operation::Chat).await
}

async fn request_image(
  State(state): State<Arc<RouterState>>,
  Path(id): Path<String>,
  Json(req): Json<OperationRequest>,
) -> Response {
  run_operation(state, &id, req, Operation::Image).await
}

async fn request_video(
  State(state): State<Arc<RouterState>>,
  Path(id): Path<String>,
  Json(req): Json<OperationRequest>,
) -> Response {
  run_operation(state, &id, req, Operation::Video).await
}

/// Runs the operation on its own task, so a client that disconnects
/// mid-stream does not cancel it.
async fn run_operation(state: Arc<RouterState>, id: &str, req: OperationRequest, op: Operation) -> Response {
  let entry = match state.entry(id).await {
    Ok(e) => e,
    Err(resp) => return resp,
  };
  let Ok(mut session) = entry.session.clone().try_lock_owned() else {
    return busy_response();
  };
  if let Some(prompt) = req.prompt {
    session.set_draft(prompt);
  }

  let task = tokio::spawn(async move {
    let result = match op {
      Operation::Chat => session.send_chat(&state.backends).await,
      Operation::Image => session.request_image(&state.backends).await,
      Operation::Video => session.request_video(&state.backends).await,
    };
    result.map(|()| session.snapshot())
  });
  match task.await {
    Ok(Ok(snapshot)) => Json(snapshot).into_response(),
    Ok(Err(err)) => session_error_response(&err),
    Err(err) => {
      log::error!("session {id}: operation task failed: {err}");
      error_response(StatusCode::INTERNAL_SERVER_ERROR, "operation_failed", "Operation aborted.")
    }
  }
}

async fn session_events(State(state): State<Arc<RouterState>>, Path(id): Path<String>) -> Response {
  let entry = match state.entry(&id).await {
    Ok(e) => e,
    Err(resp) => return resp,
  };
  let mut rx = entry.events.subscribe();
  drop(entry);

  let stream = stream! {
    loop {
      match rx.recv().await {
        Ok(event) => match Event::default().event(event.kind()).json_data(&event) {
          Ok(sse) => yield Ok::<Event, std::convert::Infallible>(sse),
          Err(err) => log::warn!("could not encode session event: {err}"),
        },
        Err(RecvError::Lagged(skipped)) => log::warn!("event feed for session {id} skipped {skipped} events"),
        Err(RecvError::Closed) => break,
      }
    }
  };

  Sse::new(stream)
    .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
    .into_response()
}

async fn preview(State(state): State<Arc<RouterState>>, Path(id): Path<String>) -> Response {
  let entry = match state.entry(&id).await {
    Ok(e) => e,
    Err(resp) => return resp,
  };
  let document = entry.document.read().ok().and_then(|slot| slot.clone());
  match document {
    Some(html) => Html(html).into_response(),
    None => error_response(StatusCode::NOT_FOUND, "document_missing", "Nothing generated yet."),
  }
}

async fn open_conversation(
  State(state): State<Arc<RouterState>>,
  Path(id): Path<String>,
  Json(req): Json<OpenConversationRequest>,
) -> Response {
  let entry = match state.entry(&id).await {
    Ok(e) => e,
    Err(resp) => return resp,
  };
  let Ok(mut session) = entry.session.try_lock() else {
    return busy_response();
  };
  match session
    .open_conversation(state.backends.store.as_ref(), &req.conversation_id)
    .await
  {
    Ok(()) => Json(session.snapshot()).into_response(),
    Err(err) => session_error_response(&err),
  }
}

async fn new_conversation(State(state): State<Arc<RouterState>>, Path(id): Path<String>) -> Response {
  let entry = match state.entry(&id).await {
    Ok(e) => e,
    Err(resp) => return resp,
  };
  let Ok(mut session) = entry.session.try_lock() else {
    return busy_response();
  };
  match session.new_conversation() {
    Ok(()) => Json(session.snapshot()).into_response(),
    Err(err) => session_error_response(&err),
  }
}

async fn list_conversations(
  State(state): State<Arc<RouterState>>,
  Query(query): Query<ListConversationsQuery>,
) -> Response {
  match state.backends.store.list_conversations(&query.user_id).await {
    Ok(conversations) => Json(conversations).into_response(),
    Err(err) => session_error_response(&SessionError::Store(err)),
  }
}

async fn conversation_messages(State(state): State<Arc<RouterState>>, Path(id): Path<String>) -> Response {
  match state.backends.store.load_messages(&id).await {
    Ok(messages) => Json(messages).into_response(),
    Err(err) => session_error_response(&SessionError::Store(err)),
  }
}

/// Serves the full router on an ephemeral port and returns its base URL.
#[cfg(test)]
pub(crate) async fn spawn_for_tests(config: AppConfig, keys: RelayKeys) -> String {
  let store = Arc::new(crate::storage::SqliteStore::open_in_memory().expect("in-memory store"));
  spawn_with_store(config, keys, store).await
}

#[cfg(test)]
async fn spawn_with_store(config: AppConfig, keys: RelayKeys, store: Arc<dyn ConversationStore>) -> String {
  let state = RouterState::new(&config, keys, store).expect("router state");
  let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
  let port = listener.local_addr().expect("local addr").port();
  tokio::spawn(async move {
    if let Err(err) = run_router(listener, state).await {
      eprintln!("router error: {err}");
    }
  });
  format!("http://127.0.0.1:{port}")
}
