use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::client::http_client;
use crate::config::{HttpTimeouts, RelayConfig, RelayKeys};
use crate::models::{ChatMessage, ChatRequest, ChatRole, ImageResponse, VideoRequest};
use crate::router::{error_response, RouterState};

/// Upstream providers and their keys, used by the `/functions/*` routes.
pub struct RelayState {
  pub config: RelayConfig,
  pub keys: RelayKeys,
  http: reqwest::Client,
  request_timeout: Duration,
}

impl RelayState {
  pub fn new(config: RelayConfig, keys: RelayKeys, timeouts: HttpTimeouts) -> anyhow::Result<Self> {
    Ok(Self {
      config,
      keys,
      http: http_client(&timeouts)?,
      request_timeout: timeouts.request,
    })
  }
}

#[derive(serde::Serialize)]
struct UpstreamChatRequest {
  model: String,
  messages: Vec<ChatMessage>,
  stream: bool,
}

#[derive(serde::Serialize)]
struct UpstreamImageRequest<'a> {
  model: &'a str,
  prompt: &'a str,
  n: u32,
  size: &'a str,
}

#[derive(serde::Serialize)]
struct PredictionInput<'a> {
  prompt: &'a str,
  num_frames: u32,
  guidance_scale: f64,
}

#[derive(serde::Serialize)]
struct CreatePrediction<'a> {
  version: &'a str,
  input: PredictionInput<'a>,
}

pub async fn generate_website(
  State(state): State<Arc<RouterState>>,
  Json(req): Json<ChatRequest>,
) -> Response {
  if req.messages.is_empty() {
    return error_response(StatusCode::BAD_REQUEST, "messages_missing", "Missing required field: messages");
  }

  let result = if req.generate_image {
    generate_image(&state.relay, &req.messages).await
  } else {
    stream_chat(&state.relay, req.messages).await
  };
  match result {
    Ok(resp) => resp,
    Err((status, message)) => {
      log::error!("generate-website failed: {message}");
      error_response(status, "upstream_error", &message)
    }
  }
}

pub async fn generate_video(
  State(state): State<Arc<RouterState>>,
  Json(req): Json<VideoRequest>,
) -> Response {
  let relay = &state.relay;
  let prediction_id = req.prediction_id.filter(|id| !id.trim().is_empty());
  let prompt = req.prompt.filter(|p| !p.trim().is_empty());
  if prediction_id.is_none() && prompt.is_none() {
    return error_response(
      StatusCode::BAD_REQUEST,
      "prompt_missing",
      "Missing required field: prompt is required",
    );
  }

  if prediction_id.as_deref().is_some_and(|id| !is_prediction_id(id)) {
    return error_response(StatusCode::BAD_REQUEST, "prediction_id_invalid", "Invalid prediction id");
  }

  let Some(key) = relay.keys.replicate.as_deref() else {
    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "key_missing", "REPLICATE_API_KEY is not set");
  };
  let headers = match bearer_headers(key) {
    Ok(h) => h,
    Err((status, message)) => return error_response(status, "key_invalid", &message),
  };

  let request = if let Some(id) = prediction_id {
    log::info!("checking video status for prediction {id}");
    let url = format!("{}/{}", relay.config.predictions_url.trim_end_matches('/'), id);
    relay.http.get(url).timeout(relay.request_timeout).headers(headers)
  } else {
    let prompt = prompt.unwrap_or_default();
    log::info!("starting video generation");
    let payload = CreatePrediction {
      version: &relay.config.video_version,
      input: PredictionInput {
        prompt: &prompt,
        num_frames: relay.config.video_frames,
        guidance_scale: relay.config.guidance_scale,
      },
    };
    relay
      .http
      .post(&relay.config.predictions_url)
      .timeout(relay.request_timeout)
      .headers(headers)
      .json(&payload)
  };

  match forward_json(request, "Prediction API").await {
    Ok(prediction) => (StatusCode::OK, Json(prediction)).into_response(),
    Err((status, message)) => {
      log::error!("generate-video failed: {message}");
      error_response(status, "upstream_error", &message)
    }
  }
}

async fn stream_chat(relay: &RelayState, messages: Vec<ChatMessage>) -> Result<Response, (StatusCode, String)> {
  let key = relay
    .keys
    .chat
    .as_deref()
    .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "OPENROUTER_API_KEY is not set".to_string()))?;
  let mut headers = bearer_headers(key)?;
  headers.insert("HTTP-Referer", HeaderValue::from_static("http://localhost"));
  headers.insert("X-Title", HeaderValue::from_static("SiteSmith"));

  let payload = UpstreamChatRequest {
    model: relay.config.chat_model.clone(),
    messages: with_system_prompt(&relay.config.system_prompt, messages),
    stream: true,
  };

  let resp = relay
    .http
    .post(&relay.config.chat_completions_url)
    .headers(headers)
    .json(&payload)
    .send()
    .await
    .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;

  if !resp.status().is_success() {
    return Err(upstream_failure(resp, "Chat API").await);
  }

  let body = Body::from_stream(resp.bytes_stream());
  Ok(
    (
      [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
      body,
    )
      .into_response(),
  )
}

async fn generate_image(relay: &RelayState, messages: &[ChatMessage]) -> Result<Response, (StatusCode, String)> {
  let prompt = messages
    .iter()
    .rev()
    .find(|m| m.role == ChatRole::User)
    .map(|m| m.content.as_str())
    .filter(|p| !p.trim().is_empty())
    .ok_or((StatusCode::BAD_REQUEST, "No user prompt to illustrate".to_string()))?;
  let key = relay
    .keys
    .images
    .as_deref()
    .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "OPENAI_API_KEY is not set".to_string()))?;

  let payload = UpstreamImageRequest {
    model: &relay.config.image_model,
    prompt,
    n: 1,
    size: &relay.config.image_size,
  };
  let request = relay
    .http
    .post(&relay.config.images_url)
    .timeout(relay.request_timeout)
    .headers(bearer_headers(key)?)
    .json(&payload);
  let body = forward_json(request, "Image API").await?;

  let image = &body["data"][0];
  let image_url = if let Some(url) = image["url"].as_str() {
    url.to_string()
  } else if let Some(b64) = image["b64_json"].as_str() {
    format!("data:image/png;base64,{b64}")
  } else {
    return Err((StatusCode::BAD_GATEWAY, "Image API returned no image".to_string()));
  };
  Ok((StatusCode::OK, Json(ImageResponse { image_url })).into_response())
}

fn with_system_prompt(system_prompt: &str, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
  let mut result = Vec::with_capacity(messages.len() + 1);
  if !system_prompt.trim().is_empty() {
    result.push(ChatMessage {
      role: ChatRole::System,
      content: system_prompt.to_string(),
    });
  }
  result.extend(messages.into_iter().filter(|m| m.role != ChatRole::System));
  result
}

/// Prediction ids end up as a path segment next to the bearer key.
fn is_prediction_id(id: &str) -> bool {
  !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn bearer_headers(key: &str) -> Result<HeaderMap, (StatusCode, String)> {
  let mut headers = HeaderMap::new();
  headers.insert(
    AUTHORIZATION,
    HeaderValue::from_str(&format!("Bearer {}", key))
      .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?,
  );
  Ok(headers)
}

async fn forward_json(request: reqwest::RequestBuilder, upstream: &str) -> Result<serde_json::Value, (StatusCode, String)> {
  let resp = request
    .send()
    .await
    .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;
  if !resp.status().is_success() {
    return Err(upstream_failure(resp, upstream).await);
  }
  resp
    .json::<serde_json::Value>()
    .await
    .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))
}

/// Rate limits and exhausted credits keep their status so the UI can say so.
async fn upstream_failure(resp: reqwest::Response, upstream: &str) -> (StatusCode, String) {
  let upstream_status = resp.status();
  match upstream_status.as_u16() {
    429 => (
      StatusCode::TOO_MANY_REQUESTS,
      "Rate limit exceeded, please try again later.".to_string(),
    ),
    402 => (
      StatusCode::PAYMENT_REQUIRED,
      "Payment required, please add credits to the provider account.".to_string(),
    ),
    _ => {
      let text = resp
        .text()
        .await
        .unwrap_or_else(|_| format!("{upstream} request failed."));
      (StatusCode::BAD_GATEWAY, format!("{upstream} error ({}): {}", upstream_status, text))
    }
  }
}

#[cfg(test)]
mod tests {
  use wiremock::matchers::{body_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  use super::*;
  use crate::client::spawn_drip_server;
  use crate::config::AppConfig;
  use crate::router::spawn_for_tests;

  fn relay_config(upstream: &MockServer) -> AppConfig {
    let mut config = AppConfig::default();
    config.relay.chat_completions_url = format!("{}/v1/chat/completions", upstream.uri());
    config.relay.images_url = format!("{}/v1/images/generations", upstream.uri());
    config.relay.predictions_url = format!("{}/v1/predictions", upstream.uri());
    config.relay.system_prompt = "Return HTML.".to_string();
    config
  }

  fn keys() -> RelayKeys {
    RelayKeys {
      chat: Some("chat-key".to_string()),
      images: Some("image-key".to_string()),
      replicate: Some("replicate-key".to_string()),
    }
  }

  #[test]
  fn system_prompt_is_prepended_and_client_system_messages_dropped() {
    let messages = vec![
      ChatMessage {
        role: ChatRole::System,
        content: "ignore previous".to_string(),
      },
      ChatMessage {
        role: ChatRole::User,
        content: "hi".to_string(),
      },
    ];
    let result = with_system_prompt("be helpful", messages);
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].role, ChatRole::System);
    assert_eq!(result[0].content, "be helpful");
    assert_eq!(result[1].content, "hi");
  }

  #[tokio::test]
  async fn video_without_prompt_is_rejected() {
    let upstream = MockServer::start().await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    let resp = reqwest::Client::new()
      .post(format!("{base}/functions/generate-video"))
      .json(&serde_json::json!({}))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Missing required field: prompt is required");
  }

  #[tokio::test]
  async fn prediction_id_outside_alphanumerics_is_rejected() {
    let upstream = MockServer::start().await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    for id in ["../../account", "p1/cancel", "p1?x=1"] {
      let resp = reqwest::Client::new()
        .post(format!("{base}/functions/generate-video"))
        .json(&serde_json::json!({ "predictionId": id }))
        .send()
        .await
        .unwrap();
      assert_eq!(resp.status().as_u16(), 400, "id {id}");
    }
    assert!(upstream.received_requests().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn video_submit_creates_prediction_with_configured_model() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/predictions"))
      .and(header("authorization", "Bearer replicate-key"))
      .and(body_json(serde_json::json!({
        "version": "animagine-xl-3.1",
        "input": { "prompt": "a cat surfing", "num_frames": 25, "guidance_scale": 7.5 }
      })))
      .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "id": "p1", "status": "starting" })))
      .mount(&upstream)
      .await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    let resp = reqwest::Client::new()
      .post(format!("{base}/functions/generate-video"))
      .json(&serde_json::json!({ "prompt": "a cat surfing" }))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "p1");
  }

  #[tokio::test]
  async fn video_status_fetches_prediction() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/v1/predictions/p1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "id": "p1",
        "status": "succeeded",
        "output": ["https://x/video.mp4"]
      })))
      .mount(&upstream)
      .await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    let body: serde_json::Value = reqwest::Client::new()
      .post(format!("{base}/functions/generate-video"))
      .json(&serde_json::json!({ "predictionId": "p1" }))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
    assert_eq!(body["output"][0], "https://x/video.mp4");
  }

  #[tokio::test]
  async fn missing_replicate_key_is_a_server_error() {
    let upstream = MockServer::start().await;
    let keys = RelayKeys {
      replicate: None,
      ..keys()
    };
    let base = spawn_for_tests(relay_config(&upstream), keys).await;

    let resp = reqwest::Client::new()
      .post(format!("{base}/functions/generate-video"))
      .json(&serde_json::json!({ "prompt": "x" }))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.status().as_u16(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "REPLICATE_API_KEY is not set");
  }

  #[tokio::test]
  async fn chat_stream_is_passed_through() {
    let upstream = MockServer::start().await;
    let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .and(header("authorization", "Bearer chat-key"))
      .and(body_json(serde_json::json!({
        "model": "openai/gpt-4o-mini",
        "messages": [
          { "role": "system", "content": "Return HTML." },
          { "role": "user", "content": "a page" }
        ],
        "stream": true
      })))
      .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
      .mount(&upstream)
      .await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    let resp = reqwest::Client::new()
      .post(format!("{base}/functions/generate-website"))
      .json(&serde_json::json!({ "messages": [{ "role": "user", "content": "a page" }] }))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.text().await.unwrap(), sse);
  }

  #[tokio::test]
  async fn slow_chat_stream_outlives_request_timeout() {
    let chunks: Vec<String> = (0..5)
      .map(|i| format!("data: {}\n\n", serde_json::json!({ "choices": [{ "delta": { "content": format!("part{i} ") } }] })))
      .chain(std::iter::once("data: [DONE]\n\n".to_string()))
      .collect();
    let upstream = spawn_drip_server(chunks.clone(), Duration::from_millis(400)).await;
    let mut config = AppConfig::default();
    config.relay.chat_completions_url = format!("{upstream}/v1/chat/completions");
    config.client.request_timeout_secs = 1;
    config.client.stream_idle_timeout_secs = 5;
    let base = spawn_for_tests(config, keys()).await;

    let resp = reqwest::Client::new()
      .post(format!("{base}/functions/generate-website"))
      .json(&serde_json::json!({ "messages": [{ "role": "user", "content": "a page" }] }))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), chunks.concat());
  }

  #[tokio::test]
  async fn chat_rate_limit_keeps_status() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .respond_with(ResponseTemplate::new(429))
      .mount(&upstream)
      .await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    let resp = reqwest::Client::new()
      .post(format!("{base}/functions/generate-website"))
      .json(&serde_json::json!({ "messages": [{ "role": "user", "content": "a page" }] }))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.status().as_u16(), 429);
  }

  #[tokio::test]
  async fn image_generation_returns_url_or_data_url() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/images/generations"))
      .and(body_json(serde_json::json!({
        "model": "dall-e-3",
        "prompt": "a lighthouse",
        "n": 1,
        "size": "1024x1024"
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [{ "b64_json": "AAAA" }] })))
      .mount(&upstream)
      .await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    let body: serde_json::Value = reqwest::Client::new()
      .post(format!("{base}/functions/generate-website"))
      .json(&serde_json::json!({
        "messages": [
          { "role": "user", "content": "a page" },
          { "role": "assistant", "content": "ok" },
          { "role": "user", "content": "a lighthouse" }
        ],
        "generateImage": true
      }))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
    assert_eq!(body["imageUrl"], "data:image/png;base64,AAAA");
  }

  #[tokio::test]
  async fn empty_messages_are_rejected() {
    let upstream = MockServer::start().await;
    let base = spawn_for_tests(relay_config(&upstream), keys()).await;

    let resp = reqwest::Client::new()
      .post(format!("{base}/functions/generate-website"))
      .json(&serde_json::json!({ "messages": [] }))
      .send()
      .await
      .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
  }
}
