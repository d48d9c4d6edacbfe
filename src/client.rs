use std::time::Duration;

use crate::config::{ClientConfig, HttpTimeouts};
use crate::models::{ChatMessage, ChatRequest, ErrorBody, ImageResponse, Prediction, VideoRequest};
use crate::poller::JobStatusSource;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  #[error("network error: {0}")]
  Transport(#[from] reqwest::Error),
  /// Non-2xx answer; `message` is the body's `error` field when it had one.
  #[error("{message}")]
  Status { status: u16, message: String },
  #[error("unexpected response: {0}")]
  Decode(String),
}

/// HTTP client for the chat, image and video endpoints.
#[derive(Debug, Clone)]
pub struct GenerationClient {
  http: reqwest::Client,
  request_timeout: Duration,
  chat_url: String,
  image_url: String,
  video_url: String,
}

impl GenerationClient {
  pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
    let timeouts = config.timeouts();
    Ok(Self {
      http: http_client(&timeouts)?,
      request_timeout: timeouts.request,
      chat_url: config.chat_url.clone(),
      image_url: config.image_url.clone(),
      video_url: config.video_url.clone(),
    })
  }

  /// Starts a streamed chat completion. The caller reads the body chunks;
  /// only the idle timeout applies while it does.
  pub async fn open_chat_stream(&self, messages: Vec<ChatMessage>) -> Result<reqwest::Response, ClientError> {
    let payload = ChatRequest {
      messages,
      generate_image: false,
    };
    let resp = self.http.post(&self.chat_url).json(&payload).send().await?;
    ensure_success(resp).await
  }

  pub async fn generate_image(&self, messages: Vec<ChatMessage>) -> Result<String, ClientError> {
    let payload = ChatRequest {
      messages,
      generate_image: true,
    };
    let resp = self
      .http
      .post(&self.image_url)
      .timeout(self.request_timeout)
      .json(&payload)
      .send()
      .await?;
    let body: ImageResponse = decode_json(ensure_success(resp).await?).await?;
    if body.image_url.trim().is_empty() {
      return Err(ClientError::Decode("imageUrl is empty".to_string()));
    }
    Ok(body.image_url)
  }

  pub async fn submit_video(&self, prompt: &str) -> Result<Prediction, ClientError> {
    let payload = VideoRequest {
      prompt: Some(prompt.to_string()),
      prediction_id: None,
    };
    self.post_video(&payload).await
  }

  pub async fn video_status(&self, prediction_id: &str) -> Result<Prediction, ClientError> {
    let payload = VideoRequest {
      prompt: None,
      prediction_id: Some(prediction_id.to_string()),
    };
    self.post_video(&payload).await
  }

  async fn post_video(&self, payload: &VideoRequest) -> Result<Prediction, ClientError> {
    let resp = self
      .http
      .post(&self.video_url)
      .timeout(self.request_timeout)
      .json(payload)
      .send()
      .await?;
    decode_json(ensure_success(resp).await?).await
  }
}

#[async_trait::async_trait]
impl JobStatusSource for GenerationClient {
  async fn job_status(&self, prediction_id: &str) -> Result<Prediction, ClientError> {
    self.video_status(prediction_id).await
  }
}

/// Client without a total deadline. Connect and per-chunk read timeouts
/// still apply; JSON calls add a per-request `timeout`.
pub fn http_client(timeouts: &HttpTimeouts) -> Result<reqwest::Client, reqwest::Error> {
  reqwest::Client::builder()
    .connect_timeout(timeouts.connect)
    .read_timeout(timeouts.idle)
    .build()
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
  let status = resp.status();
  if status.is_success() {
    return Ok(resp);
  }
  let text = resp.text().await.unwrap_or_default();
  let message = serde_json::from_str::<ErrorBody>(&text)
    .map(|body| body.error)
    .ok()
    .filter(|error| !error.trim().is_empty())
    .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));
  Err(ClientError::Status {
    status: status.as_u16(),
    message,
  })
}

async fn decode_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
  let bytes = resp.bytes().await?;
  serde_json::from_slice(&bytes).map_err(|err| ClientError::Decode(err.to_string()))
}

/// Serves one HTTP response whose body is written as `chunks`, `gap` apart.
#[cfg(test)]
pub(crate) async fn spawn_drip_server(chunks: Vec<String>, gap: Duration) -> String {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
  let addr = listener.local_addr().expect("local addr");
  tokio::spawn(async move {
    let Ok((mut socket, _)) = listener.accept().await else {
      return;
    };
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    while !request_complete(&request) {
      match socket.read(&mut buf).await {
        Ok(0) | Err(_) => return,
        Ok(n) => request.extend_from_slice(&buf[..n]),
      }
    }
    let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
    if socket.write_all(head.as_bytes()).await.is_err() {
      return;
    }
    for chunk in chunks {
      if socket.write_all(chunk.as_bytes()).await.is_err() {
        return;
      }
      let _ = socket.flush().await;
      tokio::time::sleep(gap).await;
    }
    let _ = socket.shutdown().await;
  });
  format!("http://{addr}")
}

#[cfg(test)]
fn request_complete(request: &[u8]) -> bool {
  let text = String::from_utf8_lossy(request);
  let Some(head_end) = text.find("\r\n\r\n") else {
    return false;
  };
  let length = text[..head_end]
    .lines()
    .filter_map(|line| line.split_once(':'))
    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
    .unwrap_or(0);
  request.len() >= head_end + 4 + length
}
