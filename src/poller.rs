use std::time::Duration;

use crate::client::ClientError;
use crate::models::{JobStatus, Prediction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
  pub interval: Duration,
  pub max_attempts: u32,
}

impl Default for PollSettings {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(3),
      max_attempts: 100,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
  #[error("Video generation failed")]
  Failed { detail: Option<String> },
  #[error("Video generation did not finish after {attempts} status checks")]
  Exhausted { attempts: u32 },
  #[error("Video generation succeeded without an output URL")]
  MissingOutput,
  #[error(transparent)]
  Client(#[from] ClientError),
}

/// Anything that can report the current state of a submitted job.
#[async_trait::async_trait]
pub trait JobStatusSource: Send + Sync {
  async fn job_status(&self, prediction_id: &str) -> Result<Prediction, ClientError>;
}

/// Waits for `submitted` to reach a terminal state and returns its first
/// output URL. Each status check is preceded by one `interval` of sleep.
pub async fn wait_for_output(
  source: &dyn JobStatusSource,
  submitted: Prediction,
  settings: PollSettings,
) -> Result<String, PollError> {
  let mut current = submitted;
  let mut attempts = 0;

  while !current.status.is_terminal() {
    if attempts >= settings.max_attempts {
      return Err(PollError::Exhausted { attempts });
    }
    tokio::time::sleep(settings.interval).await;
    attempts += 1;
    current = source.job_status(&current.id).await?;
    log::debug!(
      "prediction {} status {:?} after {} checks",
      current.id,
      current.status,
      attempts
    );
  }

  match current.status {
    JobStatus::Succeeded => current
      .output_url()
      .map(str::to_string)
      .ok_or(PollError::MissingOutput),
    _ => Err(PollError::Failed {
      detail: current.error.as_ref().map(|err| match err {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
      }),
    }),
  }
}
