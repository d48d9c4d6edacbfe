use encoding_rs::{Decoder, UTF_8};

use crate::extract::extract_html;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// What one line of the event stream turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
  /// Blank line, `:` keepalive, or a field we do not use.
  Ignored,
  /// `data: [DONE]`.
  Done,
  /// A `data:` payload that is not valid JSON.
  Malformed,
  Payload(serde_json::Value),
}

pub fn classify_line(line: &str) -> LineKind {
  if line.is_empty() || line.starts_with(':') {
    return LineKind::Ignored;
  }
  let Some(data) = line.strip_prefix(DATA_PREFIX) else {
    return LineKind::Ignored;
  };
  let data = data.trim();
  if data == DONE_SENTINEL {
    return LineKind::Done;
  }
  match serde_json::from_str::<serde_json::Value>(data) {
    Ok(value) => LineKind::Payload(value),
    Err(err) => {
      log::warn!("skipping malformed stream record: {err}");
      LineKind::Malformed
    }
  }
}

/// `choices[0].delta.content`, when present and non-empty.
pub fn delta_content(value: &serde_json::Value) -> Option<&str> {
  value["choices"][0]["delta"]["content"]
    .as_str()
    .filter(|delta| !delta.is_empty())
}

/// Turns raw chunks of a chat completion stream into content deltas.
///
/// Chunk boundaries may fall anywhere, including inside a UTF-8 sequence or
/// in the middle of a line; both are carried over to the next `push`.
pub struct EventStreamDecoder {
  decoder: Decoder,
  buffer: String,
  done: bool,
}

impl Default for EventStreamDecoder {
  fn default() -> Self {
    Self::new()
  }
}

impl EventStreamDecoder {
  pub fn new() -> Self {
    Self {
      decoder: UTF_8.new_decoder(),
      buffer: String::new(),
      done: false,
    }
  }

  pub fn is_done(&self) -> bool {
    self.done
  }

  /// Decodes `chunk` and returns the deltas of every line it completed.
  pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
    if self.done {
      return Vec::new();
    }
    self.decode(chunk, false);
    self.drain_lines()
  }

  /// Flushes the decoder at end of stream. A trailing line without a
  /// terminator is processed as if it had one.
  pub fn finish(&mut self) -> Vec<String> {
    if self.done {
      return Vec::new();
    }
    self.decode(&[], true);
    let mut deltas = self.drain_lines();
    if !self.done && !self.buffer.is_empty() {
      let line = std::mem::take(&mut self.buffer);
      self.handle_line(line.strip_suffix('\r').unwrap_or(&line), &mut deltas);
    }
    self.done = true;
    deltas
  }

  fn decode(&mut self, bytes: &[u8], last: bool) {
    let needed = self
      .decoder
      .max_utf8_buffer_length(bytes.len())
      .unwrap_or(bytes.len() * 3 + 4);
    self.buffer.reserve(needed);
    let (_, _, replaced) = self.decoder.decode_to_string(bytes, &mut self.buffer, last);
    if replaced {
      log::warn!("stream contained invalid UTF-8; replaced with U+FFFD");
    }
  }

  fn drain_lines(&mut self) -> Vec<String> {
    let mut deltas = Vec::new();
    let mut consumed = 0;
    while !self.done {
      let Some(newline) = self.buffer[consumed..].find('\n') else {
        break;
      };
      let end = consumed + newline;
      let line = &self.buffer[consumed..end];
      let line = line.strip_suffix('\r').unwrap_or(line).to_string();
      consumed = end + 1;
      self.handle_line(&line, &mut deltas);
    }
    if self.done {
      self.buffer.clear();
    } else {
      self.buffer.drain(..consumed);
    }
    deltas
  }

  fn handle_line(&mut self, line: &str, deltas: &mut Vec<String>) {
    match classify_line(line) {
      LineKind::Done => self.done = true,
      LineKind::Payload(value) => {
        if let Some(delta) = delta_content(&value) {
          deltas.push(delta.to_string());
        }
      }
      LineKind::Ignored | LineKind::Malformed => {}
    }
  }
}

/// What one fed chunk changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedOutcome {
  pub reply_grew: bool,
  pub document_updated: bool,
}

/// Accumulates the assistant reply and tracks the latest complete document.
#[derive(Default)]
pub struct ChatStreamConsumer {
  decoder: EventStreamDecoder,
  reply: String,
  document: Option<String>,
}

impl ChatStreamConsumer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
    let deltas = self.decoder.push(chunk);
    self.apply(deltas)
  }

  pub fn finish(&mut self) -> FeedOutcome {
    let deltas = self.decoder.finish();
    self.apply(deltas)
  }

  pub fn is_done(&self) -> bool {
    self.decoder.is_done()
  }

  pub fn reply(&self) -> &str {
    &self.reply
  }

  pub fn document(&self) -> Option<&str> {
    self.document.as_deref()
  }

  fn apply(&mut self, deltas: Vec<String>) -> FeedOutcome {
    let mut outcome = FeedOutcome::default();
    for delta in deltas {
      self.reply.push_str(&delta);
      outcome.reply_grew = true;
      if let Some(html) = extract_html(&self.reply) {
        if self.document.as_deref() != Some(html) {
          self.document = Some(html.to_string());
          outcome.document_updated = true;
        }
      }
    }
    outcome
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(content: &str) -> String {
    let payload = serde_json::json!({ "choices": [{ "delta": { "content": content } }] });
    format!("data: {payload}\n\n")
  }

  fn run_chunks(chunks: &[&[u8]]) -> ChatStreamConsumer {
    let mut consumer = ChatStreamConsumer::new();
    for chunk in chunks {
      consumer.feed(chunk);
    }
    consumer.finish();
    consumer
  }

  #[test]
  fn classify_ignores_comments_and_unknown_fields() {
    assert_eq!(classify_line(""), LineKind::Ignored);
    assert_eq!(classify_line(": keepalive"), LineKind::Ignored);
    assert_eq!(classify_line("event: delta"), LineKind::Ignored);
    assert_eq!(classify_line("data:no-space"), LineKind::Ignored);
  }

  #[test]
  fn classify_recognizes_done_without_parsing() {
    assert_eq!(classify_line("data: [DONE]"), LineKind::Done);
    assert_eq!(classify_line("data:  [DONE]  "), LineKind::Done);
  }

  #[test]
  fn classify_flags_malformed_json() {
    assert_eq!(classify_line("data: {not json"), LineKind::Malformed);
  }

  #[test]
  fn delta_content_skips_empty_and_missing() {
    let empty = serde_json::json!({ "choices": [{ "delta": { "content": "" } }] });
    let role_only = serde_json::json!({ "choices": [{ "delta": { "role": "assistant" } }] });
    let text = serde_json::json!({ "choices": [{ "delta": { "content": "hi" } }] });
    assert_eq!(delta_content(&empty), None);
    assert_eq!(delta_content(&role_only), None);
    assert_eq!(delta_content(&text), Some("hi"));
  }

  #[test]
  fn accumulates_deltas_across_records() {
    let body = format!("{}{}data: [DONE]\n\n", record("Hello, "), record("world"));
    let consumer = run_chunks(&[body.as_bytes()]);
    assert_eq!(consumer.reply(), "Hello, world");
    assert!(consumer.is_done());
  }

  #[test]
  fn split_multibyte_character_and_line_survive_chunking() {
    let body = format!("{}{}data: [DONE]\n\n", record("caf\u{e9} \u{1f680}"), record(" ok"));
    let bytes = body.as_bytes();
    let rocket = body.find('\u{1f680}').unwrap();
    let second_data = body.rfind("data: {").unwrap();

    let whole = run_chunks(&[bytes]);
    let split = run_chunks(&[
      &bytes[..rocket + 2],
      &bytes[rocket + 2..second_data + 3],
      &bytes[second_data + 3..],
    ]);
    assert_eq!(whole.reply(), "caf\u{e9} \u{1f680} ok");
    assert_eq!(split.reply(), whole.reply());
  }

  #[test]
  fn byte_at_a_time_matches_single_chunk() {
    let body = format!("{}: ping\r\n{}data: [DONE]\r\n", record("\u{4f60}\u{597d}"), record("!"));
    let chunks: Vec<&[u8]> = body.as_bytes().chunks(1).collect();
    let consumer = run_chunks(&chunks);
    assert_eq!(consumer.reply(), "\u{4f60}\u{597d}!");
  }

  #[test]
  fn done_stops_processing_of_later_lines() {
    let body = format!("{}data: [DONE]\n\n{}", record("kept"), record("dropped"));
    let consumer = run_chunks(&[body.as_bytes()]);
    assert_eq!(consumer.reply(), "kept");
  }

  #[test]
  fn malformed_record_is_skipped() {
    let body = format!("{}data: {{not json\n\n{}", record("a"), record("b"));
    let consumer = run_chunks(&[body.as_bytes()]);
    assert_eq!(consumer.reply(), "ab");
  }

  #[test]
  fn trailing_line_without_newline_is_processed_at_finish() {
    let body = format!("{}data: {}", record("a"), serde_json::json!({ "choices": [{ "delta": { "content": "b" } }] }));
    let mut consumer = ChatStreamConsumer::new();
    consumer.feed(body.as_bytes());
    assert_eq!(consumer.reply(), "a");
    consumer.finish();
    assert_eq!(consumer.reply(), "ab");
  }

  #[test]
  fn extracts_document_from_streamed_fence() {
    let body = format!(
      "{}data: [DONE]\n\n",
      record("Hello ```html\n<!DOCTYPE html><html></html>\n```")
    );
    let mut consumer = ChatStreamConsumer::new();
    let outcome = consumer.feed(body.as_bytes());
    assert!(outcome.reply_grew);
    assert!(outcome.document_updated);
    assert_eq!(consumer.reply(), "Hello ```html\n<!DOCTYPE html><html></html>\n```");
    assert_eq!(consumer.document(), Some("<!DOCTYPE html><html></html>"));
  }

  #[test]
  fn partial_document_never_replaces_a_complete_one() {
    let mut consumer = ChatStreamConsumer::new();
    consumer.feed(record("<!DOCTYPE html><html>v1</html> now v2: ").as_bytes());
    assert_eq!(consumer.document(), Some("<!DOCTYPE html><html>v1</html>"));

    let outcome = consumer.feed(record("```html\n<!DOCTYPE html><html>v2").as_bytes());
    assert!(!outcome.document_updated);
    assert_eq!(consumer.document(), Some("<!DOCTYPE html><html>v1</html>"));

    let outcome = consumer.feed(record("</html>\n```").as_bytes());
    assert!(outcome.document_updated);
    assert_eq!(consumer.document(), Some("<!DOCTYPE html><html>v2</html>"));
  }
}
