const FENCE: &str = "```";
const FENCE_HTML: &str = "```html";
const DOCTYPE: &str = "<!DOCTYPE html>";
const HTML_CLOSE: &str = "</html>";

/// Pulls a complete HTML document out of free-form assistant text.
///
/// A fenced block tagged exactly `html` wins over a raw
/// `<!DOCTYPE html>...</html>` span. Returns `None` while neither is
/// complete, which is the normal state mid-stream.
pub fn extract_html(text: &str) -> Option<&str> {
  fenced_html(text).or_else(|| doctype_span(text))
}

fn fenced_html(text: &str) -> Option<&str> {
  let mut from = 0;
  while let Some(pos) = text[from..].find(FENCE_HTML) {
    let tag_end = from + pos + FENCE_HTML.len();
    from = tag_end;

    let rest = &text[tag_end..];
    let body_start = if rest.starts_with('\n') {
      tag_end + 1
    } else if rest.starts_with("\r\n") {
      tag_end + 2
    } else {
      // `html5`, `htmlx`, or a tag whose line break has not streamed in yet.
      continue;
    };

    let close = text[body_start..].find(FENCE)?;
    let inner = &text[body_start..body_start + close];
    let inner = inner
      .strip_suffix("\r\n")
      .or_else(|| inner.strip_suffix('\n'))
      .unwrap_or(inner);
    if !inner.trim().is_empty() {
      return Some(inner);
    }
  }
  None
}

fn doctype_span(text: &str) -> Option<&str> {
  let start = text.find(DOCTYPE)?;
  let close = text[start..].find(HTML_CLOSE)?;
  Some(&text[start..start + close + HTML_CLOSE.len()])
}
