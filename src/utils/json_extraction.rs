//! Locating a JSON document inside free-form model output.
//!
//! Planner responses arrive as prose: sometimes a bare object, sometimes an
//! object wrapped in a markdown fence, sometimes an object preceded by a
//! sentence of explanation. [`extract_json_object`] tries, in order:
//!
//! 1. the whole trimmed response, if it is already a JSON object
//! 2. the body of the first ```` ```json ```` fence
//! 3. the body of the first untagged fence
//! 4. the first balanced `{ ... }` span found by scanning
//!
//! A response that opens an object but never closes it is reported as
//! [`JsonExtractionError::Truncated`] so callers can tell "the model stopped
//! early" apart from "the model answered in prose".
//!
//! ```
//! use research_orchestrator::utils::json_extraction::extract_json_object;
//!
//! let raw = "Here is the plan:\n```json\n{\"tasks\": []}\n```";
//! assert_eq!(extract_json_object(raw).unwrap(), "{\"tasks\": []}");
//! ```

use thiserror::Error;

const PREVIEW_CHARS: usize = 80;

/// Error type for JSON extraction failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces, {unclosed_brackets} unclosed brackets. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Brace/bracket balance of a scanned span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonBalance {
    /// `{` without a matching `}`.
    pub unclosed_braces: usize,
    /// `[` without a matching `]`.
    pub unclosed_brackets: usize,
    /// The scan ended inside a string literal.
    pub in_string: bool,
}

impl JsonBalance {
    /// Whether the scanned text closed everything it opened.
    pub fn is_balanced(&self) -> bool {
        self.unclosed_braces == 0 && self.unclosed_brackets == 0 && !self.in_string
    }
}

/// Scan `s` and report how many structures remain open at the end.
///
/// String literals (with escapes) are skipped, so braces inside strings do
/// not count.
pub fn analyze_balance(s: &str) -> JsonBalance {
    let mut braces: isize = 0;
    let mut brackets: isize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => braces += 1,
            '}' if !in_string => braces -= 1,
            '[' if !in_string => brackets += 1,
            ']' if !in_string => brackets -= 1,
            _ => {}
        }
    }

    JsonBalance {
        unclosed_braces: braces.max(0) as usize,
        unclosed_brackets: brackets.max(0) as usize,
        in_string,
    }
}

/// Byte offset of the `}` closing the object that starts at offset 0 of `s`.
///
/// Returns `None` if `s` does not start with `{` or the object never closes.
pub fn find_object_end(s: &str) -> Option<usize> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Body of the first fenced block whose info string is `tag`.
///
/// An empty `tag` matches an untagged fence only.
pub fn fenced_block<'a>(content: &'a str, tag: &str) -> Option<&'a str> {
    let mut rest = content;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let line_end = after.find('\n')?;
        let info = after[..line_end].trim();
        let body = &after[line_end + 1..];
        let close = body.find("```")?;
        if info.eq_ignore_ascii_case(tag) {
            return Some(body[..close].trim());
        }
        rest = &body[close + 3..];
    }
    None
}

fn balanced_object(candidate: &str) -> Option<&str> {
    let start = candidate.find('{')?;
    let tail = &candidate[start..];
    find_object_end(tail).map(|end| &tail[..=end])
}

fn preview(s: &str) -> String {
    s.trim().chars().take(PREVIEW_CHARS).collect()
}

/// Extract the first complete JSON object from a model response.
///
/// The returned slice is a syntactically balanced object. It has not been
/// parsed, so schema errors surface when the caller deserializes it.
///
/// # Errors
///
/// * [`JsonExtractionError::Truncated`] if an object is opened but never closed
/// * [`JsonExtractionError::NotFound`] if no object is present at all
pub fn extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') && find_object_end(trimmed) == Some(trimmed.len() - 1) {
        return Ok(trimmed.to_string());
    }

    for tag in ["json", ""] {
        if let Some(body) = fenced_block(trimmed, tag) {
            if let Some(object) = balanced_object(body) {
                return Ok(object.to_string());
            }
        }
    }

    if let Some(object) = balanced_object(trimmed) {
        return Ok(object.to_string());
    }

    if let Some(start) = trimmed.find('{') {
        let partial = &trimmed[start..];
        let balance = analyze_balance(partial);
        if !balance.is_balanced() {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(partial),
                unclosed_braces: balance.unclosed_braces,
                unclosed_brackets: balance.unclosed_brackets,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed),
    })
}
