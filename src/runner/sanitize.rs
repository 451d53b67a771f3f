use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Placeholder for every path inside the worker
pub const SANDBOX_PLACEHOLDER: &str = "<sandbox>";

static FILE_LINE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r#"File "(/[^"]*)""#).ok());

/// Rewrite host paths out of a worker traceback or message
pub fn sanitize_text(text: &str, scratch: Option<&Path>) -> String {
    let replacement = format!("File \"{}\"", SANDBOX_PLACEHOLDER);
    let mut cleaned = match FILE_LINE.as_ref() {
        Some(re) => re.replace_all(text, replacement.as_str()).into_owned(),
        None => text.to_string(),
    };

    if let Some(scratch) = scratch.and_then(|p| p.to_str()) {
        if !scratch.is_empty() {
            cleaned = cleaned.replace(scratch, SANDBOX_PLACEHOLDER);
        }
    }

    cleaned
}
