//! Shared utility functions.

use serde::de::DeserializeOwned;

/// Extract a JSON object from text that may contain other content.
///
/// Prefers the contents of a ```json fenced block when one is present, then
/// falls back to the first balanced `{...}` span. Braces inside string
/// literals are ignored.
pub fn extract_json_object(text: &str) -> Option<String> {
    if let Some(fenced) = fenced_json(text)
        && let Some(obj) = balanced_object(fenced)
    {
        return Some(obj);
    }
    balanced_object(text)
}

fn fenced_json(text: &str) -> Option<&str> {
    let open = text.find("```json")?;
    let body = &text[open + "```json".len()..];
    let close = body.find("```")?;
    Some(&body[..close])
}

fn balanced_object(text: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, ch) in text[start..].char_indices() {
            if in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + i + 1];
                        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                            return Some(candidate.to_string());
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

/// Find and deserialize the JSON object embedded in `text`.
pub fn parse_embedded_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object found in output".to_string())?;
    serde_json::from_str(&json).map_err(|e| format!("output does not match the expected shape: {}", e))
}
