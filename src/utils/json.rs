//! JSON Extraction Helpers
//!
//! Model responses frequently wrap the requested JSON in prose or code
//! fences. These helpers locate the outermost balanced object or array.

use serde_json::Value;

/// Find and parse the outermost balanced JSON object in free-form text.
pub fn extract_json_object(text: &str) -> Option<Value> {
    extract_balanced(text, '{', '}').and_then(|s| serde_json::from_str(&s).ok())
}

/// Find and parse the outermost balanced JSON array in free-form text.
pub fn extract_json_array(text: &str) -> Option<Value> {
    extract_balanced(text, '[', ']').and_then(|s| serde_json::from_str(&s).ok())
}

fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + idx + c.len_utf8();
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_object_from_prose() {
        let text = "Sure, here is the analysis:\n{\"status\": \"normal\", \"nested\": {\"a\": 1}}\nLet me know!";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["status"], "normal");
        assert_eq!(value["nested"]["a"], 1);
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let text = r#"{"message": "use {curly} braces", "ok": true}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_unbalanced_returns_none() {
        assert!(extract_json_object("{\"status\": \"norm").is_none());
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn test_extracts_array() {
        let text = "learnings: [{\"topic\": \"x\"}] done";
        let value = extract_json_array(text).unwrap();
        assert_eq!(value[0]["topic"], "x");
    }
}
