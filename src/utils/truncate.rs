//! Truncation Utilities
//!
//! Robust text truncation that preserves prefix/suffix and respects UTF-8
//! boundaries, plus the approximate token counter used when no tokenizer is
//! configured.

const APPROX_BYTES_PER_TOKEN: usize = 4;

/// Head+tail truncation with an elision marker in the middle.
pub fn truncate_middle(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }

    if max_bytes == 0 {
        return format!("... [{} chars truncated] ...", content.len());
    }

    let half = max_bytes / 2;
    let mut prefix_end = 0;
    let mut suffix_start = content.len();

    for (idx, c) in content.char_indices() {
        let char_end = idx + c.len_utf8();
        if char_end <= half {
            prefix_end = char_end;
        } else {
            break;
        }
    }

    let suffix_target = content.len().saturating_sub(half);
    for (idx, _) in content.char_indices().rev() {
        if idx >= suffix_target {
            suffix_start = idx;
        } else {
            break;
        }
    }

    if suffix_start < prefix_end {
        suffix_start = prefix_end;
    }

    let prefix = &content[..prefix_end];
    let suffix = &content[suffix_start..];
    let truncated = content.len() - (prefix.len() + suffix.len());

    format!("{} ... [{} chars truncated] ... {}", prefix, truncated, suffix)
}

/// Truncate at the end only, on a char boundary.
pub fn truncate_tail(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    content.chars().take(max_chars).collect()
}

pub fn approx_token_count(text: &str) -> usize {
    text.len()
        .saturating_add(APPROX_BYTES_PER_TOKEN - 1)
        / APPROX_BYTES_PER_TOKEN
}
