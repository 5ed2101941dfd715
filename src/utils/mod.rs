//! Utils Module
pub mod json;
pub mod truncate;

pub use json::{extract_json_array, extract_json_object};
pub use truncate::{approx_token_count, truncate_middle, truncate_tail};
