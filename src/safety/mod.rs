//! Safety Module
//!
//! Command heuristics for the executor and tool surface: protected units
//! that must never be restarted, and the read-only allow-lists for
//! investigation commands and safe-mode tool execution.

mod command;

pub use command::{
    default_protected_units, investigation_allowed, is_protected_unit, safe_mode_allowed,
    INVESTIGATION_PREFIXES, SAFE_MODE_COMMANDS,
};
