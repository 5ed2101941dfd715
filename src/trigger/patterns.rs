//! Log Pattern Table
//!
//! Ordered list of journal patterns the trigger layer scans for. Matching
//! is case-insensitive and first match wins.

use regex::Regex;

use crate::event::Severity;

pub struct LogPattern {
    pub regex: Regex,
    pub severity: Severity,
    pub description: &'static str,
}

pub fn default_patterns() -> Vec<LogPattern> {
    [
        (r"kernel:.*panic", Severity::Critical, "Kernel panic detected"),
        (r"Out of memory", Severity::Critical, "OOM condition detected"),
        (r"segfault", Severity::High, "Segmentation fault detected"),
        (r"Failed to start", Severity::High, "Service failed to start"),
        (r"FAILED", Severity::Medium, "Service failure"),
        (
            r"error.*authentication",
            Severity::Medium,
            "Authentication error",
        ),
        (r"Connection refused", Severity::Low, "Connection refused"),
        (r"timeout", Severity::Low, "Timeout detected"),
    ]
    .iter()
    .filter_map(|(pattern, severity, description)| {
        Regex::new(&format!("(?i){}", pattern))
            .ok()
            .map(|regex| LogPattern {
                regex,
                severity: *severity,
                description,
            })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(default_patterns().len(), 8);
    }

    #[test]
    fn test_case_insensitive_matching() {
        let patterns = default_patterns();
        let oom = patterns
            .iter()
            .find(|p| p.description.contains("OOM"))
            .unwrap();
        assert!(oom.regex.is_match("OUT OF MEMORY: killed process 1234"));
        assert!(oom.regex.is_match("out of memory"));
    }

    #[test]
    fn test_first_match_wins_ordering() {
        let patterns = default_patterns();
        let message = "kernel: panic - Failed to start something";
        let first = patterns.iter().find(|p| p.regex.is_match(message)).unwrap();
        assert_eq!(first.severity, Severity::Critical);
    }
}
