//! Command Safety Heuristics
//!
//! Identifies protected systemd units and read-only command shapes the
//! executor and tool surface may run without escalation.

/// Units that must never be restarted or stopped by an automated action,
/// independent of autonomy level. Losing any of these can sever the
/// operator's access to the host.
pub const PROTECTED_UNITS: &[&str] = &[
    "sshd",
    "systemd-networkd",
    "NetworkManager",
    "systemd-resolved",
    "dbus",
    "systemd-journald",
];

/// Command prefixes allowed for `investigation` proposals. Everything here
/// is read-only against host state.
pub const INVESTIGATION_PREFIXES: &[&str] = &[
    "journalctl",
    "systemctl status",
    "df",
    "free",
    "ps",
    "ss",
    "netstat",
];

/// Base commands the tool surface accepts in safe mode.
pub const SAFE_MODE_COMMANDS: &[&str] = &[
    "systemctl",
    "journalctl",
    "free",
    "df",
    "uptime",
    "ps",
    "top",
    "ip",
    "ss",
    "cat",
    "ls",
    "grep",
    "ping",
    "dig",
    "nslookup",
    "curl",
    "wget",
    "lscpu",
    "lspci",
    "lsblk",
    "sar",
];

pub fn default_protected_units() -> Vec<String> {
    PROTECTED_UNITS.iter().map(|s| s.to_string()).collect()
}

/// Whether a unit name matches the protected set. Matches with or without
/// the `.service` suffix, so `systemctl restart sshd.service` is caught.
pub fn is_protected_unit(unit: &str, protected: &[String]) -> bool {
    let base = unit.trim().trim_end_matches(".service");
    protected.iter().any(|p| {
        let p = p.trim_end_matches(".service");
        base == p
    })
}

/// Whether a shell command line is acceptable as an investigation step.
pub fn investigation_allowed(command: &str) -> bool {
    let trimmed = command.trim();
    INVESTIGATION_PREFIXES.iter().any(|prefix| {
        trimmed == *prefix
            || trimmed.starts_with(&format!("{} ", prefix))
    })
}

/// Whether a shell command line's base command is on the safe-mode list.
pub fn safe_mode_allowed(command: &str) -> bool {
    let Some(base) = command.split_whitespace().next() else {
        return false;
    };
    let base = std::path::Path::new(base)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(base);
    SAFE_MODE_COMMANDS.contains(&base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_units() {
        let protected = default_protected_units();
        assert!(is_protected_unit("sshd", &protected));
        assert!(is_protected_unit("sshd.service", &protected));
        assert!(is_protected_unit("systemd-journald", &protected));
        assert!(!is_protected_unit("nginx", &protected));
        assert!(!is_protected_unit("sshd-extra", &protected));
    }

    #[test]
    fn test_investigation_allow_list() {
        assert!(investigation_allowed("journalctl -u nginx -n 50"));
        assert!(investigation_allowed("systemctl status nginx"));
        assert!(investigation_allowed("df -h"));
        assert!(investigation_allowed("free"));
        assert!(!investigation_allowed("systemctl restart nginx"));
        assert!(!investigation_allowed("rm -rf /tmp/x"));
        assert!(!investigation_allowed("dfx --fake"));
    }

    #[test]
    fn test_safe_mode_allow_list() {
        assert!(safe_mode_allowed("df -h"));
        assert!(safe_mode_allowed("/usr/bin/journalctl -n 10"));
        assert!(!safe_mode_allowed("rm -rf /"));
        assert!(!safe_mode_allowed(""));
    }
}
