//! Tool Surface
//!
//! The fixed catalogue of read-oriented host probes exposed to the meta
//! layer. The catalogue is a tagged enum with exhaustive match dispatch,
//! so adding a tool without wiring its executor does not compile. Every
//! tool is total: failures come back as structured outputs, never panics.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::executor::{HostRunner, SystemRunner};
use crate::notify::{LogNotifier, Notifier};
use crate::safety::safe_mode_allowed;
use crate::utils::truncate_middle;

/// Default command timeout: one hour, so host rebuilds can finish.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// Structured output of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Value,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn success(data: impl Into<Value>, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            data: data.into(),
            summary: summary.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            data: Value::Null,
            summary: format!("Error: {}", error),
            error: Some(error),
        }
    }
}

/// The tool catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ExecuteCommand,
    ReadFile,
    CheckServiceStatus,
    ViewLogs,
    GetSystemMetrics,
    GetHardwareInfo,
    GetGpuMetrics,
    ListDirectory,
    CheckNetwork,
    RetrieveCachedOutput,
    SendNotification,
}

impl ToolKind {
    pub const ALL: [ToolKind; 11] = [
        ToolKind::ExecuteCommand,
        ToolKind::ReadFile,
        ToolKind::CheckServiceStatus,
        ToolKind::ViewLogs,
        ToolKind::GetSystemMetrics,
        ToolKind::GetHardwareInfo,
        ToolKind::GetGpuMetrics,
        ToolKind::ListDirectory,
        ToolKind::CheckNetwork,
        ToolKind::RetrieveCachedOutput,
        ToolKind::SendNotification,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::ExecuteCommand => "execute_command",
            ToolKind::ReadFile => "read_file",
            ToolKind::CheckServiceStatus => "check_service_status",
            ToolKind::ViewLogs => "view_logs",
            ToolKind::GetSystemMetrics => "get_system_metrics",
            ToolKind::GetHardwareInfo => "get_hardware_info",
            ToolKind::GetGpuMetrics => "get_gpu_metrics",
            ToolKind::ListDirectory => "list_directory",
            ToolKind::CheckNetwork => "check_network",
            ToolKind::RetrieveCachedOutput => "retrieve_cached_output",
            ToolKind::SendNotification => "send_notification",
        }
    }

    pub fn from_name(name: &str) -> Option<ToolKind> {
        ToolKind::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// JSON-schema definition in the function-calling shape both backends
    /// accept.
    pub fn definition(&self) -> Value {
        let (description, parameters) = match self {
            ToolKind::ExecuteCommand => (
                "Execute a shell command on the system. Use this to run system commands, check status, or gather information. Returns command output.",
                json!({
                    "type": "object",
                    "properties": {
                        "command": {
                            "type": "string",
                            "description": "The shell command to execute (e.g., 'systemctl status nginx', 'df -h')"
                        },
                        "timeout": {
                            "type": "integer",
                            "description": "Command timeout in seconds (default: 3600). System rebuilds can take up to an hour; be patient.",
                            "default": 3600
                        }
                    },
                    "required": ["command"]
                }),
            ),
            ToolKind::ReadFile => (
                "Read the contents of a file from the filesystem. Use this to inspect configuration files, logs, or other text files.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Absolute path to the file to read"
                        },
                        "max_lines": {
                            "type": "integer",
                            "description": "Maximum number of lines to read (default: 500)",
                            "default": 500
                        }
                    },
                    "required": ["path"]
                }),
            ),
            ToolKind::CheckServiceStatus => (
                "Check the status of a systemd service. Returns whether the service is active, enabled, and recent log entries.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Name of the systemd service (e.g., 'nginx', 'sshd')"
                        }
                    },
                    "required": ["name"]
                }),
            ),
            ToolKind::ViewLogs => (
                "View systemd journal logs. Can filter by unit, line count, or priority.",
                json!({
                    "type": "object",
                    "properties": {
                        "unit": {"type": "string", "description": "Systemd unit name to filter logs"},
                        "lines": {"type": "integer", "description": "Number of recent log lines (default: 50)", "default": 50},
                        "priority": {
                            "type": "string",
                            "description": "Filter by priority",
                            "enum": ["emerg", "alert", "crit", "err", "warning", "notice", "info", "debug"]
                        }
                    }
                }),
            ),
            ToolKind::GetSystemMetrics => (
                "Get current system resource metrics including uptime, memory, and disk summary.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolKind::GetHardwareInfo => (
                "Get hardware information: CPU model, memory, storage devices, network interfaces. Best-effort; returns whatever probes succeed.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolKind::GetGpuMetrics => (
                "Get GPU temperature, utilization and power usage. Best-effort for AMD and NVIDIA.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolKind::ListDirectory => (
                "List contents of a directory. Returns file names, sizes, and permissions.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Absolute path to the directory"},
                        "show_hidden": {"type": "boolean", "description": "Include hidden files", "default": false}
                    },
                    "required": ["path"]
                }),
            ),
            ToolKind::CheckNetwork => (
                "Test network connectivity to a host via ping or HTTP.",
                json!({
                    "type": "object",
                    "properties": {
                        "host": {"type": "string", "description": "Hostname or IP address to check"},
                        "method": {"type": "string", "enum": ["ping", "http"], "default": "ping"}
                    },
                    "required": ["host"]
                }),
            ),
            ToolKind::RetrieveCachedOutput => (
                "Retrieve full cached output from a previous tool call. Use this when you need complete data that was summarized earlier; the cache_id is shown in summaries.",
                json!({
                    "type": "object",
                    "properties": {
                        "cache_id": {"type": "string", "description": "Cache ID from a previous tool summary"},
                        "max_chars": {"type": "integer", "description": "Maximum characters to return (default: 10000)", "default": 10000}
                    },
                    "required": ["cache_id"]
                }),
            ),
            ToolKind::SendNotification => (
                "Send a notification to the operator. Choose priority by urgency: 2=low, 5=medium, 8=high.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string", "description": "Notification title"},
                        "message": {"type": "string", "description": "Notification message body"},
                        "priority": {"type": "integer", "enum": [2, 5, 8], "default": 5}
                    },
                    "required": ["title", "message"]
                }),
            ),
        };

        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": description,
                "parameters": parameters,
            }
        })
    }

    pub fn definitions() -> Vec<Value> {
        ToolKind::ALL.iter().map(|kind| kind.definition()).collect()
    }
}

pub struct ToolSurface {
    safe_mode: bool,
    cache_dir: PathBuf,
    runner: Arc<dyn HostRunner>,
    notifier: Arc<dyn Notifier>,
}

impl ToolSurface {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            safe_mode: false,
            cache_dir: cache_dir.into(),
            runner: Arc::new(SystemRunner),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn HostRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Execute a tool by name; unknown names are an ordinary failure
    /// output so the model can recover.
    pub async fn execute_by_name(&self, name: &str, params: &Value) -> ToolOutput {
        match ToolKind::from_name(name) {
            Some(kind) => self.execute(kind, params).await,
            None => ToolOutput::failure(format!("Unknown tool: {}", name)),
        }
    }

    pub async fn execute(&self, kind: ToolKind, params: &Value) -> ToolOutput {
        debug!("executing tool {} with {}", kind.name(), params);
        match kind {
            ToolKind::ExecuteCommand => self.execute_command(params).await,
            ToolKind::ReadFile => self.read_file(params),
            ToolKind::CheckServiceStatus => self.check_service_status(params).await,
            ToolKind::ViewLogs => self.view_logs(params).await,
            ToolKind::GetSystemMetrics => self.get_system_metrics().await,
            ToolKind::GetHardwareInfo => self.get_hardware_info().await,
            ToolKind::GetGpuMetrics => self.get_gpu_metrics().await,
            ToolKind::ListDirectory => self.list_directory(params).await,
            ToolKind::CheckNetwork => self.check_network(params).await,
            ToolKind::RetrieveCachedOutput => self.retrieve_cached_output(params),
            ToolKind::SendNotification => self.send_notification(params).await,
        }
    }

    async fn execute_command(&self, params: &Value) -> ToolOutput {
        let Some(command) = params.get("command").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: command");
        };
        let timeout = params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);

        if self.safe_mode && !safe_mode_allowed(command) {
            return ToolOutput::failure(format!(
                "Command '{}' not in allowed list (safe mode enabled)",
                command.split_whitespace().next().unwrap_or("")
            ));
        }

        match self
            .runner
            .run_shell(command, Duration::from_secs(timeout))
            .await
        {
            Ok(output) => {
                let data = json!({
                    "exit_code": output.status,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                    "command": command,
                });
                let summary = if output.status == 0 {
                    truncate_middle(output.stdout.trim(), 500)
                } else {
                    format!("exit {}: {}", output.status, truncate_middle(output.stderr.trim(), 300))
                };
                ToolOutput {
                    success: output.status == 0,
                    data,
                    summary,
                    error: None,
                }
            }
            Err(e) => ToolOutput::failure(format!("{:#}", e)),
        }
    }

    fn read_file(&self, params: &Value) -> ToolOutput {
        let Some(path_str) = params.get("path").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: path");
        };
        let max_lines = params
            .get("max_lines")
            .and_then(Value::as_u64)
            .unwrap_or(500) as usize;

        let path = Path::new(path_str);
        if !path.exists() {
            return ToolOutput::failure(format!("File not found: {}", path_str));
        }
        if !path.is_file() {
            return ToolOutput::failure(format!("Not a file: {}", path_str));
        }

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let mut lines: Vec<&str> = content.lines().take(max_lines + 1).collect();
                let truncated = lines.len() > max_lines;
                if truncated {
                    lines.truncate(max_lines);
                }
                let mut text = lines.join("\n");
                if truncated {
                    text.push_str(&format!("\n... truncated after {} lines ...", max_lines));
                }
                let lines_read = lines.len();
                ToolOutput::success(
                    json!({"content": text, "path": path_str, "lines_read": lines_read}),
                    format!("read {} lines from {}", lines_read, path_str),
                )
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ToolOutput::failure(format!("Permission denied: {}", path_str))
            }
            Err(e) => ToolOutput::failure(format!("{}", e)),
        }
    }

    async fn check_service_status(&self, params: &Value) -> ToolOutput {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: name");
        };
        let service = if name.ends_with(".service") {
            name.to_string()
        } else {
            format!("{}.service", name)
        };

        let timeout = Duration::from_secs(15);
        let is_active = self
            .runner
            .run("systemctl", &["is-active", &service], timeout)
            .await;
        let is_enabled = self
            .runner
            .run("systemctl", &["is-enabled", &service], timeout)
            .await;
        let status = self
            .runner
            .run("systemctl", &["status", &service, "--no-pager"], timeout)
            .await;
        let logs = self
            .runner
            .run(
                "journalctl",
                &["-u", &service, "-n", "10", "--no-pager"],
                timeout,
            )
            .await;

        let active = is_active
            .as_ref()
            .map(|o| o.stdout.trim() == "active")
            .unwrap_or(false);
        let enabled = is_enabled
            .as_ref()
            .map(|o| o.stdout.trim() == "enabled")
            .unwrap_or(false);

        ToolOutput::success(
            json!({
                "service": service,
                "active": active,
                "enabled": enabled,
                "status_output": status.map(|o| o.stdout).unwrap_or_default(),
                "recent_logs": logs.map(|o| o.stdout).unwrap_or_default(),
            }),
            format!(
                "{}: active={}, enabled={}",
                service, active, enabled
            ),
        )
    }

    async fn view_logs(&self, params: &Value) -> ToolOutput {
        let mut args: Vec<String> = vec!["--no-pager".into()];
        if let Some(unit) = params.get("unit").and_then(Value::as_str) {
            args.push("-u".into());
            args.push(unit.to_string());
        }
        let lines = params.get("lines").and_then(Value::as_u64).unwrap_or(50);
        args.push("-n".into());
        args.push(lines.to_string());
        if let Some(priority) = params.get("priority").and_then(Value::as_str) {
            args.push("-p".into());
            args.push(priority.to_string());
        }

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        match self
            .runner
            .run("journalctl", &arg_refs, Duration::from_secs(30))
            .await
        {
            Ok(output) => ToolOutput::success(
                json!({"logs": output.stdout, "lines": lines}),
                format!("{} journal lines", lines),
            ),
            Err(e) => ToolOutput::failure(format!("{:#}", e)),
        }
    }

    async fn get_system_metrics(&self) -> ToolOutput {
        let timeout = Duration::from_secs(10);
        let uptime = self.runner.run("uptime", &[], timeout).await;
        let memory = self.runner.run("free", &["-h"], timeout).await;
        let disk = self.runner.run("df", &["-h"], timeout).await;

        ToolOutput::success(
            json!({
                "uptime": uptime.map(|o| o.stdout).unwrap_or_default(),
                "memory": memory.map(|o| o.stdout).unwrap_or_default(),
                "disk": disk.map(|o| o.stdout).unwrap_or_default(),
            }),
            "system metrics collected",
        )
    }

    async fn get_hardware_info(&self) -> ToolOutput {
        let timeout = Duration::from_secs(15);
        let mut hardware = serde_json::Map::new();

        let probes: [(&str, &str, &[&str]); 5] = [
            ("cpu", "lscpu", &[]),
            ("memory", "free", &["-h"]),
            ("network_interfaces", "ip", &["link", "show"]),
            ("storage", "lsblk", &["-o", "NAME,SIZE,TYPE,MOUNTPOINT,FSTYPE"]),
            ("pci_devices", "lspci", &[]),
        ];

        for (key, program, args) in probes {
            if let Ok(output) = self.runner.run(program, args, timeout).await {
                if output.status == 0 {
                    hardware.insert(key.to_string(), Value::String(output.stdout));
                }
            }
        }

        let count = hardware.len();
        ToolOutput::success(
            Value::Object(hardware),
            format!("hardware info: {} probes succeeded", count),
        )
    }

    async fn get_gpu_metrics(&self) -> ToolOutput {
        let timeout = Duration::from_secs(15);
        let mut metrics = serde_json::Map::new();

        if let Ok(output) = self
            .runner
            .run(
                "nvidia-smi",
                &[
                    "--query-gpu=temperature.gpu,utilization.gpu,power.draw,clocks.gr",
                    "--format=csv",
                ],
                timeout,
            )
            .await
        {
            if output.status == 0 {
                metrics.insert("nvidia_smi".to_string(), Value::String(output.stdout));
            }
        }

        if metrics.is_empty() {
            if let Ok(output) = self.runner.run("sensors", &[], timeout).await {
                if output.status == 0 {
                    metrics.insert("sensors".to_string(), Value::String(output.stdout));
                }
            }
        }

        let count = metrics.len();
        ToolOutput::success(
            Value::Object(metrics),
            format!("gpu metrics: {} sources available", count),
        )
    }

    async fn list_directory(&self, params: &Value) -> ToolOutput {
        let Some(path) = params.get("path").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: path");
        };
        let show_hidden = params
            .get("show_hidden")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let flags = if show_hidden { "-lha" } else { "-lh" };
        match self
            .runner
            .run("ls", &[flags, path], Duration::from_secs(10))
            .await
        {
            Ok(output) if output.status == 0 => ToolOutput::success(
                json!({"directory": path, "listing": output.stdout}),
                format!("listed {}", path),
            ),
            Ok(output) => ToolOutput::failure(output.stderr.trim().to_string()),
            Err(e) => ToolOutput::failure(format!("{:#}", e)),
        }
    }

    async fn check_network(&self, params: &Value) -> ToolOutput {
        let Some(host) = params.get("host").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: host");
        };
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("ping");

        let result = match method {
            "ping" => {
                self.runner
                    .run("ping", &["-c", "3", "-W", "2", host], Duration::from_secs(15))
                    .await
            }
            "http" => {
                self.runner
                    .run("curl", &["-I", "-m", "5", host], Duration::from_secs(10))
                    .await
            }
            other => return ToolOutput::failure(format!("Unknown method: {}", other)),
        };

        match result {
            Ok(output) => {
                let reachable = output.status == 0;
                ToolOutput::success(
                    json!({
                        "host": host,
                        "method": method,
                        "reachable": reachable,
                        "output": output.stdout,
                    }),
                    format!("{} {} via {}", host, if reachable { "reachable" } else { "unreachable" }, method),
                )
            }
            Err(e) => ToolOutput::failure(format!("{:#}", e)),
        }
    }

    fn retrieve_cached_output(&self, params: &Value) -> ToolOutput {
        let Some(cache_id) = params.get("cache_id").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: cache_id");
        };
        let max_chars = params
            .get("max_chars")
            .and_then(Value::as_u64)
            .unwrap_or(10_000) as usize;

        // Ids are generated internally; refuse anything path-shaped.
        if cache_id.contains('/') || cache_id.contains("..") {
            return ToolOutput::failure(format!("Invalid cache id: {}", cache_id));
        }

        let path = self.cache_dir.join(format!("{}.txt", cache_id));
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let size = content.len();
                ToolOutput::success(
                    json!({
                        "cache_id": cache_id,
                        "size": size,
                        "content": truncate_middle(&content, max_chars),
                    }),
                    format!("cached output {} ({} chars)", cache_id, size),
                )
            }
            Err(_) => ToolOutput::failure(format!(
                "Cache file not found: {} (check the id shown in the summary)",
                cache_id
            )),
        }
    }

    async fn send_notification(&self, params: &Value) -> ToolOutput {
        let Some(title) = params.get("title").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: title");
        };
        let Some(message) = params.get("message").and_then(Value::as_str) else {
            return ToolOutput::failure("missing required parameter: message");
        };
        let priority = params.get("priority").and_then(Value::as_u64).unwrap_or(5) as u8;

        match self.notifier.send(title, message, priority).await {
            Ok(()) => ToolOutput::success(
                json!({"title": title, "priority": priority}),
                "notification sent",
            ),
            Err(e) => ToolOutput::failure(format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(dir: &Path) -> ToolSurface {
        ToolSurface::new(dir.join("tool_cache"))
    }

    #[test]
    fn test_catalogue_names_roundtrip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("made_up_tool"), None);
    }

    #[test]
    fn test_definitions_are_function_schemas() {
        let definitions = ToolKind::definitions();
        assert_eq!(definitions.len(), 11);
        for def in definitions {
            assert_eq!(def["type"], "function");
            assert!(def["function"]["name"].is_string());
            assert!(def["function"]["parameters"]["type"] == "object");
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = surface(dir.path())
            .execute_by_name("no_such_tool", &json!({}))
            .await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_read_file_limits_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let surface = surface(dir.path());

        let file = dir.path().join("test.txt");
        let body: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&file, body).unwrap();

        let out = surface
            .execute(
                ToolKind::ReadFile,
                &json!({"path": file.to_string_lossy(), "max_lines": 10}),
            )
            .await;
        assert!(out.success);
        assert_eq!(out.data["lines_read"], 10);
        assert!(out.data["content"].as_str().unwrap().contains("truncated"));

        let missing = surface
            .execute(ToolKind::ReadFile, &json!({"path": "/no/such/file"}))
            .await;
        assert!(!missing.success);

        let not_a_file = surface
            .execute(
                ToolKind::ReadFile,
                &json!({"path": dir.path().to_string_lossy()}),
            )
            .await;
        assert!(!not_a_file.success);
        assert!(not_a_file.error.unwrap().starts_with("Not a file"));
    }

    #[tokio::test]
    async fn test_safe_mode_blocks_disallowed_commands() {
        let dir = tempfile::tempdir().unwrap();
        let surface = ToolSurface::new(dir.path().join("tool_cache")).with_safe_mode(true);

        let out = surface
            .execute(ToolKind::ExecuteCommand, &json!({"command": "rm -rf /tmp/x"}))
            .await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("not in allowed list"));
    }

    #[tokio::test]
    async fn test_cached_output_roundtrip_with_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("tool_cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("view_logs_20251006.txt"), "x".repeat(20_000)).unwrap();

        let surface = ToolSurface::new(&cache_dir);
        let out = surface
            .execute(
                ToolKind::RetrieveCachedOutput,
                &json!({"cache_id": "view_logs_20251006", "max_chars": 1000}),
            )
            .await;
        assert!(out.success);
        assert_eq!(out.data["size"], 20_000);
        assert!(out.data["content"].as_str().unwrap().contains("chars truncated"));

        let missing = surface
            .execute(
                ToolKind::RetrieveCachedOutput,
                &json!({"cache_id": "nope"}),
            )
            .await;
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn test_missing_parameters_are_failures_not_panics() {
        let dir = tempfile::tempdir().unwrap();
        let surface = surface(dir.path());
        for kind in [
            ToolKind::ExecuteCommand,
            ToolKind::ReadFile,
            ToolKind::CheckServiceStatus,
            ToolKind::ListDirectory,
            ToolKind::CheckNetwork,
            ToolKind::RetrieveCachedOutput,
            ToolKind::SendNotification,
        ] {
            let out = surface.execute(kind, &json!({})).await;
            assert!(!out.success, "{:?} should fail on empty params", kind);
        }
    }
}
