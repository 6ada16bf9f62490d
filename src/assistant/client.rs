//! Assembling one assistant CLI invocation: flags, per-exchange MCP config
//! and API-key environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::AssistantError;
use crate::util::sanitize_filename;

/// Tool permissions granted to every exchange.
pub const TOOL_SETTINGS: &str =
    r#"{"permissions":{"allow":["Bash(*)","Read(*)","Write(*)","Edit(*)","WebFetch(*)"],"deny":[]}}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationKind {
    Mcp,
    ApiKey,
    #[serde(other)]
    Unknown,
}

/// A user-configured integration attached to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IntegrationKind,
    #[serde(default, alias = "serverCommand")]
    pub server_command: Option<String>,
    #[serde(default, alias = "serverArgs")]
    pub server_args: Option<Vec<String>>,
    #[serde(default, alias = "envVariable")]
    pub env_variable: Option<String>,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
}

/// One message sent to the assistant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantRequest {
    pub message: String,
    /// Session token returned by a previous exchange, if any.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpServerSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// Contents of the `--mcp-config` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, McpServerSpec>,
}

/// Integrations sorted into MCP servers and environment variables.
#[derive(Debug, Default)]
pub struct IntegrationPlan {
    pub mcp: McpConfig,
    /// Variables set on the CLI child only.
    pub env: Vec<(String, String)>,
    /// `(variable, integration name)` pairs announced in the system prompt.
    pub declared: Vec<(String, String)>,
}

impl IntegrationPlan {
    pub fn from_integrations(integrations: &[IntegrationConfig]) -> Self {
        let mut plan = Self::default();
        for integration in integrations {
            match integration.kind {
                IntegrationKind::Mcp => {
                    let Some(command) = integration
                        .server_command
                        .as_deref()
                        .filter(|c| !c.trim().is_empty())
                    else {
                        tracing::warn!(integration = %integration.id, "MCP integration has no server command");
                        continue;
                    };
                    plan.mcp.mcp_servers.insert(
                        integration.id.clone(),
                        McpServerSpec {
                            command: command.to_string(),
                            args: integration.server_args.clone().unwrap_or_default(),
                        },
                    );
                }
                IntegrationKind::ApiKey => {
                    let var = integration
                        .env_variable
                        .as_deref()
                        .filter(|v| !v.trim().is_empty());
                    let key = integration.api_key.as_deref().filter(|k| !k.is_empty());
                    if let (Some(var), Some(key)) = (var, key) {
                        plan.env.push((var.to_string(), key.to_string()));
                        plan.declared
                            .push((var.to_string(), integration.name.clone()));
                    }
                }
                IntegrationKind::Unknown => {
                    tracing::debug!(integration = %integration.id, "Ignoring integration of unknown type");
                }
            }
        }
        plan
    }

    /// A config file is written when any integration contributed something.
    pub fn needs_config_file(&self) -> bool {
        !self.mcp.mcp_servers.is_empty() || !self.env.is_empty()
    }

    /// The caller's system prompt plus a note on which API keys are
    /// reachable as environment variables. Key values never appear here.
    pub fn system_prompt(&self, base: Option<&str>) -> Option<String> {
        let base = base.map(str::trim).filter(|s| !s.is_empty());
        if self.declared.is_empty() {
            return base.map(str::to_string);
        }
        let mut prompt = base.map(|b| format!("{}\n\n", b)).unwrap_or_default();
        prompt.push_str("The following API keys are available as environment variables:\n");
        for (var, name) in &self.declared {
            prompt.push_str(&format!("- ${} ({})\n", var, name));
        }
        Some(prompt.trim_end().to_string())
    }
}

/// Where the MCP config of one exchange lives: the working directory if
/// there is one, the temp dir otherwise.
pub fn mcp_config_path(conversation_id: &str, working_dir: Option<&Path>) -> PathBuf {
    let file = format!(".quest-mcp-{}.json", sanitize_filename(conversation_id));
    match working_dir {
        Some(dir) => dir.join(file),
        None => std::env::temp_dir().join(file),
    }
}

pub async fn write_mcp_config(path: &Path, config: &McpConfig) -> Result<(), AssistantError> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AssistantError::McpConfig(e.to_string()))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| AssistantError::McpConfig(format!("{}: {}", path.display(), e)))
}

/// CLI arguments for one exchange. The message is the final positional
/// argument.
pub fn build_args(
    request: &AssistantRequest,
    system_prompt: Option<&str>,
    mcp_config: Option<&Path>,
) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(sid) = request.session_id.as_deref().filter(|s| !s.is_empty()) {
        args.push("--resume".to_string());
        args.push(sid.to_string());
    }
    if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
        args.push("--system-prompt".to_string());
        args.push(prompt.to_string());
    }
    if let Some(path) = mcp_config {
        args.push("--mcp-config".to_string());
        args.push(path.to_string_lossy().into_owned());
    }
    args.extend(
        [
            "--print",
            "--output-format",
            "stream-json",
            "--verbose",
            "--permission-mode",
            "bypassPermissions",
            "--settings",
            TOOL_SETTINGS,
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(request.message.clone());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key(id: &str, var: &str, key: &str) -> IntegrationConfig {
        IntegrationConfig {
            id: id.into(),
            name: format!("{} service", id),
            kind: IntegrationKind::ApiKey,
            server_command: None,
            server_args: None,
            env_variable: Some(var.into()),
            api_key: Some(key.into()),
        }
    }

    #[test]
    fn integrations_deserialize_from_ui_shape() {
        let raw = r#"[
            {"id":"fs","name":"Files","type":"mcp","serverCommand":"npx","serverArgs":["-y","@mcp/fs"]},
            {"id":"gh","name":"GitHub","type":"api-key","env_variable":"GITHUB_TOKEN","api_key":"ghp_x"},
            {"id":"odd","name":"Odd","type":"webhook"}
        ]"#;
        let parsed: Vec<IntegrationConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].kind, IntegrationKind::Mcp);
        assert_eq!(parsed[0].server_command.as_deref(), Some("npx"));
        assert_eq!(parsed[1].kind, IntegrationKind::ApiKey);
        assert_eq!(parsed[2].kind, IntegrationKind::Unknown);
    }

    #[test]
    fn plan_splits_mcp_servers_and_keys() {
        let integrations = vec![
            IntegrationConfig {
                id: "fs".into(),
                name: "Files".into(),
                kind: IntegrationKind::Mcp,
                server_command: Some("npx".into()),
                server_args: Some(vec!["-y".into(), "@mcp/fs".into()]),
                env_variable: None,
                api_key: None,
            },
            api_key("gh", "GITHUB_TOKEN", "ghp_secret"),
            api_key("empty", "EMPTY_KEY", ""),
        ];
        let plan = IntegrationPlan::from_integrations(&integrations);
        assert!(plan.needs_config_file());
        assert_eq!(plan.env, vec![("GITHUB_TOKEN".into(), "ghp_secret".into())]);

        let json = serde_json::to_value(&plan.mcp).unwrap();
        assert_eq!(json["mcpServers"]["fs"]["command"], "npx");
        assert_eq!(json["mcpServers"]["fs"]["args"][1], "@mcp/fs");

        let prompt = plan.system_prompt(Some("Be brief.")).unwrap();
        assert!(prompt.starts_with("Be brief.\n\n"));
        assert!(prompt.contains("$GITHUB_TOKEN (gh service)"));
        assert!(!prompt.contains("ghp_secret"));
        assert!(!prompt.contains("EMPTY_KEY"));
    }

    #[test]
    fn empty_plan_leaves_prompt_alone() {
        let plan = IntegrationPlan::from_integrations(&[]);
        assert!(!plan.needs_config_file());
        assert_eq!(plan.system_prompt(None), None);
        assert_eq!(plan.system_prompt(Some("  ")), None);
        assert_eq!(plan.system_prompt(Some("x")).as_deref(), Some("x"));
    }

    #[test]
    fn args_resume_session_and_end_with_message() {
        let request = AssistantRequest {
            message: "list files".into(),
            session_id: Some("sess-1".into()),
            ..Default::default()
        };
        let path = PathBuf::from("/tmp/.quest-mcp-c1.json");
        let args = build_args(&request, Some("prompt"), Some(&path));
        assert_eq!(&args[..2], &["--resume", "sess-1"]);
        assert_eq!(&args[2..4], &["--system-prompt", "prompt"]);
        assert_eq!(&args[4..6], &["--mcp-config", "/tmp/.quest-mcp-c1.json"]);
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&TOOL_SETTINGS.to_string()));
        assert_eq!(args.last().map(String::as_str), Some("list files"));

        let fresh = build_args(
            &AssistantRequest {
                message: "hi".into(),
                session_id: Some(String::new()),
                ..Default::default()
            },
            None,
            None,
        );
        assert_eq!(fresh[0], "--print");
    }

    #[test]
    fn config_path_is_per_conversation() {
        let dir = PathBuf::from("/work");
        assert_eq!(
            mcp_config_path("c/1", Some(&dir)),
            PathBuf::from("/work/.quest-mcp-c_1.json")
        );
        assert!(mcp_config_path("c1", None).starts_with(std::env::temp_dir()));
    }
}
