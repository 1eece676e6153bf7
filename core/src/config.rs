use std::collections::HashMap;
use std::path::PathBuf;

use tracing::warn;

/// Which upstream the proxy forwards model requests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Databricks,
    Azure,
}

#[derive(Debug, Clone)]
pub struct DatabricksConfig {
    pub api_base: String,
    pub api_key: String,
    pub endpoint_path: Option<String>,
    pub default_model: String,
}

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub endpoint: String,
    pub api_key: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone)]
pub struct GitPolicyConfig {
    pub allow_push: bool,
    pub allow_pull: bool,
    pub allow_commit: bool,
    pub require_tests: bool,
    pub test_command: Option<String>,
    pub commit_regex: Option<String>,
    pub autostash: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub max_steps: u32,
    pub max_tool_calls: u32,
    pub disallowed_tools: Vec<String>,
    pub git: GitPolicyConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPermissionMode {
    Auto,
    Require,
    Deny,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub image: String,
    pub runtime: String,
    pub container_workspace: String,
    pub mount_workspace: bool,
    pub allow_networking: bool,
    pub network_mode: String,
    pub passthrough_env: Vec<String>,
    /// `host:container:mode` triples.
    pub extra_mounts: Vec<String>,
    pub timeout_ms: u64,
    pub user: Option<String>,
    pub entrypoint: Option<String>,
    pub reuse_session: bool,
    pub permission_mode: SandboxPermissionMode,
    pub permission_allow: Vec<String>,
    pub permission_deny: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct McpConfig {
    pub manifest: Option<PathBuf>,
    pub manifest_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub search_endpoint: String,
    pub allow_all_hosts: bool,
    pub allowed_hosts: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderKind,
    pub databricks: DatabricksConfig,
    pub azure: AzureConfig,
    pub port: u16,
    pub workspace_root: PathBuf,
    pub cache: CacheConfig,
    pub policy: PolicyConfig,
    pub mcp: McpConfig,
    pub sandbox: SandboxConfig,
    pub session_db_path: PathBuf,
    pub web: WebConfig,
}

impl Config {
    /// Materialize the configuration from the process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Build from an explicit variable map; the unit-testable constructor.
    pub fn from_env_map(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).map(String::as_str);
        let get_or = |key: &str, default: &str| get(key).unwrap_or(default).to_string();

        let provider = match get("MODEL_PROVIDER").unwrap_or("databricks") {
            "azure" => ProviderKind::Azure,
            "databricks" => ProviderKind::Databricks,
            other => {
                warn!("unknown MODEL_PROVIDER {other:?}, defaulting to databricks");
                ProviderKind::Databricks
            }
        };

        let workspace_root = get("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let manifest_dirs = get("MCP_MANIFEST_DIRS")
            .map(|raw| raw.split(':').filter(|s| !s.is_empty()).map(expand_home).collect())
            .unwrap_or_else(|| vec![expand_home("~/.claude/mcp")]);

        Self {
            provider,
            databricks: DatabricksConfig {
                api_base: get_or("DATABRICKS_API_BASE", ""),
                api_key: get_or("DATABRICKS_API_KEY", ""),
                endpoint_path: get("DATABRICKS_ENDPOINT_PATH").map(str::to_string),
                default_model: get_or("DATABRICKS_DEFAULT_MODEL", "databricks-claude-sonnet"),
            },
            azure: AzureConfig {
                endpoint: get_or("AZURE_ANTHROPIC_ENDPOINT", ""),
                api_key: get_or("AZURE_ANTHROPIC_API_KEY", ""),
                version: get_or("AZURE_ANTHROPIC_VERSION", "2023-06-01"),
            },
            port: parse_or(get("PORT"), 8080),
            workspace_root,
            cache: CacheConfig {
                enabled: parse_bool_or(get("PROMPT_CACHE_ENABLED"), true),
                ttl_ms: parse_or(get("PROMPT_CACHE_TTL_MS"), 300_000),
                max_entries: parse_or(get("PROMPT_CACHE_MAX_ENTRIES"), 64),
            },
            policy: PolicyConfig {
                max_steps: parse_or(get("POLICY_MAX_STEPS"), 8),
                max_tool_calls: parse_or(get("POLICY_MAX_TOOL_CALLS"), 12),
                disallowed_tools: split_csv(get("POLICY_DISALLOWED_TOOLS").unwrap_or("")),
                git: GitPolicyConfig {
                    allow_push: parse_bool_or(get("POLICY_GIT_ALLOW_PUSH"), false),
                    allow_pull: parse_bool_or(get("POLICY_GIT_ALLOW_PULL"), false),
                    allow_commit: parse_bool_or(get("POLICY_GIT_ALLOW_COMMIT"), true),
                    require_tests: parse_bool_or(get("POLICY_GIT_REQUIRE_TESTS"), false),
                    test_command: get("POLICY_GIT_TEST_COMMAND")
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    commit_regex: get("POLICY_GIT_COMMIT_REGEX")
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    autostash: parse_bool_or(get("POLICY_GIT_AUTOSTASH"), false),
                },
            },
            mcp: McpConfig {
                manifest: get("MCP_SERVER_MANIFEST")
                    .filter(|s| !s.is_empty())
                    .map(expand_home),
                manifest_dirs,
            },
            sandbox: SandboxConfig {
                enabled: parse_bool_or(get("MCP_SANDBOX_ENABLED"), false),
                image: get_or("MCP_SANDBOX_IMAGE", "python:3.11-slim"),
                runtime: get_or("MCP_SANDBOX_RUNTIME", "docker"),
                container_workspace: get_or("MCP_SANDBOX_CONTAINER_WORKSPACE", "/workspace"),
                mount_workspace: parse_bool_or(get("MCP_SANDBOX_MOUNT_WORKSPACE"), true),
                allow_networking: parse_bool_or(get("MCP_SANDBOX_ALLOW_NETWORKING"), false),
                network_mode: get_or("MCP_SANDBOX_NETWORK_MODE", "none"),
                passthrough_env: split_csv(get("MCP_SANDBOX_PASSTHROUGH_ENV").unwrap_or("")),
                extra_mounts: split_csv(get("MCP_SANDBOX_EXTRA_MOUNTS").unwrap_or("")),
                timeout_ms: parse_or(get("MCP_SANDBOX_TIMEOUT_MS"), 15_000),
                user: get("MCP_SANDBOX_USER").filter(|s| !s.is_empty()).map(str::to_string),
                entrypoint: get("MCP_SANDBOX_ENTRYPOINT")
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                reuse_session: parse_bool_or(get("MCP_SANDBOX_REUSE_SESSION"), true),
                permission_mode: match get("MCP_SANDBOX_PERMISSION_MODE").unwrap_or("auto") {
                    "require" => SandboxPermissionMode::Require,
                    "deny" => SandboxPermissionMode::Deny,
                    _ => SandboxPermissionMode::Auto,
                },
                permission_allow: split_csv(get("MCP_SANDBOX_PERMISSION_ALLOW").unwrap_or("")),
                permission_deny: split_csv(get("MCP_SANDBOX_PERMISSION_DENY").unwrap_or("")),
            },
            session_db_path: get("SESSION_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/sessions.db")),
            web: WebConfig {
                search_endpoint: get_or("WEB_SEARCH_ENDPOINT", "http://localhost:8888/search"),
                allow_all_hosts: parse_bool_or(get("WEB_SEARCH_ALLOW_ALL"), true),
                allowed_hosts: split_csv(get("WEB_SEARCH_ALLOWED_HOSTS").unwrap_or("")),
                timeout_ms: parse_or(get("WEB_SEARCH_TIMEOUT_MS"), 10_000),
            },
        }
    }

    /// Default model slug for the active provider.
    pub fn default_model(&self) -> &str {
        &self.databricks.default_model
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr>(value: Option<&str>, default: T) -> T {
    value.and_then(|raw| raw.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool_or(value: Option<&str>, default: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if ["1", "true", "yes", "on"].contains(&v.as_str()) => true,
        Some(v) if ["0", "false", "no", "off"].contains(&v.as_str()) => false,
        _ => default,
    }
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}
