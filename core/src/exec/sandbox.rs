use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::exec::runner::RunRequest;

/// Marker variable exposed inside the container so tools can correlate
/// runs back to their session.
pub const SANDBOX_SESSION_ENV_VAR: &str = "MCP_SANDBOX_SESSION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxMode {
    Always,
    Never,
    #[default]
    Auto,
}

impl SandboxMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "always" => SandboxMode::Always,
            "never" => SandboxMode::Never,
            _ => SandboxMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SandboxSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub run_count: u64,
}

/// Wraps run requests in the configured container runtime and keeps
/// per-session bookkeeping. Distinct sessions yield distinct
/// `MCP_SANDBOX_SESSION` values inside the container.
pub struct SandboxManager {
    config: Arc<Config>,
    sessions: Mutex<HashMap<String, SandboxSession>>,
}

impl SandboxManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.sandbox.enabled
    }

    /// Whether a request with the given mode should run in the container.
    pub fn should_sandbox(&self, mode: SandboxMode) -> bool {
        match mode {
            SandboxMode::Always => self.enabled(),
            SandboxMode::Never => false,
            SandboxMode::Auto => self.enabled(),
        }
    }

    /// Rewrite `request` into a container invocation. The request's cwd
    /// must be inside the workspace root; anything else fails closed.
    pub fn wrap(&self, request: RunRequest, session_id: &str) -> std::io::Result<RunRequest> {
        let sandbox = &self.config.sandbox;
        let workspace = &self.config.workspace_root;

        if let Some(cwd) = &request.cwd
            && !path_within(cwd, workspace)
        {
            return Err(std::io::Error::other(format!(
                "cwd {} escapes the workspace root",
                cwd.display()
            )));
        }

        let mut args: Vec<String> = vec!["run".to_string(), "--rm".to_string()];

        let network_mode = if sandbox.allow_networking {
            sandbox.network_mode.as_str()
        } else {
            "none"
        };
        args.push("--network".to_string());
        args.push(network_mode.to_string());

        if sandbox.mount_workspace {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}",
                workspace.display(),
                sandbox.container_workspace
            ));
        }
        for mount in &sandbox.extra_mounts {
            args.push("-v".to_string());
            args.push(mount.clone());
        }

        for key in &sandbox.passthrough_env {
            if let Ok(value) = std::env::var(key) {
                args.push("-e".to_string());
                args.push(format!("{key}={value}"));
            }
        }
        args.push("-e".to_string());
        args.push(format!("{SANDBOX_SESSION_ENV_VAR}={session_id}"));

        if let Some(user) = &sandbox.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if let Some(entrypoint) = &sandbox.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.push("-w".to_string());
        args.push(sandbox.container_workspace.clone());
        args.push(sandbox.image.clone());

        if request.shell {
            args.push("sh".to_string());
            args.push("-c".to_string());
            let mut line = request.command.clone();
            for arg in &request.args {
                line.push(' ');
                line.push_str(arg);
            }
            args.push(line);
        } else {
            args.push(request.command.clone());
            args.extend(request.args.iter().cloned());
        }

        self.touch(session_id);
        debug!("sandboxing command via {} {:?}", sandbox.runtime, args);

        Ok(RunRequest {
            command: sandbox.runtime.clone(),
            args,
            cwd: None,
            env: HashMap::new(),
            input: request.input,
            timeout_ms: Some(request.timeout_ms.unwrap_or(sandbox.timeout_ms)),
            max_buffer: request.max_buffer,
            shell: false,
        })
    }

    fn touch(&self, session_id: &str) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        let now = Utc::now();
        sessions
            .entry(session_id.to_string())
            .and_modify(|session| {
                session.last_used_at = now;
                session.run_count += 1;
            })
            .or_insert_with(|| SandboxSession {
                id: session_id.to_string(),
                created_at: now,
                last_used_at: now,
                run_count: 1,
            });
    }

    pub fn list_sessions(&self) -> Vec<SandboxSession> {
        let Ok(sessions) = self.sessions.lock() else {
            return Vec::new();
        };
        let mut list: Vec<SandboxSession> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn release_session(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .map(|mut sessions| sessions.remove(session_id).is_some())
            .unwrap_or(false)
    }
}

fn path_within(path: &Path, root: &Path) -> bool {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    canonical.starts_with(&root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap as StdHashMap;

    fn manager(workspace: &Path) -> SandboxManager {
        let vars: StdHashMap<String, String> = [
            ("MCP_SANDBOX_ENABLED", "true"),
            ("MCP_SANDBOX_IMAGE", "test-image"),
            ("MCP_SANDBOX_RUNTIME", "docker"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain(std::iter::once((
            "WORKSPACE_ROOT".to_string(),
            workspace.display().to_string(),
        )))
        .collect();
        SandboxManager::new(Arc::new(Config::from_env_map(&vars)))
    }

    #[test]
    fn wrap_builds_container_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let wrapped = manager
            .wrap(
                RunRequest {
                    command: "echo hi".to_string(),
                    shell: true,
                    ..Default::default()
                },
                "sess-1",
            )
            .unwrap();
        assert_eq!(wrapped.command, "docker");
        assert!(wrapped.args.starts_with(&["run".to_string(), "--rm".to_string()]));
        assert!(wrapped.args.contains(&"--network".to_string()));
        assert!(wrapped.args.contains(&"none".to_string()));
        assert!(wrapped.args.contains(&"test-image".to_string()));
        assert!(
            wrapped
                .args
                .contains(&format!("{SANDBOX_SESSION_ENV_VAR}=sess-1"))
        );
        assert_eq!(wrapped.args.last().unwrap(), "echo hi");
    }

    #[test]
    fn cwd_outside_workspace_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let result = manager.wrap(
            RunRequest {
                command: "ls".to_string(),
                cwd: Some("/etc".into()),
                ..Default::default()
            },
            "sess-1",
        );
        assert!(result.is_err());
    }

    #[test]
    fn session_bookkeeping_counts_runs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager
            .wrap(
                RunRequest {
                    command: "true".to_string(),
                    ..Default::default()
                },
                "s-1",
            )
            .unwrap();
        manager
            .wrap(
                RunRequest {
                    command: "true".to_string(),
                    ..Default::default()
                },
                "s-1",
            )
            .unwrap();
        let sessions = manager.list_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].run_count, 2);
        assert!(manager.release_session("s-1"));
        assert!(manager.list_sessions().is_empty());
        assert!(!manager.release_session("s-1"));
    }
}
