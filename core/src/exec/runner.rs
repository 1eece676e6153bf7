use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time;
use tracing::debug;
use tracing::warn;

/// Default per-stream capture bound.
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;
/// Default child timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
/// Hard ceiling on any child timeout.
pub const MAX_TIMEOUT_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub input: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_buffer: Option<usize>,
    /// When set, `command` is run through `sh -c` and `args` are appended
    /// to the command line.
    pub shell: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub exit_code: Option<i64>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_overflow: bool,
    pub stderr_overflow: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Launch a child process with bounded stdout/stderr capture and a hard
/// timeout. On timeout the child is killed with SIGKILL and `timed_out` is
/// set; the outcome is still returned, never an error.
pub async fn run_process(request: RunRequest) -> std::io::Result<RunOutcome> {
    let max_buffer = request.max_buffer.unwrap_or(DEFAULT_MAX_BUFFER).max(1);
    let timeout_ms = request
        .timeout_ms
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .clamp(1, MAX_TIMEOUT_MS);

    let mut command = if request.shell {
        let mut line = request.command.clone();
        for arg in &request.args {
            line.push(' ');
            line.push_str(arg);
        }
        let mut command = Command::new("sh");
        command.arg("-c").arg(line);
        command
    } else {
        let mut command = Command::new(&request.command);
        command.args(&request.args);
        command
    };

    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    command.envs(&request.env);
    command
        .stdin(if request.input.is_some() {
            Stdio::piped()
        } else {
            // No stdin fd, otherwise some commands hang waiting for input.
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning {:?} (shell={})", request.command, request.shell);
    let started = Instant::now();
    let mut child = command.spawn()?;

    if let Some(input) = &request.input
        && let Some(mut stdin) = child.stdin.take()
    {
        if let Err(err) = stdin.write_all(input.as_bytes()).await {
            warn!("failed to write child stdin: {err}");
        }
        drop(stdin);
    }

    let stdout_task = child
        .stdout
        .take()
        .map(|stream| tokio::spawn(read_capped(stream, max_buffer)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stream| tokio::spawn(read_capped(stream, max_buffer)));

    let mut timed_out = false;
    let status = match time::timeout(Duration::from_millis(timeout_ms), child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            timed_out = true;
            if let Err(err) = child.start_kill() {
                warn!("failed to kill timed-out child: {err}");
            }
            child.wait().await?
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let (stdout, stdout_overflow) = join_capture(stdout_task).await;
    let (stderr, stderr_overflow) = join_capture(stderr_task).await;

    Ok(RunOutcome {
        exit_code: status.code().map(i64::from),
        signal: unix_signal(&status),
        stdout,
        stderr,
        stdout_overflow,
        stderr_overflow,
        timed_out,
        duration_ms,
    })
}

/// Read a stream to EOF, retaining at most `cap` bytes. The stream is
/// drained past the cap so the child never blocks on a full pipe.
async fn read_capped<R>(mut stream: R, cap: usize) -> (String, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut retained: Vec<u8> = Vec::new();
    let mut overflow = false;
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if retained.len() < cap {
                    let take = (cap - retained.len()).min(n);
                    retained.extend_from_slice(&chunk[..take]);
                    if take < n {
                        overflow = true;
                    }
                } else {
                    overflow = true;
                }
            }
            Err(err) => {
                warn!("error reading child stream: {err}");
                break;
            }
        }
    }
    (String::from_utf8_lossy(&retained).into_owned(), overflow)
}

async fn join_capture(
    task: Option<tokio::task::JoinHandle<(String, bool)>>,
) -> (String, bool) {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => (String::new(), false),
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = run_process(RunRequest {
            command: "echo hello".to_string(),
            shell: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(!outcome.timed_out);
        assert!(!outcome.stdout_overflow);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let outcome = run_process(RunRequest {
            command: "sleep 10".to_string(),
            shell: true,
            timeout_ms: Some(100),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert_ne!(outcome.exit_code, Some(0));
        assert!(outcome.duration_ms >= 100);
    }

    #[tokio::test]
    async fn overflow_truncates_but_drains() {
        let outcome = run_process(RunRequest {
            command: "yes x | head -c 100000".to_string(),
            shell: true,
            max_buffer: Some(1024),
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(outcome.stdout_overflow);
        assert_eq!(outcome.stdout.len(), 1024);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn input_is_fed_to_stdin() {
        let outcome = run_process(RunRequest {
            command: "cat".to_string(),
            input: Some("ping".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(outcome.stdout, "ping");
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let outcome = run_process(RunRequest {
            command: "echo out; echo err 1>&2; exit 3".to_string(),
            shell: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }
}
