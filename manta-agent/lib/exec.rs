use std::{process::Stdio, time::Duration};

use manta_rpc::{ExecRequest, ExecResponse};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{io::AsyncReadExt, process::Command};

use crate::{AgentError, AgentResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Exec timeout when the request doesn't carry one.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-stream output cap when the request doesn't carry one.
const DEFAULT_MAX_OUTPUT_BYTES: u64 = 1 << 20;

/// The exit code reported for a command killed by the timeout, matching the
/// shell convention for SIGTERM-after-timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs a guest command per the exec contract.
///
/// The command gets its own process group so the timeout can kill the whole
/// tree, and each output stream is capped at `max_output_bytes` by a limited
/// reader (output past the cap is dropped, not buffered).
pub async fn run_exec(request: &ExecRequest) -> AgentResult<ExecResponse> {
    let timeout = if request.timeout_ms > 0 {
        Duration::from_millis(request.timeout_ms as u64)
    } else {
        DEFAULT_EXEC_TIMEOUT
    };
    let max_output = if request.max_output_bytes > 0 {
        request.max_output_bytes as u64
    } else {
        DEFAULT_MAX_OUTPUT_BYTES
    };

    let argv = normalize_argv(request)?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = request.cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        command.current_dir(cwd);
    }
    for entry in &request.env {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout, max_output));
    let stderr_task = tokio::spawn(read_capped(stderr, max_output));

    let (timed_out, status) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (false, Some(status?)),
        Err(_) => {
            if let Some(pgid) = pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            // Reap so the readers see EOF and the zombie goes away.
            let _ = child.wait().await;
            (true, None)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status
            .and_then(|s| s.code())
            // Killed by a signal; report shell-style 128+signo when known.
            .unwrap_or(1)
    };

    Ok(ExecResponse {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
    })
}

/// Resolves the shell/argv contract into the argv actually spawned.
pub fn normalize_argv(request: &ExecRequest) -> AgentResult<Vec<String>> {
    let cmd = request.cmd.as_deref().unwrap_or("").trim();

    if request.use_shell {
        if cmd.is_empty() {
            return Err(AgentError::invalid("use_shell set but cmd is empty"));
        }
        return Ok(vec!["/bin/sh".into(), "-lc".into(), cmd.to_string()]);
    }

    if request.argv.is_empty() {
        if !cmd.is_empty() {
            return Err(AgentError::invalid(
                "cmd provided without use_shell; provide argv or set use_shell",
            ));
        }
        return Err(AgentError::invalid("argv is required when not using shell"));
    }

    Ok(request.argv.clone())
}

async fn read_capped<R>(reader: Option<R>, cap: u64) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };

    let mut buf = Vec::new();
    let mut limited = reader.take(cap);
    if limited.read_to_end(&mut buf).await.is_err() {
        return buf;
    }

    // Drain whatever exceeds the cap so the child never blocks on a full
    // pipe, then throw it away.
    let mut inner = limited.into_inner();
    let mut sink = [0u8; 8192];
    while matches!(inner.read(&mut sink).await, Ok(n) if n > 0) {}

    buf
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_request(cmd: &str) -> ExecRequest {
        ExecRequest {
            use_shell: true,
            cmd: Some(cmd.to_string()),
            argv: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout_ms: 5000,
            max_output_bytes: 1 << 20,
        }
    }

    #[test]
    fn test_normalize_argv_contract() {
        let shell = shell_request("echo hi");
        assert_eq!(
            normalize_argv(&shell).unwrap(),
            vec!["/bin/sh", "-lc", "echo hi"]
        );

        let direct = ExecRequest {
            use_shell: false,
            cmd: None,
            argv: vec!["true".into()],
            cwd: None,
            env: Vec::new(),
            timeout_ms: 0,
            max_output_bytes: 0,
        };
        assert_eq!(normalize_argv(&direct).unwrap(), vec!["true"]);

        let mut bad = shell_request("");
        bad.cmd = Some("   ".into());
        assert!(normalize_argv(&bad).is_err());

        let cmd_without_shell = ExecRequest {
            use_shell: false,
            cmd: Some("echo hi".into()),
            argv: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout_ms: 0,
            max_output_bytes: 0,
        };
        assert!(normalize_argv(&cmd_without_shell).is_err());
    }

    #[tokio::test]
    async fn test_exec_shell_captures_output() -> anyhow::Result<()> {
        let resp = run_exec(&shell_request("echo hello; echo err >&2")).await?;
        assert_eq!(resp.exit_code, 0);
        // A login shell may prepend profile noise; the command output itself
        // must be intact.
        assert!(resp.stdout.ends_with("hello\n"));
        assert!(resp.stderr.ends_with("err\n"));
        assert!(!resp.timed_out);
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_argv_mode() -> anyhow::Result<()> {
        let resp = run_exec(&ExecRequest {
            use_shell: false,
            cmd: None,
            argv: vec!["sh".into(), "-c".into(), "exit 3".into()],
            cwd: None,
            env: Vec::new(),
            timeout_ms: 5000,
            max_output_bytes: 0,
        })
        .await?;
        assert_eq!(resp.exit_code, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_timeout_kills_and_reports_124() -> anyhow::Result<()> {
        let mut request = shell_request("sleep 5");
        request.timeout_ms = 100;

        let start = std::time::Instant::now();
        let resp = run_exec(&request).await?;

        assert!(resp.timed_out);
        assert_eq!(resp.exit_code, TIMEOUT_EXIT_CODE);
        assert!(start.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_output_is_truncated_at_cap() -> anyhow::Result<()> {
        let mut request = shell_request("yes x | head -c 100000");
        request.max_output_bytes = 1024;

        let resp = run_exec(&request).await?;
        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.stdout.len(), 1024);
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_env_and_cwd() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut request = shell_request("echo -n \"$MANTA_TEST_VAR:$(pwd)\"");
        request.env = vec!["MANTA_TEST_VAR=value42".to_string()];
        request.cwd = Some(dir.path().display().to_string());

        let resp = run_exec(&request).await?;
        assert_eq!(resp.exit_code, 0);
        assert!(resp.stdout.contains("value42:"));
        Ok(())
    }
}
