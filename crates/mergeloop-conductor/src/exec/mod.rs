//! Subprocess execution shared by the command oracle, the `gh` host, and the
//! shell test runner.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured output of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// `exit N: <stderr>` with secrets masked and length capped, for error messages.
    pub fn failure_detail(&self) -> String {
        let stream = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        format!(
            "exit {}: {}",
            self.exit_code.unwrap_or(-1),
            truncate(&mask_secrets(stream), 2000).trim()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
}

impl ExecError {
    /// True when the program itself is not installed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Shell program and args for the current platform.
#[cfg(windows)]
pub fn shell_cmd(cmd: &str) -> (String, Vec<String>) {
    // Prefer PowerShell over cmd.exe for better Unix-ism support
    static SHELL: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    let shell = SHELL.get_or_init(|| {
        if which_exists("pwsh") {
            "pwsh".into()
        } else if which_exists("powershell") {
            "powershell".into()
        } else {
            "cmd.exe".into()
        }
    });

    if shell == "cmd.exe" {
        (shell.clone(), vec!["/C".into(), cmd.into()])
    } else {
        (
            shell.clone(),
            vec!["-NoProfile".into(), "-Command".into(), cmd.into()],
        )
    }
}

#[cfg(not(windows))]
pub fn shell_cmd(cmd: &str) -> (String, Vec<String>) {
    ("sh".into(), vec!["-c".into(), cmd.into()])
}

#[cfg(windows)]
fn which_exists(name: &str) -> bool {
    std::process::Command::new("where")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run a shell command line with a timeout.
pub async fn run_shell(
    cmd: &str,
    cwd: &Path,
    timeout_sec: u64,
    stdin: Option<&[u8]>,
) -> Result<CommandOutput, ExecError> {
    let (shell, args) = shell_cmd(cmd);
    run_program(&shell, &args, cwd, timeout_sec, stdin).await
}

/// Run a program with a timeout. The child is killed if the timeout fires.
/// `stdin` is written concurrently with output collection, so large requests
/// cannot deadlock against a child that writes before it finishes reading.
pub async fn run_program(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout_sec: u64,
    stdin: Option<&[u8]>,
) -> Result<CommandOutput, ExecError> {
    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let input = stdin.map(<[u8]>::to_vec);
    let pipe = child.stdin.take();
    let run = async move {
        let writer = async move {
            if let (Some(bytes), Some(mut pipe)) = (input, pipe) {
                // A child that exits without reading stdin is not an error here.
                let _ = pipe.write_all(&bytes).await;
            }
        };
        let (_, output) = tokio::join!(writer, child.wait_with_output());
        output
    };

    match tokio::time::timeout(Duration::from_secs(timeout_sec), run).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        }),
        Ok(Err(source)) => Err(ExecError::Io {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(ExecError::Timeout {
            program: program.to_string(),
            secs: timeout_sec,
        }),
    }
}

/// Mask secrets in output strings before storing.
pub fn mask_secrets(text: &str) -> String {
    let patterns = [
        // API keys
        (r"sk-[a-zA-Z0-9_\-]{20,}", "[MASKED]"),
        (r"gh[pousr]_[A-Za-z0-9]{20,}", "[MASKED]"),
        // Bearer tokens
        (r"Bearer\s+[a-zA-Z0-9._\-]+", "Bearer [MASKED]"),
        // key=value patterns
        (
            r"(?i)(password|secret|token|key|api_key|apikey)=[^\s&]+",
            "$1=[MASKED]",
        ),
    ];

    let mut result = text.to_string();
    for (pattern, replacement) in patterns {
        if let Ok(re) = regex::Regex::new(pattern) {
            result = re.replace_all(&result, replacement).into_owned();
        }
    }
    result
}

/// Cap `text` at `max` bytes on a char boundary, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
