//! Runs registry commands as child processes.
//!
//! Only standard output travels back to the peer, and at most
//! [`MAX_OUTPUT_SIZE`] bytes of it.

use crate::error::ExecError;
use crate::protocol::MAX_OUTPUT_SIZE;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub exit_status: i32,
}

/// Run `program` with `arguments`, returning its standard output and status.
///
/// The child inherits the daemon's environment with `environment` layered on
/// top. `input` is written to its standard input, which is closed afterwards
/// (empty input means a null stdin). Standard error is logged, not returned.
/// No timeout is applied here; if the caller gives up and drops this future
/// the child keeps running and is reaped by the runtime once it exits.
pub async fn run_command(
    program: &Path,
    arguments: &[String],
    environment: &BTreeMap<String, String>,
    input: &[u8],
) -> Result<ExecOutput, ExecError> {
    run_with_limit(program, arguments, environment, input, MAX_OUTPUT_SIZE).await
}

async fn run_with_limit(
    program: &Path,
    arguments: &[String],
    environment: &BTreeMap<String, String>,
    input: &[u8],
    limit: usize,
) -> Result<ExecOutput, ExecError> {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());

    tracing::info!("Executing {} {:?}", program.display(), arguments);

    let stdin = if input.is_empty() {
        Stdio::null()
    } else {
        Stdio::piped()
    };
    let mut child = Command::new(program)
        .args(arguments)
        .envs(environment)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExecError::Spawn {
            command: name.clone(),
            source,
        })?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        ExecError::Io(std::io::Error::other("child stdout was not captured"))
    })?;
    let stderr = child.stderr.take();

    if let Some(mut stdin) = child.stdin.take() {
        let input = input.to_vec();
        let name = name.clone();
        tokio::spawn(async move {
            // A command may exit without reading its input.
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(command = %name, "stdin closed early: {}", e);
            }
        });
    }

    let stderr_task = tokio::spawn({
        let name = name.clone();
        async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(command = %name, "stderr: {}", line);
            }
        }
    });

    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if output.len() + n > limit {
            tracing::warn!(command = %name, "Output exceeds {} bytes, killing command", limit);
            let _ = child.kill().await;
            stderr_task.abort();
            return Err(ExecError::OutputTooLarge {
                command: name,
                limit,
            });
        }
        tracing::trace!(command = %name, "Captured {} bytes of output", n);
        output.extend_from_slice(&buf[..n]);
    }

    let status = child.wait().await?;
    let _ = stderr_task.await;

    let exit_status = match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    };

    tracing::info!(
        "Command {} exited with status {} ({} bytes of output)",
        name,
        exit_status,
        output.len()
    );

    Ok(ExecOutput {
        stdout: output,
        exit_status,
    })
}
