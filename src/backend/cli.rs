//! One-shot invocation of the cluster command-line tools.
//!
//! Every non-interactive `kubectl`/`helm` call goes through [`run`]. The child
//! is spawned with `kill_on_drop(true)`, so a timed-out or abandoned call
//! does not leave the process behind.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::BackendError;

/// Max bytes kept per stream. List output of a large cluster is big, so this
/// is generous; the rest is drained and dropped.
const MAX_OUTPUT: usize = 64 * 1024 * 1024;

/// Short human-readable form of an invocation, used in errors.
pub fn describe(program: &str, args: &[String]) -> String {
    let verb: Vec<&str> = args
        .iter()
        .take_while(|a| !a.starts_with('-'))
        .take(2)
        .map(String::as_str)
        .collect();
    if verb.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", verb.join(" "))
    }
}

/// Run `program args`, feeding `input` on stdin, and return its stdout.
///
/// A non-zero exit is reported as [`BackendError::Failed`] carrying the
/// trimmed stderr.
pub async fn run(
    program: &str,
    args: &[String],
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<String, BackendError> {
    let command = describe(program, args);
    debug!("Running {program} {}", args.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(|e| BackendError::Spawn {
        program: program.to_string(),
        reason: e.to_string(),
    })?;

    let mut stdout = child.stdout.take().ok_or_else(|| BackendError::Spawn {
        program: program.to_string(),
        reason: "stdout pipe unavailable".into(),
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| BackendError::Spawn {
        program: program.to_string(),
        reason: "stderr pipe unavailable".into(),
    })?;
    let stdin = child.stdin.take();

    let work = async {
        let feed = async {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                // The tool may exit before reading everything; its stderr
                // explains why, so a broken pipe here is not the error.
                let _ = pipe.write_all(bytes).await;
                let _ = pipe.shutdown().await;
            }
        };
        let ((), out, err) = tokio::join!(
            feed,
            read_capped(&mut stdout, MAX_OUTPUT),
            read_capped(&mut stderr, MAX_OUTPUT),
        );
        let status = child.wait().await?;
        Ok::<_, BackendError>((status, out, err))
    };

    let (status, out, err) = tokio::time::timeout(timeout, work)
        .await
        .map_err(|_| BackendError::Timeout(command.clone()))??;

    if status.success() {
        Ok(String::from_utf8_lossy(&out).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&err).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{command} exited with {status}")
        } else {
            stderr
        };
        Err(BackendError::Failed { command, message })
    }
}

/// Read everything from `reader`, keeping the first `max_bytes`.
///
/// Reading continues past the cap so the child never blocks on a full pipe.
pub async fn read_capped(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    max_bytes: usize,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    buf
}
