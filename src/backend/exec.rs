//! Interactive execution through a local PTY.
//!
//! A session runs four concurrent loops until the process exits:
//!
//! - output: PTY master to the stdout sink
//! - input: byte source to the PTY master
//! - resize: size source to `TIOCSWINSZ`
//! - the child itself
//!
//! When the client goes away the end-of-transmission byte is written so the
//! remote shell can exit on its own; if it has not exited after the grace
//! period it is killed.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::kubectl::Kubectl;
use super::pty::{self, PtyPair};
use super::{cli, BackendError, ExecBackend, ExecRequest, ExecStreams, PodTarget};
use crate::bridges::terminal::is_client_gone;
use crate::bridges::{BridgeError, ByteSink, ByteSource, SizeSource};

/// Time allowed for `capture` calls.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

/// How commands are started.
#[derive(Debug, Clone)]
pub enum Launcher {
    /// `kubectl exec -i -t` into the target container.
    Kubectl(Kubectl),
    /// Run the command on this host, ignoring the target. Used for local
    /// development and tests.
    Direct,
}

#[derive(Debug, Clone)]
pub struct PtyExec {
    launcher: Launcher,
    grace: Duration,
}

enum InputEnd {
    /// Client input ended; the trailing bytes were delivered.
    Closed(BridgeError),
    /// The PTY stopped accepting input, the process is going away.
    PtyGone,
}

impl PtyExec {
    pub fn new(launcher: Launcher, grace: Duration) -> Self {
        Self { launcher, grace }
    }

    fn command_line(
        &self,
        target: &PodTarget,
        tty: bool,
        command: &[String],
    ) -> Result<(String, Vec<String>), BackendError> {
        match &self.launcher {
            Launcher::Kubectl(kubectl) => {
                target.validate()?;
                Ok((
                    kubectl.program().to_string(),
                    kubectl.exec_args(target, tty, command),
                ))
            }
            Launcher::Direct => {
                let (program, args) = command
                    .split_first()
                    .ok_or_else(|| BackendError::InvalidRequest("empty command".into()))?;
                Ok((program.clone(), args.to_vec()))
            }
        }
    }

    fn describe(&self) -> &'static str {
        match self.launcher {
            Launcher::Kubectl(_) => "kubectl exec",
            Launcher::Direct => "exec",
        }
    }
}

async fn pump_output(mut reader: tokio::fs::File, sink: Arc<dyn ByteSink>) -> Result<(), BridgeError> {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            // EIO once every slave handle is closed.
            Ok(0) | Err(_) => return Ok(()),
            Ok(n) => sink.write(&buf[..n]).await?,
        }
    }
}

async fn pump_input(mut writer: tokio::fs::File, source: Arc<dyn ByteSource>) -> InputEnd {
    loop {
        match source.read().await {
            Ok(bytes) if bytes.is_empty() => continue,
            Ok(bytes) => {
                if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                    return InputEnd::PtyGone;
                }
            }
            Err(closed) => {
                if !closed.trailing.is_empty() {
                    let _ = writer.write_all(&closed.trailing).await;
                    let _ = writer.flush().await;
                }
                return InputEnd::Closed(closed.cause);
            }
        }
    }
}

async fn apply_resizes(master: &OwnedFd, sizes: Arc<dyn SizeSource>) {
    while let Some(size) = sizes.next_size().await {
        if let Err(e) = pty::resize_pty(master, size) {
            debug!("resize to {}x{} failed: {e}", size.cols, size.rows);
        }
    }
    std::future::pending::<()>().await;
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("kill failed: {e}");
    }
}

#[async_trait]
impl ExecBackend for PtyExec {
    async fn stream(
        &self,
        request: &ExecRequest,
        streams: ExecStreams,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        let (program, args) = self.command_line(&request.target, true, &request.command)?;
        let pair = pty::allocate_pty(request.initial_size)
            .map_err(|e| BackendError::Io(std::io::Error::from(e)))?;
        let mut child = pty::spawn_in_pty(&pair, &program, &args).map_err(|e| BackendError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        let PtyPair { master, slave } = pair;
        // The child holds its own copy; ours would keep the master from
        // seeing end of output.
        drop(slave);
        let (reader, writer) = pty::master_io(&master)?;

        let output = pump_output(reader, Arc::clone(&streams.stdout));
        let input = pump_input(writer, Arc::clone(&streams.stdin));
        let resize = apply_resizes(&master, Arc::clone(&streams.resize));
        tokio::pin!(output, input, resize);
        let mut output_done = false;
        let mut input_done = false;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    kill(&mut child).await;
                    return Ok(());
                }
                status = child.wait() => {
                    let status = status?;
                    if !output_done {
                        // Flush what the process wrote before exiting.
                        let _ = tokio::time::timeout(self.grace, &mut output).await;
                    }
                    return match status.code() {
                        Some(0) => Ok(()),
                        Some(code) => Err(BackendError::Failed {
                            command: self.describe().into(),
                            message: format!("command terminated with exit code {code}"),
                        }),
                        None => Err(BackendError::Failed {
                            command: self.describe().into(),
                            message: format!("command terminated by {status}"),
                        }),
                    };
                }
                result = &mut output, if !output_done => {
                    output_done = true;
                    if let Err(e) = result {
                        warn!("terminal output failed: {e}");
                        kill(&mut child).await;
                        return Err(e.into());
                    }
                }
                end = &mut input, if !input_done => {
                    input_done = true;
                    match end {
                        InputEnd::PtyGone => {}
                        InputEnd::Closed(cause) if is_client_gone(&cause) => {
                            if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
                                debug!("process still running {:?} after client left", self.grace);
                                kill(&mut child).await;
                            }
                            // Only an explicit close is a normal end; a dropped
                            // connection is still a transport failure.
                            return match cause {
                                BridgeError::ClientClosed => Ok(()),
                                lost => Err(lost.into()),
                            };
                        }
                        InputEnd::Closed(cause) => {
                            kill(&mut child).await;
                            return Err(cause.into());
                        }
                    }
                }
                () = &mut resize => {}
            }
        }
    }

    async fn capture(&self, target: &PodTarget, command: &[String]) -> Result<String, BackendError> {
        let (program, args) = self.command_line(target, false, command)?;
        cli::run(&program, &args, None, CAPTURE_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::bridges::InputClosed;
    use crate::config::KubeConfig;
    use crate::protocol::END_OF_TRANSMISSION;
    use crate::sessions::resize::TerminalSize;

    /// Scripted client input. Ends with `end` once the chunks run out.
    struct ScriptedInput {
        chunks: Mutex<VecDeque<Vec<u8>>>,
        end: Option<BridgeError>,
    }

    impl ScriptedInput {
        fn new(chunks: &[&[u8]], end: Option<BridgeError>) -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(chunks.iter().map(|c| c.to_vec()).collect()),
                end,
            })
        }
    }

    #[async_trait]
    impl ByteSource for ScriptedInput {
        async fn read(&self) -> Result<Vec<u8>, InputClosed> {
            let next = self.chunks.lock().unwrap().pop_front();
            if let Some(chunk) = next {
                return Ok(chunk);
            }
            match &self.end {
                Some(cause) => Err(InputClosed {
                    trailing: vec![END_OF_TRANSMISSION],
                    cause: cause.clone(),
                }),
                None => std::future::pending().await,
            }
        }
    }

    struct Collect(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl ByteSink for Collect {
        async fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
            let _ = self.0.send(bytes.to_vec());
            Ok(())
        }
    }

    struct NoResize;

    #[async_trait]
    impl SizeSource for NoResize {
        async fn next_size(&self) -> Option<TerminalSize> {
            None
        }
    }

    fn direct() -> PtyExec {
        PtyExec::new(Launcher::Direct, Duration::from_millis(500))
    }

    fn request(command: &[&str]) -> ExecRequest {
        ExecRequest {
            target: PodTarget::default(),
            command: command.iter().map(ToString::to_string).collect(),
            initial_size: TerminalSize::new(24, 80),
        }
    }

    fn streams(input: Arc<ScriptedInput>) -> (ExecStreams, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ExecStreams {
                stdin: input,
                stdout: Arc::new(Collect(tx)),
                stderr: None,
                resize: Arc::new(NoResize),
            },
            rx,
        )
    }

    fn collected(mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> String {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend(chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn input_is_echoed_and_process_exit_is_ok() {
        let input = ScriptedInput::new(&[b"", b"echo hello\n", b"exit 0\n"], None);
        let (streams, rx) = streams(input);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            direct().stream(&request(&["sh"]), streams, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert!(collected(rx).contains("hello"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let input = ScriptedInput::new(&[], None);
        let (streams, _rx) = streams(input);
        let err = direct()
            .stream(&request(&["sh", "-c", "exit 3"]), streams, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "command terminated with exit code 3");
    }

    #[tokio::test]
    async fn client_close_sends_eot_to_the_shell() {
        // `cat` on a terminal exits on EOT at the start of a line.
        let input = ScriptedInput::new(&[], Some(BridgeError::ClientClosed));
        let (streams, _rx) = streams(input);
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            direct().stream(&request(&["cat"]), streams, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dropped_connection_ends_with_a_transport_error() {
        let input = ScriptedInput::new(
            &[],
            Some(BridgeError::Transport(crate::transport::TransportError::Closed)),
        );
        let (streams, _rx) = streams(input);
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            direct().stream(&request(&["cat"]), streams, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Stream(BridgeError::Transport(crate::transport::TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn protocol_error_kills_the_process() {
        let input = ScriptedInput::new(
            &[],
            Some(BridgeError::UnknownOp(crate::protocol::Op::Bind)),
        );
        let (streams, _rx) = streams(input);
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            direct().stream(&request(&["sleep", "30"]), streams, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, BackendError::Stream(BridgeError::UnknownOp(_))));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let input = ScriptedInput::new(&[], None);
        let (streams, _rx) = streams(input);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { direct().stream(&request(&["sleep", "30"]), streams, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn capture_returns_stdout() {
        let out = direct()
            .capture(&PodTarget::default(), &["sh".into(), "-c".into(), "echo /bin/bash".into()])
            .await
            .unwrap();
        assert_eq!(out, "/bin/bash\n");
    }

    #[test]
    fn kubectl_launcher_builds_exec_args() {
        let exec = PtyExec::new(
            Launcher::Kubectl(Kubectl::new(&KubeConfig::default())),
            Duration::from_secs(1),
        );
        let target = PodTarget {
            name: "web-0".into(),
            namespace: "apps".into(),
            container: "app".into(),
        };
        let (program, args) = exec.command_line(&target, true, &["bash".into()]).unwrap();
        assert_eq!(program, "kubectl");
        assert_eq!(
            args,
            vec!["exec", "-i", "-t", "web-0", "--namespace=apps", "--container=app", "--", "bash"]
        );
    }

    #[test]
    fn kubectl_launcher_rejects_flag_like_pods() {
        let exec = PtyExec::new(
            Launcher::Kubectl(Kubectl::new(&KubeConfig::default())),
            Duration::from_secs(1),
        );
        let target = PodTarget {
            name: "--kubeconfig=/tmp/other".into(),
            namespace: "apps".into(),
            container: String::new(),
        };
        let err = exec.command_line(&target, true, &["bash".into()]).unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[test]
    fn direct_launcher_rejects_empty_command() {
        assert!(direct().command_line(&PodTarget::default(), true, &[]).is_err());
    }
}
