use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cam_motion_common::config::{DecoderConfig, ReconnectConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const READ_BUF_SIZE: usize = 64 * 1024;
const OUTPUT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn decoder: {0}")]
    Spawn(String),
    #[error("decoder {0} is not piped")]
    MissingPipe(&'static str),
    #[error("decoder failed {attempts} consecutive attempts, giving up")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Reconnecting,
    Failed,
}

/// What the supervisor delivers, in stdout order.
///
/// The channel closing without a `Failed` means the decoder exited with
/// status 0 or the supervisor was stopped.
#[derive(Debug, Clone)]
pub enum DecoderOutput {
    Chunk(Bytes),
    Failed(SupervisorError),
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

/// Program and arguments for the external decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DecoderCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// ffmpeg invocation that writes one baseline JPEG per frame to stdout.
    pub fn from_config(config: &DecoderConfig, source_uri: &str) -> Self {
        if let Some(template) = &config.args {
            let args = template
                .iter()
                .map(|arg| arg.replace("{uri}", source_uri))
                .collect();
            return Self::new(config.program.clone(), args);
        }

        let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostats".into()];
        if source_uri.starts_with("rtsp://") || source_uri.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend(config.extra_args.iter().cloned());
        args.extend([
            "-i".into(),
            source_uri.into(),
            "-vf".into(),
            format!("scale={}:{}", config.width, config.height),
            "-f".into(),
            "image2pipe".into(),
            "-c:v".into(),
            "mjpeg".into(),
            "-q:v".into(),
            config.quality.to_string(),
            "-r".into(),
            config.fps.to_string(),
            "-an".into(),
            "-".into(),
        ]);
        Self::new(config.program.clone(), args)
    }

    fn spawn(&self) -> Result<Child, SupervisorError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {e}", self.program)))
    }
}

/// Renders the command line with URI credentials masked.
impl fmt::Display for DecoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", redact_credentials(arg))?;
        }
        Ok(())
    }
}

fn redact_credentials(arg: &str) -> String {
    let Some((scheme, rest)) = arg.split_once("://") else {
        return arg.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => arg.to_string(),
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps one external decoder process alive.
///
/// `start` spawns the decoder and hands back an ordered channel of its stdout.
/// A non-zero exit is retried after a fixed delay until `max_attempts`
/// consecutive attempts have failed; the first byte of output from any attempt
/// proves the connection and resets the count to 1.
pub struct ProcessSupervisor {
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<SupervisorState>>,
    attempts: Arc<AtomicU32>,
    spawns: Arc<AtomicU32>,
    running: Option<Running>,
}

impl ProcessSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            policy,
            state: Arc::new(state),
            attempts: Arc::new(AtomicU32::new(0)),
            spawns: Arc::new(AtomicU32::new(0)),
            running: None,
        }
    }

    /// Spawn the decoder. Any decoder still running is stopped first.
    ///
    /// A spawn failure here is terminal: the supervisor moves to `Failed`
    /// and makes no further attempts.
    pub async fn start(
        &mut self,
        command: DecoderCommand,
    ) -> Result<mpsc::Receiver<DecoderOutput>, SupervisorError> {
        self.stop().await;
        self.spawns.store(0, Ordering::SeqCst);
        self.state.send_replace(SupervisorState::Starting);

        info!(command = %command, "spawning decoder");
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "decoder failed to start");
                self.state.send_replace(SupervisorState::Failed);
                return Err(e);
            }
        };
        self.attempts.store(1, Ordering::SeqCst);
        self.state.send_replace(SupervisorState::Running);

        let (output, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        let cancel = CancellationToken::new();
        let worker = Worker {
            command,
            policy: self.policy,
            state: Arc::clone(&self.state),
            attempts: Arc::clone(&self.attempts),
            spawns: Arc::clone(&self.spawns),
            output,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run(child));
        self.running = Some(Running { cancel, task });
        Ok(rx)
    }

    /// Kill the decoder if there is one and reset to `Stopped`. Idempotent.
    ///
    /// Returns once the process has been reaped.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!(error = %e, "supervisor task ended abnormally");
            }
            info!("decoder stopped");
        }
        self.attempts.store(0, Ordering::SeqCst);
        self.state.send_replace(SupervisorState::Stopped);
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Consecutive attempt number of the current decoder process.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Spawn attempts made since the last `start`.
    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

enum Outcome {
    /// Stop requested, or nobody is listening any more.
    Cancelled,
    Exited(std::io::Result<ExitStatus>),
}

struct Worker {
    command: DecoderCommand,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<SupervisorState>>,
    attempts: Arc<AtomicU32>,
    spawns: Arc<AtomicU32>,
    output: mpsc::Sender<DecoderOutput>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut child: Child) {
        loop {
            match self.supervise(&mut child).await {
                Outcome::Cancelled => {
                    if let Err(e) = child.kill().await {
                        debug!(error = %e, "decoder already gone");
                    }
                    self.state.send_replace(SupervisorState::Stopped);
                    return;
                }
                Outcome::Exited(Ok(status)) if status.success() => {
                    info!("decoder exited cleanly, not reconnecting");
                    self.state.send_replace(SupervisorState::Stopped);
                    return;
                }
                Outcome::Exited(Ok(status)) => {
                    warn!(
                        code = ?status.code(),
                        attempt = self.attempts.load(Ordering::SeqCst),
                        max_attempts = self.policy.max_attempts,
                        "decoder exited unexpectedly"
                    );
                }
                Outcome::Exited(Err(e)) => {
                    warn!(error = %e, "failed to wait for decoder");
                }
            }

            match self.respawn().await {
                Some(next) => child = next,
                None => return,
            }
        }
    }

    /// Pump stdout into the output channel, then wait for the exit status.
    async fn supervise(&self, child: &mut Child) -> Outcome {
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }
        let Some(mut stdout) = child.stdout.take() else {
            warn!(error = %SupervisorError::MissingPipe("stdout"), "decoder unusable");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "decoder already gone");
            }
            return Outcome::Exited(child.wait().await);
        };

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut first_chunk = true;
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                read = stdout.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    if first_chunk {
                        first_chunk = false;
                        let previous = self.attempts.load(Ordering::SeqCst);
                        if previous > 1 {
                            self.attempts.store(1, Ordering::SeqCst);
                            info!(
                                after_attempts = previous,
                                "decoder connected, attempt counter reset"
                            );
                        } else {
                            debug!("decoder producing output");
                        }
                    }
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if !self.emit(DecoderOutput::Chunk(chunk)).await {
                        return Outcome::Cancelled;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "decoder stdout read failed");
                    break;
                }
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Outcome::Cancelled,
            status = child.wait() => Outcome::Exited(status),
        }
    }

    /// Wait out the reconnect delay and spawn again. `None` once the attempt
    /// budget is spent or a stop was requested.
    async fn respawn(&self) -> Option<Child> {
        loop {
            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= self.policy.max_attempts {
                error!(
                    attempts = attempt,
                    "decoder failed too many times, giving up; check the source URI"
                );
                self.state.send_replace(SupervisorState::Failed);
                let failure = SupervisorError::RetriesExhausted { attempts: attempt };
                self.emit(DecoderOutput::Failed(failure)).await;
                return None;
            }

            self.state.send_replace(SupervisorState::Reconnecting);
            info!(
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = self.policy.delay.as_millis() as u64,
                "reconnecting decoder"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state.send_replace(SupervisorState::Stopped);
                    return None;
                }
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.state.send_replace(SupervisorState::Starting);
            match self.command.spawn() {
                Ok(child) => {
                    debug!(attempt, "decoder respawned");
                    self.state.send_replace(SupervisorState::Running);
                    return Some(child);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "decoder respawn failed");
                }
            }
        }
    }

    /// Deliver `output` unless stopped first. `false` if it could not be delivered.
    async fn emit(&self, output: DecoderOutput) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.output.send(output) => sent.is_ok(),
        }
    }
}

/// ffmpeg's stderr is diagnostics only; surface the interesting lines.
///
/// Drains until EOF so the decoder never blocks or dies on a closed pipe.
/// Lines are decoded lossily since stream metadata is not always UTF-8.
/// Returns the number of lines read.
async fn log_stderr<R: AsyncRead + Unpin>(stderr: R) -> usize {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return count,
            Ok(_) => count += 1,
            Err(e) => {
                debug!(error = %e, "decoder stderr closed");
                return count;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("Stream #") || line.contains("Input #") {
            info!(line, "decoder");
        } else if line.to_ascii_lowercase().contains("error") {
            warn!(line, "decoder reported an error");
        } else {
            trace!(line, "decoder");
        }
    }
}
