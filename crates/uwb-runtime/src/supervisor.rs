//! Shell pipeline supervisor.
//!
//! Spawns `bash -lc <script>` in a fresh process group so the whole pipeline
//! can be signalled atomically, merges stdout and stderr into the job's log
//! file in 4 KiB chunks without line buffering, feeds every chunk to a
//! progress consumer and keeps a 1 Hz heartbeat running while the child is
//! silent. Teardown (pid clearing, tracker finalization) is the caller's
//! scoped responsibility on every exit path; the supervisor only reports the
//! return code.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

const CHUNK_SIZE: usize = 4096;
const HEARTBEAT: Duration = Duration::from_secs(1);

/// Receives merged output chunks and periodic heartbeats.
#[async_trait]
pub trait ChunkConsumer: Send {
    async fn feed(&mut self, chunk: &str);
    async fn heartbeat(&mut self);
}

/// No-op consumer for operations that do not report progress.
pub struct NullConsumer;

#[async_trait]
impl ChunkConsumer for NullConsumer {
    async fn feed(&mut self, _chunk: &str) {}
    async fn heartbeat(&mut self) {}
}

/// A shell script to supervise, with its log destination.
pub struct ShellJob {
    pub script: String,
    pub log_path: PathBuf,
}

/// A spawned shell pipeline; `pid` is the process-group leader.
pub struct RunningShell {
    child: Child,
    pid: i64,
    output_rx: mpsc::Receiver<Vec<u8>>,
    log_file: tokio::fs::File,
}

impl ShellJob {
    pub fn new(script: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            log_path: log_path.into(),
        }
    }

    /// Spawn the pipeline. The caller must record [`RunningShell::pid`] into
    /// the job row before consuming any output.
    pub async fn spawn(&self) -> std::io::Result<RunningShell> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        let mut command = Command::new("bash");
        command
            .arg("-lc")
            .arg(&self.script)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = i64::from(child.id().ok_or_else(|| {
            std::io::Error::other("child exited before pid could be read")
        })?);

        let (tx, output_rx) = mpsc::channel::<Vec<u8>>(32);
        if let Some(stdout) = child.stdout.take() {
            spawn_chunk_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_chunk_reader(stderr, tx);
        }

        Ok(RunningShell {
            child,
            pid,
            output_rx,
            log_file,
        })
    }
}

fn spawn_chunk_reader(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        let mut stream = stream;
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    debug!(%error, "output reader exiting on read error");
                    break;
                }
            }
        }
    });
}

impl RunningShell {
    pub fn pid(&self) -> i64 {
        self.pid
    }

    /// Drain the merged output into the log file and the consumer, keeping a
    /// 1 Hz heartbeat, then reap the child and return its exit code. A child
    /// killed by a signal reports `128 + signo`.
    pub async fn stream(mut self, consumer: &mut dyn ChunkConsumer) -> std::io::Result<i64> {
        let mut ticker = tokio::time::interval(HEARTBEAT);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; use it as the initial heartbeat.
        loop {
            tokio::select! {
                chunk = self.output_rx.recv() => {
                    match chunk {
                        Some(bytes) => {
                            self.log_file.write_all(&bytes).await?;
                            self.log_file.flush().await?;
                            let text = String::from_utf8_lossy(&bytes);
                            consumer.feed(&text).await;
                        }
                        // Both readers closed: the child has no more output.
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    consumer.heartbeat().await;
                }
            }
        }

        let status = self.child.wait().await?;
        Ok(exit_code(&status))
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|s| 128 + i64::from(s)))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i64 {
    status.code().map(i64::from).unwrap_or(-1)
}

/// Process-group liveness and signalling used by the stop protocol.
#[cfg(unix)]
pub mod liveness {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    /// `kill(-pid, 0)` semantics: group present or EPERM means alive, ESRCH
    /// means dead. Falls back to a direct pid probe.
    pub fn process_group_alive(pid: i64) -> bool {
        let group = Pid::from_raw(-(pid as i32));
        match signal::kill(group, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(Errno::ESRCH) => {
                // Group is gone; double-check the leader itself.
                match signal::kill(Pid::from_raw(pid as i32), None) {
                    Ok(()) => true,
                    Err(Errno::EPERM) => true,
                    Err(_) => false,
                }
            }
            Err(_) => false,
        }
    }
}

/// Send `signal` to the whole process group, falling back to the leader pid
/// when group delivery fails.
#[cfg(unix)]
pub fn signal_process_group(pid: i64, signal: uwb_core::job::StopSignal) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        uwb_core::job::StopSignal::Sigterm => Signal::SIGTERM,
        uwb_core::job::StopSignal::Sigkill => Signal::SIGKILL,
    };
    if signal::killpg(Pid::from_raw(pid as i32), sig).is_err() {
        let _ = signal::kill(Pid::from_raw(pid as i32), sig);
    }
}
