use std::{collections::VecDeque, process::Stdio, time::Duration};

use tokio::{
  io::{AsyncBufReadExt, BufReader},
  process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
  task::JoinHandle,
};
use tracing::{debug, warn};

// how many stderr lines are kept for error reports
const STDERR_TAIL_LINES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
  Running,
  Exited(Option<i32>),
  Killed,
}

/// A spawned external tool (yt-dlp, ffmpeg) and its lifecycle.
///
/// The child is killed when this handle is dropped. Stderr is drained in the
/// background so a chatty tool never blocks on a full pipe.
pub struct ToolProcess {
  name: &'static str,
  child: Child,
  state: StageState,
  stderr: Option<JoinHandle<StderrTail>>,
  stderr_tail: Option<StderrTail>,
}

impl ToolProcess {
  pub fn spawn(name: &'static str, cmd: &mut Command) -> std::io::Result<Self> {
    let mut child = cmd
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;

    debug!(tool = name, pid = ?child.id(), "spawned");

    let stderr = child
      .stderr
      .take()
      .map(|stderr| tokio::spawn(StderrTail::collect(name, stderr)));

    Ok(Self {
      name,
      child,
      state: StageState::Running,
      stderr,
      stderr_tail: None,
    })
  }

  pub fn state(&self) -> StageState {
    self.state
  }

  pub fn take_stdout(&mut self) -> Option<ChildStdout> {
    self.child.stdout.take()
  }

  pub fn take_stdin(&mut self) -> Option<ChildStdin> {
    self.child.stdin.take()
  }

  /// Waits for the tool to exit. A non-zero exit is reported with the most
  /// relevant line the tool wrote to stderr.
  pub async fn check_exit(&mut self) -> Result<(), String> {
    let status = self
      .child
      .wait()
      .await
      .map_err(|e| format!("failed to wait for {}: {e}", self.name))?;

    if self.state == StageState::Running {
      self.state = StageState::Exited(status.code());
    }
    debug!(tool = self.name, %status, "exited");

    if status.success() {
      return Ok(());
    }

    match self.stderr_summary().await {
      Some(line) => Err(format!("{} exited with {status}: {line}", self.name)),
      None => Err(format!("{} exited with {status}", self.name)),
    }
  }

  /// Kills the tool if it is still running and reaps it.
  pub async fn terminate(&mut self) {
    if self.state != StageState::Running {
      return;
    }

    if let Ok(Some(status)) = self.child.try_wait() {
      self.state = StageState::Exited(status.code());
      return;
    }

    match self.child.kill().await {
      Ok(()) => {
        debug!(tool = self.name, "killed");
        self.state = StageState::Killed;
      }
      Err(e) => warn!(tool = self.name, error = %e, "failed to kill"),
    }
  }

  async fn stderr_summary(&mut self) -> Option<String> {
    if let Some(handle) = self.stderr.take() {
      // the pipe closes once the tool is gone; don't hang on grandchildren
      // that inherited it
      match tokio::time::timeout(Duration::from_secs(1), handle).await {
        Ok(Ok(tail)) => self.stderr_tail = Some(tail),
        _ => warn!(tool = self.name, "stderr not collected"),
      }
    }

    self.stderr_tail.as_ref().and_then(StderrTail::summary)
  }
}

#[derive(Debug, Default)]
struct StderrTail {
  lines: VecDeque<String>,
}

impl StderrTail {
  async fn collect(name: &'static str, stderr: ChildStderr) -> Self {
    let mut tail = StderrTail::default();
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
      debug!(tool = name, "{line}");
      tail.push(line);
    }

    tail
  }

  fn push(&mut self, line: String) {
    if line.trim().is_empty() {
      return;
    }
    if self.lines.len() == STDERR_TAIL_LINES {
      self.lines.pop_front();
    }
    self.lines.push_back(line);
  }

  // yt-dlp prefixes fatal messages with "ERROR:", ffmpeg just prints them
  // last
  fn summary(&self) -> Option<String> {
    self
      .lines
      .iter()
      .rev()
      .find(|line| line.contains("ERROR:"))
      .or_else(|| self.lines.back())
      .map(|line| line.trim().to_string())
  }
}
