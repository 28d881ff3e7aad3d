use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::error::{ExitFailure, StageError};
use super::ffmpeg_cmd::EncoderCommand;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_JOIN_GRACE: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Input closed, waiting for the encoder to drain and exit
    Closing,
    Exited(i32),
    Failed,
}

/// Handle to the running encoder subprocess.
///
/// Owns the input pipe and, until handed to a collector, the output pipe.
/// Dropping the handle kills a process that is still running.
pub struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_thread: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    state: ProcessState,
}

impl EncoderProcess {
    /// Spawn the encoder. With `capture_stdout` unset its stdout goes to null.
    pub fn start(command: &EncoderCommand, capture_stdout: bool) -> Result<Self, StageError> {
        let mut cmd = command.to_command();
        cmd.stdin(Stdio::piped());
        cmd.stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| StageError::ProcessStart {
            program: command.program().to_string(),
            source,
        })?;

        tracing::info!(pid = child.id(), "started encoder: {}", command);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stderr_thread = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            let pid = child.id();
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    tracing::debug!(pid, "encoder: {}", line);
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            })
        });

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr_thread,
            stderr_tail,
            state: ProcessState::Running,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Hand the output pipe to its reader. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Write one chunk to the encoder's input.
    ///
    /// Blocks while the pipe buffer is full, stalling upstream until the
    /// encoder drains it.
    pub fn write_input(&mut self, bytes: &[u8]) -> Result<(), StageError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(StageError::PipeWrite(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encoder input is already closed",
            )));
        };

        if let Err(e) = stdin.write_all(bytes) {
            self.state = ProcessState::Failed;
            self.stdin = None;
            return Err(StageError::PipeWrite(e));
        }
        Ok(())
    }

    /// Signal end of stream to the encoder. Irreversible.
    pub fn close_input(&mut self) {
        if self.stdin.take().is_some() {
            tracing::debug!(pid = self.pid(), "closed encoder input");
        }
        if self.state == ProcessState::Running {
            self.state = ProcessState::Closing;
        }
    }

    /// Wait for the encoder to exit, at most `timeout` when one is given.
    ///
    /// Only a zero exit code is success. A process still running at the bound
    /// is killed.
    pub fn await_exit(&mut self, timeout: Option<Duration>) -> Result<i32, StageError> {
        if let ProcessState::Exited(code) = self.state {
            return Ok(code);
        }

        let started = Instant::now();
        let status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    self.state = ProcessState::Failed;
                    return Err(self.abnormal(ExitFailure::Unobservable(e.to_string())));
                }
            }

            if let Some(bound) = timeout {
                if started.elapsed() >= bound {
                    tracing::warn!(
                        pid = self.pid(),
                        "encoder still running after {:?}, killing it",
                        bound
                    );
                    self.kill();
                    return Err(self.abnormal(ExitFailure::TimedOut(bound)));
                }
            }

            thread::sleep(EXIT_POLL_INTERVAL);
        };

        self.finish(status)
    }

    fn finish(&mut self, status: ExitStatus) -> Result<i32, StageError> {
        match status.code() {
            Some(0) => {
                self.state = ProcessState::Exited(0);
                tracing::info!(pid = self.pid(), "encoder exited cleanly");
                Ok(0)
            }
            Some(code) => {
                self.state = ProcessState::Exited(code);
                Err(self.abnormal(ExitFailure::Code(code)))
            }
            None => {
                self.state = ProcessState::Failed;
                Err(self.abnormal(ExitFailure::Signal))
            }
        }
    }

    fn abnormal(&mut self, failure: ExitFailure) -> StageError {
        let stderr = self.stderr_tail();
        tracing::error!(pid = self.pid(), "encoder {}", failure);
        StageError::AbnormalExit { failure, stderr }
    }

    /// Last lines the encoder wrote to stderr
    pub fn stderr_tail(&mut self) -> String {
        // Give the drain thread a moment to reach EOF, but never hang on a
        // descendant still holding the pipe.
        if let Some(handle) = self.stderr_thread.take() {
            let deadline = Instant::now() + STDERR_JOIN_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                self.stderr_thread = Some(handle);
            }
        }

        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    fn kill(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid = self.pid(), "kill failed: {}", e);
        }
        let _ = self.child.wait();
        self.state = ProcessState::Failed;
    }

    /// Close every pipe and make sure the process is gone
    pub fn terminate(&mut self) {
        self.stdin = None;
        self.stdout = None;
        match self.state {
            ProcessState::Running | ProcessState::Closing => {
                if let Ok(Some(status)) = self.child.try_wait() {
                    self.state = status
                        .code()
                        .map(ProcessState::Exited)
                        .unwrap_or(ProcessState::Failed);
                } else {
                    tracing::debug!(pid = self.pid(), "terminating encoder");
                    self.kill();
                }
            }
            ProcessState::Exited(_) | ProcessState::Failed => {}
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}
