// Transcode stage coordinator
//
// A single thread of control owns the encoder process, the named pipes and
// the per-channel accounting. Upstream input and collector output arrive on
// one mailbox and are handled strictly in arrival order.

use serde::Serialize;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::collector::{CollectorGroup, CollectorMessage};
use super::core::{
    Channel, EncodeSpecRegistry, EncoderCommand, EncoderProcess, EncoderSettings, ExitFailure,
    FifoSet, OutputId, OutputMode, OutputOptions, OutputSinks, OutputSpec, StageError, StagePhase,
    StreamFormat, build_encoder_cmd, fifo,
};

/// Exit bound applied in combined mode unless configured otherwise
pub const COMBINED_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// How long a failed input write waits for the encoder's exit status
const WRITE_FAILURE_GRACE: Duration = Duration::from_millis(500);

/// How often pipes nobody opened are released once the encoder has exited
const PIPE_RELEASE_INTERVAL: Duration = Duration::from_millis(50);

/// Default exit bound for `mode`.
///
/// Combined mode drains through the input side before exit, so a hard bound
/// is safe. Multi-sink mode waits on every reader instead.
pub fn default_exit_timeout(mode: OutputMode) -> Option<Duration> {
    match mode {
        OutputMode::Combined => Some(COMBINED_EXIT_TIMEOUT),
        OutputMode::MultiSink => None,
    }
}

/// Runtime settings of one stage instance
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub mode: OutputMode,
    pub encoder: EncoderSettings,
    pub exit_timeout: Option<Duration>,
    /// Directory for named pipes; a fresh temp directory when unset
    pub fifo_dir: Option<PathBuf>,
    pub read_chunk_size: usize,
}

impl StageSettings {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            encoder: EncoderSettings::default(),
            exit_timeout: default_exit_timeout(mode),
            fifo_dir: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self::new(OutputMode::default())
    }
}

/// Everything the coordinator reacts to
#[derive(Debug)]
pub enum StageEvent {
    Format(StreamFormat),
    Chunk(Vec<u8>),
    EndOfInput,
    /// Every upstream handle was dropped
    UpstreamClosed,
    Collector(CollectorMessage),
}

impl From<CollectorMessage> for StageEvent {
    fn from(msg: CollectorMessage) -> Self {
        StageEvent::Collector(msg)
    }
}

/// Consumer of the stage's output channels
pub trait Downstream {
    /// Format declaration for `channel`, sent before any data
    fn stream_format(&mut self, _channel: Channel, _format: &StreamFormat) -> io::Result<()> {
        Ok(())
    }

    fn write_chunk(&mut self, channel: Channel, chunk: &[u8]) -> io::Result<()>;

    fn end_of_stream(&mut self, channel: Channel) -> io::Result<()>;
}

struct InputInner {
    tx: Sender<StageEvent>,
}

impl Drop for InputInner {
    fn drop(&mut self) {
        let _ = self.tx.send(StageEvent::UpstreamClosed);
    }
}

/// Upstream handle feeding a stage; cheap to clone
#[derive(Clone)]
pub struct StageInput {
    inner: Arc<InputInner>,
}

impl StageInput {
    fn send(&self, event: StageEvent) -> Result<(), StageError> {
        self.inner
            .tx
            .send(event)
            .map_err(|_| StageError::InvalidState {
                action: "send input",
                phase: StagePhase::Finished,
            })
    }

    pub fn send_format(&self, format: StreamFormat) -> Result<(), StageError> {
        self.send(StageEvent::Format(format))
    }

    pub fn send_chunk(&self, chunk: impl Into<Vec<u8>>) -> Result<(), StageError> {
        self.send(StageEvent::Chunk(chunk.into()))
    }

    pub fn end_of_input(&self) -> Result<(), StageError> {
        self.send(StageEvent::EndOfInput)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub channel: Channel,
    pub chunks: u64,
    pub bytes: u64,
    pub complete: bool,
}

/// Outcome of a clean run
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub mode: OutputMode,
    pub bytes_in: u64,
    pub exit_code: i32,
    pub channels: Vec<ChannelReport>,
}

impl StageReport {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelReport> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

/// One transcode stage: register outputs, activate, then run to completion
pub struct TranscodeStage {
    settings: StageSettings,
    registry: EncodeSpecRegistry,
    phase: StagePhase,
    tx: Sender<StageEvent>,
    rx: Receiver<StageEvent>,
    input: Option<StageInput>,
    command: Option<EncoderCommand>,
    process: Option<EncoderProcess>,
    fifos: Option<FifoSet>,
    collectors: Option<CollectorGroup<StageEvent>>,
    channels: Vec<ChannelReport>,
}

impl TranscodeStage {
    pub fn new(settings: StageSettings) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            registry: EncodeSpecRegistry::new(settings.mode),
            settings,
            phase: StagePhase::Registering,
            tx,
            rx,
            input: None,
            command: None,
            process: None,
            fifos: None,
            collectors: None,
            channels: Vec::new(),
        }
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    pub fn phase(&self) -> StagePhase {
        self.phase
    }

    pub fn specs(&self) -> &[OutputSpec] {
        self.registry.specs()
    }

    /// Command the encoder was started with
    pub fn command(&self) -> Option<&EncoderCommand> {
        self.command.as_ref()
    }

    /// Output channels in registration order
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|c| c.channel).collect()
    }

    /// Request an output. Only allowed before activation.
    pub fn register(
        &mut self,
        id: impl Into<OutputId>,
        options: OutputOptions,
    ) -> Result<usize, StageError> {
        if self.phase != StagePhase::Registering {
            return Err(StageError::InvalidState {
                action: "register an output",
                phase: self.phase,
            });
        }
        let id = id.into();
        let index = self.registry.register(id, options)?;
        tracing::debug!(output = %id, index, "registered output");
        Ok(index)
    }

    /// Start the encoder with the command built from the registered outputs
    pub fn activate(&mut self) -> Result<StageInput, StageError> {
        self.activate_with(build_encoder_cmd)
    }

    /// Start the encoder with a command produced by `build`.
    ///
    /// `build` receives the registered outputs, the encoder settings and the
    /// sinks prepared for this activation.
    pub fn activate_with<F>(&mut self, build: F) -> Result<StageInput, StageError>
    where
        F: FnOnce(&[OutputSpec], &EncoderSettings, OutputSinks<'_>) -> EncoderCommand,
    {
        if self.phase != StagePhase::Registering {
            return Err(StageError::InvalidState {
                action: "activate",
                phase: self.phase,
            });
        }
        if self.registry.is_empty() {
            return Err(StageError::InvalidState {
                action: "activate without outputs",
                phase: self.phase,
            });
        }

        self.registry.seal();
        self.phase = StagePhase::Active;

        match self.start(build) {
            Ok(input) => Ok(input),
            Err(e) => {
                tracing::error!("activation failed: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    fn start<F>(&mut self, build: F) -> Result<StageInput, StageError>
    where
        F: FnOnce(&[OutputSpec], &EncoderSettings, OutputSinks<'_>) -> EncoderCommand,
    {
        let mode = self.settings.mode;
        let ids: Vec<OutputId> = self.registry.ids().collect();

        let command = match mode {
            OutputMode::Combined => build(
                self.registry.specs(),
                &self.settings.encoder,
                OutputSinks::Stdout,
            ),
            OutputMode::MultiSink => {
                let fifos = FifoSet::create(self.settings.fifo_dir.as_deref(), &ids)?;
                let paths = fifos.paths();
                self.fifos = Some(fifos);
                build(
                    self.registry.specs(),
                    &self.settings.encoder,
                    OutputSinks::Pipes(&paths),
                )
            }
        };

        let mut process = EncoderProcess::start(&command, mode == OutputMode::Combined)?;
        let mut collectors = CollectorGroup::new(self.tx.clone(), self.settings.read_chunk_size);

        let spawned = match mode {
            OutputMode::Combined => {
                let stdout = process.take_stdout();
                self.channels.push(Self::channel_report(Channel::Combined));
                collectors.spawn(Channel::Combined, move || {
                    stdout.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotConnected, "encoder stdout not captured")
                    })
                })
            }
            OutputMode::MultiSink => {
                let pipes: Vec<(OutputId, PathBuf)> = self
                    .fifos
                    .iter()
                    .flat_map(|set| set.iter())
                    .map(|(id, path)| (id, path.to_path_buf()))
                    .collect();
                pipes.into_iter().try_for_each(|(id, path)| {
                    let channel = Channel::Output(id);
                    self.channels.push(Self::channel_report(channel));
                    collectors.spawn(channel, move || File::open(path))
                })
            }
        };

        self.process = Some(process);
        self.collectors = Some(collectors);
        self.command = Some(command);

        if let Err(e) = spawned {
            let channel = self.channels.last().map(|c| c.channel);
            return Err(StageError::Reader {
                channel: channel.unwrap_or(Channel::Combined),
                reason: format!("could not spawn collector: {}", e),
            });
        }

        let input = StageInput {
            inner: Arc::new(InputInner {
                tx: self.tx.clone(),
            }),
        };
        self.input = Some(input.clone());
        Ok(input)
    }

    fn channel_report(channel: Channel) -> ChannelReport {
        ChannelReport {
            channel,
            chunks: 0,
            bytes: 0,
            complete: false,
        }
    }

    /// Another upstream handle. Only available between activation and `run`.
    pub fn input(&self) -> Option<StageInput> {
        self.input.clone()
    }

    /// Drive the stage until every channel finished or a fatal error occurred.
    ///
    /// The stage is torn down in both cases. Output delivered before a
    /// failure stays delivered.
    pub fn run<D: Downstream>(&mut self, downstream: &mut D) -> Result<StageReport, StageError> {
        if self.phase != StagePhase::Active || self.process.is_none() {
            return Err(StageError::InvalidState {
                action: "run",
                phase: self.phase,
            });
        }

        // Only caller-held handles keep upstream open from here on
        self.input = None;

        let result = self.event_loop(downstream);
        if let Err(e) = &result {
            tracing::error!("stage failed: {}", e);
        }
        self.teardown();
        result
    }

    fn event_loop<D: Downstream>(&mut self, downstream: &mut D) -> Result<StageReport, StageError> {
        let mut bytes_in: u64 = 0;
        let mut input_closed = false;
        let mut exit_code: Option<i32> = None;
        let mut eos_sent = false;

        loop {
            if let Some(code) = exit_code {
                if eos_sent {
                    tracing::info!(bytes_in, "stage completed");
                    return Ok(StageReport {
                        mode: self.settings.mode,
                        bytes_in,
                        exit_code: code,
                        channels: self.channels.clone(),
                    });
                }
            }

            // After a clean exit no writer will ever open a pipe the encoder
            // skipped, so readers still parked in open() are released.
            let event = if exit_code.is_some() && self.fifos.is_some() {
                match self.rx.recv_timeout(PIPE_RELEASE_INTERVAL) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        self.release_unopened_pipes();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(StageError::UpstreamClosed),
                }
            } else {
                self.rx.recv().map_err(|_| StageError::UpstreamClosed)?
            };

            match event {
                StageEvent::Format(format) => {
                    tracing::debug!(?format, "upstream declared its format");
                    for channel in self.channels() {
                        downstream
                            .stream_format(channel, &StreamFormat::Unstructured)
                            .map_err(|source| StageError::Downstream { channel, source })?;
                    }
                }
                StageEvent::Chunk(chunk) => {
                    if input_closed {
                        return Err(StageError::InvalidState {
                            action: "write input after end of input",
                            phase: self.phase,
                        });
                    }
                    if let Err(e) = self.process_mut()?.write_input(&chunk) {
                        return Err(self.explain_write_failure(e));
                    }
                    bytes_in += chunk.len() as u64;
                }
                StageEvent::EndOfInput => {
                    if input_closed {
                        continue;
                    }
                    input_closed = true;
                    let timeout = self.settings.exit_timeout;
                    let process = self.process_mut()?;
                    process.close_input();
                    exit_code = Some(process.await_exit(timeout)?);
                    eos_sent |= self.end_streams_if_done(exit_code, eos_sent, downstream)?;
                }
                StageEvent::UpstreamClosed => {
                    if !input_closed {
                        return Err(StageError::UpstreamClosed);
                    }
                }
                StageEvent::Collector(msg) => match msg {
                    CollectorMessage::Data { channel, chunk } => {
                        let Some(report) = self.channels.iter_mut().find(|c| c.channel == channel)
                        else {
                            tracing::warn!(%channel, "data for unknown channel dropped");
                            continue;
                        };
                        report.chunks += 1;
                        report.bytes += chunk.len() as u64;
                        downstream
                            .write_chunk(channel, &chunk)
                            .map_err(|source| StageError::Downstream { channel, source })?;
                    }
                    CollectorMessage::Eof { channel } => {
                        if let Some(report) = self.channels.iter_mut().find(|c| c.channel == channel)
                        {
                            report.complete = true;
                        }
                        tracing::debug!(%channel, "channel complete");
                        eos_sent |= self.end_streams_if_done(exit_code, eos_sent, downstream)?;
                    }
                    CollectorMessage::Error { channel, reason } => {
                        return Err(StageError::Reader { channel, reason });
                    }
                    CollectorMessage::Terminated { channel } => {
                        return Err(StageError::UnexpectedTermination { channel });
                    }
                },
            }
        }
    }

    /// Send end of stream on every channel once the encoder exited with 0 and
    /// every channel reached EOF. Returns whether it was sent by this call.
    fn end_streams_if_done<D: Downstream>(
        &self,
        exit_code: Option<i32>,
        eos_sent: bool,
        downstream: &mut D,
    ) -> Result<bool, StageError> {
        if eos_sent || exit_code != Some(0) || !self.channels.iter().all(|c| c.complete) {
            return Ok(false);
        }
        for channel in self.channels() {
            downstream
                .end_of_stream(channel)
                .map_err(|source| StageError::Downstream { channel, source })?;
        }
        Ok(true)
    }

    /// A failed input write usually means the encoder died. Report its exit
    /// status and stderr when it did, the write error otherwise.
    fn explain_write_failure(&mut self, write_error: StageError) -> StageError {
        let Some(process) = self.process.as_mut() else {
            return write_error;
        };
        match process.await_exit(Some(WRITE_FAILURE_GRACE)) {
            Err(
                err @ StageError::AbnormalExit {
                    failure: ExitFailure::Code(_) | ExitFailure::Signal,
                    ..
                },
            ) => err,
            _ => write_error,
        }
    }

    fn process_mut(&mut self) -> Result<&mut EncoderProcess, StageError> {
        let phase = self.phase;
        self.process.as_mut().ok_or(StageError::InvalidState {
            action: "use the encoder",
            phase,
        })
    }

    fn release_unopened_pipes(&self) {
        let Some(fifos) = self.fifos.as_ref() else {
            return;
        };
        for report in self.channels.iter().filter(|c| !c.complete) {
            if let Channel::Output(id) = report.channel {
                if let Some(path) = fifos.path_for(id) {
                    tracing::trace!(output = %id, "releasing unopened pipe");
                    let _ = fifo::unblock(path);
                }
            }
        }
    }

    /// Kill the encoder, close every pipe and stop every collector
    fn teardown(&mut self) {
        if self.phase == StagePhase::Finished {
            return;
        }
        self.phase = StagePhase::Finished;
        self.input = None;

        if let Some(mut process) = self.process.take() {
            process.terminate();
        }

        if let Some(mut collectors) = self.collectors.take() {
            let fifos = self.fifos.as_ref();
            collectors.shutdown(|channel| {
                if let (Channel::Output(id), Some(set)) = (channel, fifos) {
                    if let Some(path) = set.path_for(id) {
                        let _ = fifo::unblock(path);
                    }
                }
            });
        }

        // Removes the named pipes
        self.fifos = None;
    }
}

impl Drop for TranscodeStage {
    fn drop(&mut self) {
        if self.phase == StagePhase::Active {
            self.teardown();
        }
    }
}
