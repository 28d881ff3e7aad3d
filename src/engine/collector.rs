// Output collectors: one reader thread per encoder output stream

use std::io::{self, Read};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::core::Channel;

const TEARDOWN_ATTEMPTS: usize = 200;
const TEARDOWN_INTERVAL: Duration = Duration::from_millis(10);

/// Message from a collector to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorMessage {
    /// Bytes read from the channel, in production order
    Data { channel: Channel, chunk: Vec<u8> },

    /// Source reached end of stream; the collector has stopped
    Eof { channel: Channel },

    /// Opening or reading the source failed; the collector has stopped
    Error { channel: Channel, reason: String },

    /// Collector died without reporting EOF or an error
    Terminated { channel: Channel },
}

/// Guarantees exactly one terminal message per collector, even on panic
struct TerminalGuard<M: From<CollectorMessage>> {
    channel: Channel,
    tx: Sender<M>,
    done: bool,
}

impl<M: From<CollectorMessage>> TerminalGuard<M> {
    fn send(&self, msg: CollectorMessage) -> bool {
        self.tx.send(msg.into()).is_ok()
    }

    fn finish(&mut self, msg: CollectorMessage) {
        self.done = true;
        let _ = self.tx.send(msg.into());
    }
}

impl<M: From<CollectorMessage>> Drop for TerminalGuard<M> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.tx.send(
                CollectorMessage::Terminated {
                    channel: self.channel,
                }
                .into(),
            );
        }
    }
}

fn collect<R: Read, M: From<CollectorMessage>>(
    mut source: R,
    chunk_size: usize,
    guard: &mut TerminalGuard<M>,
) {
    let channel = guard.channel;
    let mut buf = vec![0u8; chunk_size];

    loop {
        match source.read(&mut buf) {
            Ok(0) => {
                tracing::debug!(%channel, "collector reached end of stream");
                guard.finish(CollectorMessage::Eof { channel });
                return;
            }
            Ok(n) => {
                let delivered = guard.send(CollectorMessage::Data {
                    channel,
                    chunk: buf[..n].to_vec(),
                });
                if !delivered {
                    // Coordinator is gone, nobody left to report to
                    guard.done = true;
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(%channel, "collector read failed: {}", e);
                guard.finish(CollectorMessage::Error {
                    channel,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

/// Stage-scoped group of collector threads
pub struct CollectorGroup<M: From<CollectorMessage> + Send + 'static> {
    tx: Sender<M>,
    chunk_size: usize,
    handles: Vec<(Channel, JoinHandle<()>)>,
}

impl<M: From<CollectorMessage> + Send + 'static> CollectorGroup<M> {
    pub fn new(tx: Sender<M>, chunk_size: usize) -> Self {
        Self {
            tx,
            chunk_size: chunk_size.max(1),
            handles: Vec::new(),
        }
    }

    /// Spawn a collector for `channel`.
    ///
    /// `open` runs on the collector thread, so a source that blocks while
    /// opening (a named pipe waiting for its writer) never blocks the caller.
    pub fn spawn<R, F>(&mut self, channel: Channel, open: F) -> io::Result<()>
    where
        R: Read,
        F: FnOnce() -> io::Result<R> + Send + 'static,
    {
        let tx = self.tx.clone();
        let chunk_size = self.chunk_size;

        let handle = thread::Builder::new()
            .name(format!("collector-{}", channel).replace(' ', "-"))
            .spawn(move || {
                let mut guard = TerminalGuard {
                    channel,
                    tx,
                    done: false,
                };

                match open() {
                    Ok(source) => collect(source, chunk_size, &mut guard),
                    Err(e) => {
                        tracing::warn!(%channel, "collector could not open its source: {}", e);
                        guard.finish(CollectorMessage::Error {
                            channel,
                            reason: format!("open failed: {}", e),
                        });
                    }
                }
            })?;

        self.handles.push((channel, handle));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Collectors whose thread is still running
    pub fn running(&self) -> Vec<Channel> {
        self.handles
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(channel, _)| *channel)
            .collect()
    }

    /// Stop every collector.
    ///
    /// `release` is called repeatedly for each collector still running and
    /// must make its pending read or open return. Collectors that never stop
    /// are detached with a warning.
    pub fn shutdown(&mut self, mut release: impl FnMut(Channel)) {
        for _ in 0..TEARDOWN_ATTEMPTS {
            let running = self.running();
            if running.is_empty() {
                break;
            }
            for channel in running {
                release(channel);
            }
            thread::sleep(TEARDOWN_INTERVAL);
        }

        for (channel, handle) in self.handles.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!(%channel, "collector panicked");
                }
            } else {
                tracing::warn!(%channel, "collector did not stop, detaching it");
            }
        }
    }
}
