//! Data channel between the capture and publish processes
//!
//! Capture stdout is an anonymous pipe drained by a relay task that writes
//! into the publish stdin. The publish stdin ([`PublishSink`]) lives as long as
//! the session, while every capture attempt gets a fresh channel with its own
//! generation, so the publisher never sees end-of-file across a capture
//! restart and never waits on a writer that has already gone.

use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::health::PipelineHealth;
use super::process::ProcessHandle;

const RELAY_BUFFER: usize = 64 * 1024;

/// Publish process stdin, shared by successive channel generations.
pub type PublishSink = Arc<Mutex<ChildStdin>>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("capture process {pid} has no stdout to read from")]
    NoSource { pid: u32 },
    #[error("publish process {pid} has no stdin to write to")]
    NoSink { pid: u32 },
    #[error("channel generation {generation} is already connected")]
    AlreadyConnected { generation: u64 },
}

/// One generation of the capture → publish byte conduit.
pub struct DataChannel {
    generation: u64,
    source: Option<ChildStdout>,
    relay: Option<JoinHandle<u64>>,
    health: Arc<PipelineHealth>,
}

impl DataChannel {
    /// Claim the stdout of a freshly launched capture process.
    pub fn create(
        generation: u64,
        capture: &mut ProcessHandle,
        health: Arc<PipelineHealth>,
    ) -> Result<Self, ChannelError> {
        let source = capture
            .take_stdout()
            .ok_or(ChannelError::NoSource { pid: capture.pid() })?;

        health.reset_stall_clock();
        debug!("Data channel {} created for capture {}", generation, capture.pid());

        Ok(Self {
            generation,
            source: Some(source),
            relay: None,
            health,
        })
    }

    /// Wrap the stdin of a freshly launched publish process.
    pub fn sink_for(publish: &mut ProcessHandle) -> Result<PublishSink, ChannelError> {
        publish
            .take_stdin()
            .map(|stdin| Arc::new(Mutex::new(stdin)))
            .ok_or(ChannelError::NoSink { pid: publish.pid() })
    }

    /// Start relaying into `sink`.
    pub fn connect(&mut self, sink: PublishSink) -> Result<(), ChannelError> {
        let source = self.source.take().ok_or(ChannelError::AlreadyConnected {
            generation: self.generation,
        })?;

        let health = Arc::clone(&self.health);
        let generation = self.generation;
        self.relay = Some(tokio::spawn(relay(source, sink, health, generation)));
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the relay task is still moving data.
    pub fn is_flowing(&self) -> bool {
        self.relay.as_ref().is_some_and(|relay| !relay.is_finished())
    }

    /// Stop relaying; the publish stdin stays open.
    pub fn close(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
        self.source = None;
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn relay(
    mut source: ChildStdout,
    sink: PublishSink,
    health: Arc<PipelineHealth>,
    generation: u64,
) -> u64 {
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;

    loop {
        match source.read(&mut buf).await {
            Ok(0) => {
                info!("Data channel {}: capture output ended after {} bytes", generation, total);
                break;
            }
            Ok(n) => {
                let mut stdin = sink.lock().await;
                if let Err(e) = stdin.write_all(&buf[..n]).await {
                    warn!("Data channel {}: publisher stopped reading: {}", generation, e);
                    break;
                }
                total += n as u64;
                health.record_chunk(n);
            }
            Err(e) => {
                warn!("Data channel {}: read error: {}", generation, e);
                break;
            }
        }
    }

    total
}
