//! Runs the encoder side of a session in its own task and talks to it only
//! through messages. Frame buffers cross the boundary by move, so the caller
//! gives up a frame when it sends it and gets the same allocation back in a
//! [`RelayEvent::ReleaseFrame`].

use bytes::Bytes;
use futures::future::OptionFuture;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{EncodeJob, EncodingEngine};
use crate::error::{CaptureError, Result};
use crate::frame::{CapturedFrame, Frame, Shape};
use crate::host::EncodeHost;
use crate::pool::{PoolRegistry, PoolRole};
use crate::scheduler::FrameSink;

/// Caller to worker.
#[derive(Debug)]
pub enum RelayCommand {
    StartSession(EncodeJob),
    Resize { width: u32, height: u32 },
    AddFrame { index: u64, frame: CapturedFrame },
    Abort { reason: String },
}

/// Worker to caller.
#[derive(Debug)]
pub enum RelayEvent {
    /// An RGBA frame the worker is done with.
    ReleaseFrame(Frame),
    Result(Bytes),
    Failed(CaptureError),
}

pub struct ContextRelay {
    tx: UnboundedSender<RelayCommand>,
    rx: UnboundedReceiver<RelayEvent>,
    worker: JoinHandle<()>,
}

impl ContextRelay {
    pub fn spawn(
        engine: Box<dyn EncodingEngine>,
        output_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (events, rx) = mpsc::unbounded_channel();
        let worker = RelayWorker {
            engine: Some(engine),
            registry: PoolRegistry::new(),
            size: None,
            host: None,
            output_capacity,
            cancel,
            events,
        };
        let worker = tokio::spawn(worker.run(commands));
        Self { tx, rx, worker }
    }

    pub fn sender(&self) -> RelaySender {
        RelaySender {
            tx: self.tx.clone(),
        }
    }

    pub fn send(&self, command: RelayCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| CaptureError::RelayClosed)
    }

    /// Next worker event; `None` once the worker has exited.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }

    /// Closes the command channel and waits for the worker to exit.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            log::error!("relay worker join error: {:#?}", e);
        }
    }
}

/// Cloneable command handle; doubles as the capture scheduler's sink.
#[derive(Clone)]
pub struct RelaySender {
    tx: UnboundedSender<RelayCommand>,
}

impl RelaySender {
    pub fn send(&self, command: RelayCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| CaptureError::RelayClosed)
    }
}

impl FrameSink for RelaySender {
    fn submit(&self, index: u64, frame: CapturedFrame) -> Result<()> {
        self.send(RelayCommand::AddFrame { index, frame })
    }
}

struct RelayWorker {
    engine: Option<Box<dyn EncodingEngine>>,
    registry: PoolRegistry,
    size: Option<(u32, u32)>,
    host: Option<EncodeHost>,
    output_capacity: usize,
    cancel: CancellationToken,
    events: UnboundedSender<RelayEvent>,
}

impl RelayWorker {
    async fn run(mut self, mut commands: UnboundedReceiver<RelayCommand>) {
        log::info!("relay worker started");
        let mut encoding: Option<JoinHandle<Result<Bytes>>> = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.handle(command, &mut encoding) {
                            log::error!("relay command failed: {}", e);
                            self.abort(&e.to_string());
                            self.emit(RelayEvent::Failed(e));
                            break;
                        }
                    }
                    None => {
                        self.abort("relay caller went away");
                        break;
                    }
                },
                Some(joined) = OptionFuture::from(encoding.as_mut()) => {
                    encoding = None;
                    let event = match joined {
                        Ok(Ok(data)) => RelayEvent::Result(data),
                        Ok(Err(e)) => RelayEvent::Failed(e),
                        Err(e) => RelayEvent::Failed(CaptureError::Engine {
                            reason: format!("encoder task died: {}", e),
                        }),
                    };
                    self.emit(event);
                    break;
                }
            }
        }
        self.registry.drain_all();
        log::info!("relay worker stopped");
    }

    fn handle(
        &mut self,
        command: RelayCommand,
        encoding: &mut Option<JoinHandle<Result<Bytes>>>,
    ) -> Result<()> {
        match command {
            RelayCommand::Resize { width, height } => {
                if self.host.is_some() {
                    log::warn!("ignoring resize to {}x{} after session start", width, height);
                    return Ok(());
                }
                self.registry.pool(Shape::rgb(width, height), PoolRole::Encode);
                self.size = Some((width, height));
                log::debug!("relay pool sized to {}x{}", width, height);
            }
            RelayCommand::StartSession(job) => {
                if self.host.is_some() {
                    return Err(CaptureError::protocol("session already started"));
                }
                let engine = self
                    .engine
                    .take()
                    .ok_or_else(|| CaptureError::protocol("engine already used"))?;
                if let Some((width, height)) = self.size {
                    if (width, height) != (job.width, job.height) {
                        log::warn!(
                            "session {}x{} differs from relay size {}x{}",
                            job.width,
                            job.height,
                            width,
                            height
                        );
                    }
                }
                let pool = self
                    .registry
                    .pool(Shape::rgb(job.width, job.height), PoolRole::Encode);
                let (host, handle) = EncodeHost::start(
                    job,
                    pool,
                    engine,
                    self.cancel.clone(),
                    self.output_capacity,
                );
                self.host = Some(host);
                *encoding = Some(handle);
            }
            RelayCommand::AddFrame { index, frame } => {
                let host = self.host.as_mut().ok_or_else(|| {
                    CaptureError::protocol(format!("frame {} added before session start", index))
                })?;
                let events = &self.events;
                host.add_frame(index, frame, |released| {
                    if events.send(RelayEvent::ReleaseFrame(released)).is_err() {
                        log::debug!("relay caller dropped, released frame discarded");
                    }
                })?;
            }
            RelayCommand::Abort { reason } => {
                self.abort(&reason);
            }
        }
        Ok(())
    }

    fn abort(&self, reason: &str) {
        if let Some(host) = &self.host {
            host.abort(reason);
        }
    }

    fn emit(&self, event: RelayEvent) {
        if self.events.send(event).is_err() {
            log::debug!("relay caller dropped, event discarded");
        }
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod relay_test;
