use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::engine::{EncodeJob, EncodingEngine, OutputFormat};
use crate::error::{CaptureError, Result};
use crate::frame::Shape;
use crate::host::{EncodeHost, LocalSink};
use crate::pool::{PoolRegistry, PoolRole, SharedPool};
use crate::relay::{ContextRelay, RelayCommand, RelayEvent};
use crate::scheduler::{CapturePlan, CaptureScheduler, FrameSink, SharedSource};
use crate::source::FrameSource;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scheduling,
    Streaming,
    Encoding,
    Completed,
    Failed(String),
}

/// The encoded result of a session.
#[derive(Clone, Debug)]
pub struct Recording {
    pub data: Bytes,
    pub mime: &'static str,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub frames: u64,
    pub elapsed: Duration,
}

/// One recording: schedules the capture ticks, streams the frames into the
/// encoder (inline or behind a [`ContextRelay`]) and yields the encoded blob.
pub struct CaptureSession {
    config: SessionConfig,
    source: SharedSource,
    engine: Option<Box<dyn EncodingEngine>>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    registry: PoolRegistry,
}

impl CaptureSession {
    pub fn new(
        config: SessionConfig,
        source: impl FrameSource + 'static,
        engine: impl EncodingEngine + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let source: Box<dyn FrameSource> = Box::new(source);
        let (state, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            config,
            source: Arc::new(Mutex::new(source)),
            engine: Some(Box::new(engine)),
            cancel: CancellationToken::new(),
            state,
            registry: PoolRegistry::new(),
        })
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Cancelling the token fails a running `record` with `Cancelled`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn expected_frames(&self) -> u64 {
        self.config.expected_frames()
    }

    fn transition(&self, next: SessionState) {
        let prev = self.state.send_replace(next.clone());
        log::info!("session {:?} -> {:?}", prev, next);
    }

    pub async fn record(mut self) -> Result<Recording> {
        let started = Instant::now();
        self.transition(SessionState::Scheduling);

        let (width, height) = self.config.scaled_size();
        let plan = CapturePlan {
            width,
            height,
            fps: self.config.fps,
            time: self.config.time,
            src_format: self.config.src_format,
        };
        let job = EncodeJob {
            width,
            height,
            fps: self.config.fps,
            frames: plan.expected_frames(),
            src_format: self.config.src_format,
            format: self.config.format,
            quality: self.config.quality.clone(),
        };
        let capture_pool = self
            .registry
            .pool(Shape::rgba(width, height), PoolRole::Capture);

        let outcome = match self.engine.take() {
            None => Err(CaptureError::protocol("session already recorded")),
            Some(engine) if self.config.use_relay => {
                self.record_relayed(plan, job, capture_pool, engine).await
            }
            Some(engine) => {
                let encode_pool = self.registry.pool(Shape::rgb(width, height), PoolRole::Encode);
                self.record_inline(plan, job, capture_pool, encode_pool, engine)
                    .await
            }
        };

        match outcome {
            Ok(data) => {
                self.registry.drain_all();
                self.transition(SessionState::Completed);
                Ok(Recording {
                    data,
                    mime: self.config.format.mime(),
                    format: self.config.format,
                    width,
                    height,
                    frames: plan.expected_frames(),
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                log::error!("recording failed: {}", e);
                self.cancel.cancel();
                self.registry.drain_all();
                self.transition(SessionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn scheduler(&self, pool: SharedPool, sink: Arc<dyn FrameSink>) -> CaptureScheduler {
        CaptureScheduler::new(Arc::clone(&self.source), pool, sink, self.cancel.clone())
            .with_tick_retries(self.config.tick_retries)
    }

    async fn record_inline(
        &self,
        plan: CapturePlan,
        job: EncodeJob,
        capture_pool: SharedPool,
        encode_pool: SharedPool,
        engine: Box<dyn EncodingEngine>,
    ) -> Result<Bytes> {
        let (host, mut encoding) = EncodeHost::start(
            job,
            encode_pool,
            engine,
            self.cancel.clone(),
            self.config.output_block_size,
        );
        let sink = Arc::new(LocalSink::new(host, capture_pool.clone()));
        let capture = self.scheduler(capture_pool, sink.clone()).schedule(plan);
        self.transition(SessionState::Streaming);

        tokio::select! {
            captured = capture.join() => match captured {
                Ok(frames) => log::debug!("captured {} frames", frames),
                Err(e) => {
                    sink.abort(&e.to_string());
                    // Let the encoder thread wind down before reporting.
                    let _ = (&mut encoding).await;
                    return Err(e);
                }
            },
            finished = &mut encoding => {
                return Err(match engine_outcome(finished) {
                    Ok(_) => CaptureError::protocol("encoder finished before capture"),
                    Err(e) => e,
                });
            }
        }

        self.transition(SessionState::Encoding);
        engine_outcome(encoding.await)
    }

    async fn record_relayed(
        &self,
        plan: CapturePlan,
        job: EncodeJob,
        capture_pool: SharedPool,
        engine: Box<dyn EncodingEngine>,
    ) -> Result<Bytes> {
        let mut relay =
            ContextRelay::spawn(engine, self.config.output_block_size, self.cancel.clone());
        let sender = relay.sender();
        sender.send(RelayCommand::Resize {
            width: job.width,
            height: job.height,
        })?;
        sender.send(RelayCommand::StartSession(job))?;

        let capture = self
            .scheduler(capture_pool.clone(), Arc::new(sender.clone()))
            .schedule(plan);
        self.transition(SessionState::Streaming);

        let mut capture = std::pin::pin!(capture.join());
        let mut capturing = true;
        let outcome = loop {
            tokio::select! {
                captured = &mut capture, if capturing => {
                    capturing = false;
                    match captured {
                        Ok(frames) => {
                            log::debug!("captured {} frames", frames);
                            self.transition(SessionState::Encoding);
                        }
                        Err(e) => {
                            let _ = sender.send(RelayCommand::Abort {
                                reason: e.to_string(),
                            });
                            break Err(e);
                        }
                    }
                }
                event = relay.next_event() => match event {
                    Some(RelayEvent::ReleaseFrame(frame)) => {
                        capture_pool.free_frame(frame);
                    }
                    Some(RelayEvent::Result(data)) => break Ok(data),
                    Some(RelayEvent::Failed(e)) => break Err(e),
                    None => break Err(CaptureError::RelayClosed),
                },
            }
        };

        let outcome = match outcome {
            // Every tick already handed its frame over; collect them.
            Ok(data) if capturing => match capture.await {
                Ok(_) => {
                    self.transition(SessionState::Encoding);
                    Ok(data)
                }
                Err(e) => Err(e),
            },
            other => other,
        };

        if outcome.is_err() {
            self.cancel.cancel();
        }
        drop(sender);
        relay.shutdown().await;
        outcome
    }
}

fn engine_outcome(joined: std::result::Result<Result<Bytes>, JoinError>) -> Result<Bytes> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(CaptureError::Engine {
            reason: format!("encoder task died: {}", e),
        }),
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
