use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::SourceFormat;
use crate::error::{CaptureError, Result};
use crate::frame::{CapturedFrame, Shape};
use crate::pool::SharedPool;
use crate::source::FrameSource;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Timing and size of one recording.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapturePlan {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub time: f64,
    pub src_format: SourceFormat,
}

impl CapturePlan {
    pub fn expected_frames(&self) -> u64 {
        (self.fps as f64 * self.time).ceil() as u64
    }

    pub fn delay(&self) -> Duration {
        Duration::from_nanos(NANOS_PER_SEC / self.fps.max(1) as u64)
    }

    /// Offset of tick `index` from the start of the recording.
    pub fn offset(&self, index: u64) -> Duration {
        Duration::from_nanos(index.saturating_mul(NANOS_PER_SEC) / self.fps.max(1) as u64)
    }

    pub fn shape(&self) -> Shape {
        Shape::rgba(self.width, self.height)
    }
}

/// Receives captured frames tagged with their capture index.
pub trait FrameSink: Send + Sync {
    fn submit(&self, index: u64, frame: CapturedFrame) -> Result<()>;
}

pub type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Fires one independent timer per frame and hands each captured frame to
/// the sink. Ticks may complete in any order; the index carries the order.
pub struct CaptureScheduler {
    source: SharedSource,
    pool: SharedPool,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
    tick_retries: u32,
}

impl CaptureScheduler {
    pub fn new(
        source: SharedSource,
        pool: SharedPool,
        sink: Arc<dyn FrameSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            pool,
            sink,
            cancel,
            tick_retries: 0,
        }
    }

    pub fn with_tick_retries(mut self, retries: u32) -> Self {
        self.tick_retries = retries;
        self
    }

    pub fn schedule(&self, plan: CapturePlan) -> ScheduledCapture {
        if plan.src_format == SourceFormat::Raw && self.pool.shape() != plan.shape() {
            self.pool.lock().set_size(plan.shape());
        }

        let cancel = self.cancel.child_token();
        let expected = plan.expected_frames();
        let start = Instant::now();
        let mut tasks = JoinSet::new();
        for index in 0..expected {
            let tick = Tick {
                index,
                at: start + plan.offset(index),
                plan,
                source: Arc::clone(&self.source),
                pool: self.pool.clone(),
                sink: Arc::clone(&self.sink),
                cancel: cancel.clone(),
                retries: self.tick_retries,
            };
            tasks.spawn(tick.run());
        }
        log::debug!(
            "scheduled {} ticks every {:?} ({})",
            expected,
            plan.delay(),
            plan.shape()
        );

        ScheduledCapture {
            tasks,
            cancel,
            expected,
        }
    }
}

struct Tick {
    index: u64,
    at: Instant,
    plan: CapturePlan,
    source: SharedSource,
    pool: SharedPool,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
    retries: u32,
}

impl Tick {
    async fn run(self) -> Result<u64> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(CaptureError::Cancelled),
            _ = tokio::time::sleep_until(self.at) => {}
        }

        let mut attempt = 0;
        let frame = loop {
            match self.capture() {
                Ok(frame) => break frame,
                Err(e) if e.is_recoverable() && attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "frame {} capture failed ({}), retry {}/{}",
                        self.index,
                        e,
                        attempt,
                        self.retries
                    );
                    tokio::task::yield_now().await;
                    if self.cancel.is_cancelled() {
                        return Err(CaptureError::Cancelled);
                    }
                }
                Err(e) => {
                    log::error!("frame {} capture failed: {}", self.index, e);
                    return Err(e);
                }
            }
        };

        self.sink.submit(self.index, frame)?;
        Ok(self.index)
    }

    fn capture(&self) -> Result<CapturedFrame> {
        let mut source = match self.source.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match self.plan.src_format {
            SourceFormat::Raw => {
                let mut frame = self.pool.get_frame()?;
                if let Err(e) =
                    source.read_pixels(self.plan.width, self.plan.height, frame.data_mut())
                {
                    self.pool.free_frame(frame);
                    return Err(e);
                }
                Ok(CapturedFrame::Pixels(frame))
            }
            SourceFormat::Png => {
                let png = source.snapshot_png(self.plan.width, self.plan.height)?;
                Ok(CapturedFrame::Encoded(Bytes::from(png)))
            }
        }
    }
}

/// Handle to the ticks of one recording.
pub struct ScheduledCapture {
    tasks: JoinSet<Result<u64>>,
    cancel: CancellationToken,
    expected: u64,
}

impl ScheduledCapture {
    pub fn expected_frames(&self) -> u64 {
        self.expected
    }

    /// Stops every tick that has not fired yet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for every tick. The first failure cancels the remaining ticks
    /// and is returned.
    pub async fn join(mut self) -> Result<u64> {
        let mut captured = 0;
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(_)) => {
                    captured += 1;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => CaptureError::source_failure(format!("capture tick died: {}", e), false),
            };
            self.cancel.cancel();
            self.tasks.abort_all();
            return Err(failure);
        }
        Ok(captured)
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
