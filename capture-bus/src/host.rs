use std::sync::Mutex;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeProducer, Payload, StreamBridge};
use crate::engine::{spawn_engine, EncodeJob, EncodingEngine, SourceFormat};
use crate::error::Result;
use crate::frame::{CapturedFrame, Frame, Shape};
use crate::pool::SharedPool;
use crate::scheduler::FrameSink;

/// Encoder side of a session: converts captured frames into the encoder's
/// input format and queues them on the bridge the engine reads from.
pub struct EncodeHost {
    pool: SharedPool,
    bridge: StreamBridge,
    producer: BridgeProducer,
    frames_added: u64,
}

impl EncodeHost {
    /// Sizes `pool` for rgb24 frames of the job and starts the engine.
    pub fn start(
        job: EncodeJob,
        pool: SharedPool,
        engine: Box<dyn EncodingEngine>,
        cancel: CancellationToken,
        output_capacity: usize,
    ) -> (Self, JoinHandle<Result<Bytes>>) {
        let shape = Shape::rgb(job.width, job.height);
        if job.src_format == SourceFormat::Raw && pool.shape() != shape {
            pool.lock().set_size(shape);
        }
        let bridge = StreamBridge::with_output_capacity(job.frames, pool.clone(), output_capacity);
        let handle = spawn_engine(engine, job, bridge.clone(), cancel);
        let host = Self {
            pool,
            producer: bridge.producer(),
            bridge,
            frames_added: 0,
        };
        (host, handle)
    }

    /// Queues frame `index`. Raw pixels are copied into a pooled rgb24 frame
    /// and the RGBA frame goes to `release`, whether or not queueing succeeds.
    pub fn add_frame(
        &mut self,
        index: u64,
        frame: CapturedFrame,
        release: impl FnOnce(Frame),
    ) -> Result<()> {
        let payload = match frame {
            CapturedFrame::Pixels(rgba) => {
                let rgb = self.convert(&rgba);
                release(rgba);
                Payload::Raw(rgb?)
            }
            CapturedFrame::Encoded(data) => Payload::Encoded(data),
        };
        self.producer.enqueue(index, payload)?;
        self.frames_added += 1;
        Ok(())
    }

    fn convert(&self, rgba: &Frame) -> Result<Frame> {
        let mut rgb = self.pool.get_frame()?;
        if let Err(e) = rgba.strip_alpha_into(&mut rgb) {
            self.pool.free_frame(rgb);
            return Err(e);
        }
        Ok(rgb)
    }

    pub fn abort(&self, reason: &str) {
        log::warn!(
            "aborting encode after {} of {} frames: {}",
            self.frames_added,
            self.bridge.expected_frames(),
            reason
        );
        self.producer.abort(reason);
    }

    pub fn frames_added(&self) -> u64 {
        self.frames_added
    }
}

/// Feeds capture ticks straight into an [`EncodeHost`] in the caller's
/// context, returning RGBA frames to the capture pool.
pub struct LocalSink {
    host: Mutex<EncodeHost>,
    capture_pool: SharedPool,
}

impl LocalSink {
    pub fn new(host: EncodeHost, capture_pool: SharedPool) -> Self {
        Self {
            host: Mutex::new(host),
            capture_pool,
        }
    }

    fn host(&self) -> std::sync::MutexGuard<'_, EncodeHost> {
        match self.host.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn abort(&self, reason: &str) {
        self.host().abort(reason);
    }
}

impl FrameSink for LocalSink {
    fn submit(&self, index: u64, frame: CapturedFrame) -> Result<()> {
        self.host().add_frame(index, frame, |rgba| {
            self.capture_pool.free_frame(rgba);
        })
    }
}
