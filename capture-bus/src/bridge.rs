//! Pull/push adapter between the capture queue and a synchronous encoder.
//!
//! ```text
//!  capture ticks ──► BridgeProducer::enqueue(index, payload)
//!                          │  (reordered by index)
//!                          ▼
//!  encoder input  ◄── BridgeInput::read_chunk   (WouldBlock until frame k exists)
//!  encoder output ──► BridgeOutput::write_chunk / reposition
//!                          │
//!                          ▼
//!                  StreamBridge::finish() ──► Bytes
//! ```

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{CaptureError, Result};
use crate::frame::Frame;
use crate::pool::SharedPool;

/// Initial output capacity, grown on demand.
pub const DEFAULT_OUTPUT_BLOCK: usize = 10 * 1024 * 1024;

/// How long a blocking reader sleeps between readiness checks.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Encoder-facing input: "give me the next bytes of the stream".
pub trait PullSource {
    /// Fills `buf` with the next bytes. `Ok(0)` is end of stream,
    /// `Err(WouldBlock)` means the next frame has not been captured yet.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Encoder-facing output: "store these bytes".
pub trait PushSink {
    /// Writes `buf` at `position`, or at the running cursor when `None`.
    fn write_chunk(&mut self, buf: &[u8], position: Option<u64>) -> Result<usize>;

    fn reposition(&mut self, pos: SeekFrom) -> Result<u64>;
}

/// One queued item of the input stream.
#[derive(Debug)]
pub enum Payload {
    /// Pool-backed raw frame, released to the encode pool once consumed.
    Raw(Frame),
    /// Encoded still image (png source format).
    Encoded(Bytes),
}

impl Payload {
    fn bytes(&self) -> &[u8] {
        match self {
            Payload::Raw(frame) => frame.data(),
            Payload::Encoded(data) => data,
        }
    }
}

struct InputState {
    expected: u64,
    pending: BTreeMap<u64, Payload>,
    next_index: u64,
    cursor: usize,
    bytes_read: u64,
    eos_signaled: bool,
    aborted: Option<String>,
}

impl InputState {
    fn at_end(&self) -> bool {
        self.next_index >= self.expected
    }

    fn admit(&self, index: u64, payload: &Payload) -> Result<()> {
        if let Some(reason) = &self.aborted {
            return Err(CaptureError::Aborted {
                reason: reason.clone(),
            });
        }
        if index >= self.expected {
            return Err(CaptureError::protocol(format!(
                "frame index {} out of range (expected {} frames)",
                index, self.expected
            )));
        }
        if payload.bytes().is_empty() {
            return Err(CaptureError::protocol(format!("frame index {} is empty", index)));
        }
        if index < self.next_index || self.pending.contains_key(&index) {
            return Err(CaptureError::protocol(format!(
                "frame index {} enqueued twice",
                index
            )));
        }
        Ok(())
    }
}

struct InputShared {
    state: Mutex<InputState>,
    readable: Condvar,
    recycle: SharedPool,
}

impl InputShared {
    fn lock(&self) -> MutexGuard<'_, InputState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct OutputState {
    buf: Vec<u8>,
    initial_capacity: usize,
    size: usize,
    position: u64,
    opened: bool,
    closed: bool,
    finished: bool,
}

impl OutputState {
    fn ensure_capacity(&mut self, needed: usize) -> Result<()> {
        let capacity = self.buf.len();
        if needed <= capacity {
            return Ok(());
        }
        let grown = needed.max(capacity.saturating_mul(2));
        self.buf
            .try_reserve_exact(grown - capacity)
            .map_err(|_| CaptureError::Allocation { bytes: grown })?;
        self.buf.resize(grown, 0);
        log::info!("resized output buffer to {} bytes", grown);
        Ok(())
    }
}

/// Frame queue plus output accumulator for one session.
#[derive(Clone)]
pub struct StreamBridge {
    input: Arc<InputShared>,
    output: Arc<Mutex<OutputState>>,
}

impl StreamBridge {
    pub fn new(expected_frames: u64, recycle: SharedPool) -> Self {
        Self::with_output_capacity(expected_frames, recycle, DEFAULT_OUTPUT_BLOCK)
    }

    pub fn with_output_capacity(
        expected_frames: u64,
        recycle: SharedPool,
        output_capacity: usize,
    ) -> Self {
        let input = InputShared {
            state: Mutex::new(InputState {
                expected: expected_frames,
                pending: BTreeMap::new(),
                next_index: 0,
                cursor: 0,
                bytes_read: 0,
                eos_signaled: false,
                aborted: None,
            }),
            readable: Condvar::new(),
            recycle,
        };
        let output = OutputState {
            buf: Vec::new(),
            initial_capacity: output_capacity,
            size: 0,
            position: 0,
            opened: false,
            closed: false,
            finished: false,
        };
        Self {
            input: Arc::new(input),
            output: Arc::new(Mutex::new(output)),
        }
    }

    pub fn producer(&self) -> BridgeProducer {
        BridgeProducer {
            input: Arc::clone(&self.input),
        }
    }

    pub fn input(&self) -> BridgeInput {
        BridgeInput {
            input: Arc::clone(&self.input),
        }
    }

    pub fn output(&self) -> BridgeOutput {
        BridgeOutput {
            output: Arc::clone(&self.output),
        }
    }

    pub fn expected_frames(&self) -> u64 {
        self.input.lock().expected
    }

    pub fn frames_consumed(&self) -> u64 {
        self.input.lock().next_index
    }

    pub fn bytes_read(&self) -> u64 {
        self.input.lock().bytes_read
    }

    pub fn input_finished(&self) -> bool {
        self.input.lock().at_end()
    }

    /// Takes the encoded output once input hit end of stream and the encoder
    /// closed its output. The buffer is trimmed to the bytes written.
    pub fn finish(&self) -> Result<Bytes> {
        {
            let input = self.input.lock();
            if let Some(reason) = &input.aborted {
                return Err(CaptureError::Aborted {
                    reason: reason.clone(),
                });
            }
            if !input.at_end() {
                return Err(CaptureError::protocol(format!(
                    "encoder finished after consuming {} of {} frames",
                    input.next_index, input.expected
                )));
            }
        }

        let mut output = lock_output(&self.output);
        if !output.closed {
            return Err(CaptureError::protocol("output still open"));
        }
        if output.finished {
            return Err(CaptureError::protocol("result already taken"));
        }
        output.finished = true;
        let size = output.size;
        let mut data = std::mem::take(&mut output.buf);
        data.truncate(size);
        Ok(Bytes::from(data))
    }
}

fn lock_output(output: &Mutex<OutputState>) -> MutexGuard<'_, OutputState> {
    match output.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Capture-side handle: queues frames by capture index.
#[derive(Clone)]
pub struct BridgeProducer {
    input: Arc<InputShared>,
}

impl BridgeProducer {
    /// Queues `payload` as frame `index`. A rejected raw frame goes back to
    /// the pool.
    pub fn enqueue(&self, index: u64, payload: Payload) -> Result<()> {
        let mut state = self.input.lock();
        if let Err(e) = state.admit(index, &payload) {
            drop(state);
            if let Payload::Raw(frame) = payload {
                self.input.recycle.free_frame(frame);
            }
            return Err(e);
        }
        state.pending.insert(index, payload);
        drop(state);
        self.input.readable.notify_all();
        Ok(())
    }

    /// Fails the stream; blocked and future reads return `Aborted`.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut state = self.input.lock();
        if state.aborted.is_none() {
            state.aborted = Some(reason.into());
        }
        let dropped: Vec<Payload> = std::mem::take(&mut state.pending).into_values().collect();
        drop(state);
        self.input.readable.notify_all();
        for payload in dropped {
            if let Payload::Raw(frame) = payload {
                self.input.recycle.free_frame(frame);
            }
        }
    }
}

/// Encoder-side input handle.
pub struct BridgeInput {
    input: Arc<InputShared>,
}

impl BridgeInput {
    /// Waits until a read can make progress or `timeout` elapses.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        let state = self.input.lock();
        let ready = |s: &InputState| {
            s.aborted.is_some() || s.at_end() || s.pending.contains_key(&s.next_index)
        };
        if ready(&state) {
            return true;
        }
        let (state, _) = match self
            .input
            .readable
            .wait_timeout_while(state, timeout, |s| !ready(s))
        {
            Ok(res) => res,
            Err(poisoned) => poisoned.into_inner(),
        };
        ready(&state)
    }
}

impl PullSource for BridgeInput {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.input.lock();
        if state.eos_signaled {
            return Err(CaptureError::protocol("read after end of stream"));
        }
        if let Some(reason) = &state.aborted {
            return Err(CaptureError::Aborted {
                reason: reason.clone(),
            });
        }
        if state.at_end() {
            log::info!(
                "final frame reached: {} frames, {} bytes",
                state.next_index,
                state.bytes_read
            );
            state.eos_signaled = true;
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let index = state.next_index;
        let cursor = state.cursor;
        let (written, exhausted) = match state.pending.get(&index) {
            None => return Err(CaptureError::WouldBlock),
            Some(payload) => {
                let data = payload.bytes();
                let n = (data.len() - cursor).min(buf.len());
                buf[..n].copy_from_slice(&data[cursor..cursor + n]);
                (n, cursor + n == data.len())
            }
        };

        state.bytes_read += written as u64;
        let finished = if exhausted {
            state.next_index += 1;
            state.cursor = 0;
            state.pending.remove(&index)
        } else {
            state.cursor += written;
            None
        };
        drop(state);

        if let Some(Payload::Raw(frame)) = finished {
            self.input.recycle.free_frame(frame);
        }
        if exhausted {
            // Wakes readers waiting for end of stream.
            self.input.readable.notify_all();
        }
        Ok(written)
    }
}

/// Adapts [`BridgeInput`] to `std::io::Read` for engines that expect a
/// blocking stream: retries on `WouldBlock` until data arrives or the
/// session is cancelled.
pub struct BlockingInput {
    inner: BridgeInput,
    cancel: CancellationToken,
}

impl BlockingInput {
    pub fn new(inner: BridgeInput, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl std::io::Read for BlockingInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.inner.read_chunk(buf) {
                Ok(n) => return Ok(n),
                Err(CaptureError::WouldBlock) => {
                    if self.cancel.is_cancelled() {
                        return Err(CaptureError::Cancelled.into());
                    }
                    self.inner.wait_readable(READ_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Encoder-side output handle.
#[derive(Clone)]
pub struct BridgeOutput {
    output: Arc<Mutex<OutputState>>,
}

impl BridgeOutput {
    pub fn open(&mut self) -> Result<()> {
        let mut output = lock_output(&self.output);
        if output.closed {
            return Err(CaptureError::protocol("output reopened after close"));
        }
        if !output.opened {
            let block = output.initial_capacity;
            output.ensure_capacity(block)?;
            output.opened = true;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        let mut output = lock_output(&self.output);
        if output.opened && !output.closed {
            log::debug!("output closed at {} bytes", output.size);
        }
        output.closed = true;
    }

    pub fn len(&self) -> usize {
        lock_output(&self.output).size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock_output(&self.output).buf.len()
    }

    pub fn position(&self) -> u64 {
        lock_output(&self.output).position
    }
}

impl PushSink for BridgeOutput {
    fn write_chunk(&mut self, buf: &[u8], position: Option<u64>) -> Result<usize> {
        let mut output = lock_output(&self.output);
        if !output.opened {
            return Err(CaptureError::protocol("write before open"));
        }
        if output.closed {
            return Err(CaptureError::protocol("write after close"));
        }
        let offset = position.unwrap_or(output.position);
        let start = usize::try_from(offset)
            .map_err(|_| CaptureError::protocol(format!("write offset {} out of range", offset)))?;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            CaptureError::protocol(format!(
                "write of {} bytes at {} overflows",
                buf.len(),
                offset
            ))
        })?;
        output.ensure_capacity(end)?;
        output.buf[start..end].copy_from_slice(buf);
        output.size = output.size.max(end);
        if position.is_none() {
            output.position = end as u64;
        }
        Ok(buf.len())
    }

    fn reposition(&mut self, pos: SeekFrom) -> Result<u64> {
        let mut output = lock_output(&self.output);
        if !output.opened {
            return Err(CaptureError::protocol("seek before open"));
        }
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => output.position.checked_add_signed(delta),
            SeekFrom::End(delta) => (output.size as u64).checked_add_signed(delta),
        };
        let target =
            target.ok_or_else(|| CaptureError::protocol(format!("invalid seek {:?}", pos)))?;
        output.position = target;
        Ok(target)
    }
}

impl std::io::Write for BridgeOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.write_chunk(buf, None)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::io::Seek for BridgeOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        Ok(self.reposition(pos)?)
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod bridge_test;
