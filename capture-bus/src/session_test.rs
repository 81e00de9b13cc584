use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{CaptureSession, SessionState};
use crate::config::SessionConfig;
use crate::engine::{
    EncodeJob, EncodingEngine, OutputFormat, PassthroughEngine, SourceFormat, WriteSeek,
};
use crate::error::{CaptureError, Result};
use crate::source::FrameSource;

const FRAME_LEN: usize = 64 * 48 * 3;

fn colour(i: u8) -> [u8; 3] {
    [i.wrapping_mul(20), 255 - i.wrapping_mul(20), i.wrapping_mul(7).wrapping_add(3)]
}

/// Paints every readback a solid colour, a new one per call.
#[derive(Default)]
struct SolidColours {
    next: u8,
    fail_at: Option<u8>,
}

impl FrameSource for SolidColours {
    fn read_pixels(&mut self, _width: u32, _height: u32, dst: &mut [u8]) -> Result<()> {
        if self.fail_at == Some(self.next) {
            return Err(CaptureError::source_failure("render context lost", false));
        }
        let [r, g, b] = colour(self.next);
        self.next += 1;
        for px in dst.chunks_exact_mut(4) {
            px.copy_from_slice(&[r, g, b, 255]);
        }
        Ok(())
    }

    fn snapshot_png(&mut self, _width: u32, _height: u32) -> Result<Vec<u8>> {
        let still = format!("PNG{}", self.next).into_bytes();
        self.next += 1;
        Ok(still)
    }
}

/// Writes a placeholder header, copies the input, then patches the header.
#[derive(Clone, Default)]
struct HeaderEngine {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl EncodingEngine for HeaderEngine {
    fn run(
        &mut self,
        _job: &EncodeJob,
        input: &mut dyn Read,
        output: &mut dyn WriteSeek,
    ) -> anyhow::Result<()> {
        output.write_all(b"HDR0")?;
        let mut body = Vec::new();
        input.read_to_end(&mut body)?;
        output.write_all(&body)?;
        output.seek(SeekFrom::Start(3))?;
        output.write_all(b"1")?;
        output.seek(SeekFrom::End(0))?;
        *self.seen.lock().unwrap() = body;
        Ok(())
    }
}

struct FailingEngine;

impl EncodingEngine for FailingEngine {
    fn run(
        &mut self,
        _job: &EncodeJob,
        input: &mut dyn Read,
        _output: &mut dyn WriteSeek,
    ) -> anyhow::Result<()> {
        let mut buf = [0u8; 100];
        input.read_exact(&mut buf)?;
        Err(anyhow::anyhow!("unsupported pixel format"))
    }
}

fn config(use_relay: bool) -> SessionConfig {
    SessionConfig {
        width: 65,
        height: 49,
        fps: 10,
        time: 1.0,
        format: OutputFormat::Raw,
        use_relay,
        output_block_size: 4096,
        ..SessionConfig::default()
    }
}

fn assert_colour_order(data: &[u8], frames: usize) {
    assert_eq!(data.len(), frames * FRAME_LEN);
    for (i, frame) in data.chunks_exact(FRAME_LEN).enumerate() {
        let expected = colour(i as u8);
        assert!(
            frame.chunks_exact(3).all(|px| px == &expected[..]),
            "frame {} out of order",
            i
        );
    }
}

async fn round_trip(use_relay: bool) -> anyhow::Result<()> {
    let engine = HeaderEngine::default();
    let seen = engine.seen.clone();
    let session = CaptureSession::new(config(use_relay), SolidColours::default(), engine)?;
    assert_eq!(session.expected_frames(), 10);
    let state = session.state();
    assert_eq!(*state.borrow(), SessionState::Idle);

    let recording = session.record().await?;
    assert_eq!((recording.width, recording.height), (64, 48));
    assert_eq!(recording.frames, 10);
    assert_eq!(recording.mime, "application/octet-stream");
    assert_eq!(*state.borrow(), SessionState::Completed);

    let input = seen.lock().unwrap().clone();
    assert_eq!(input.len(), 92160);
    assert_colour_order(&input, 10);

    assert_eq!(&recording.data[..4], b"HDR1");
    assert_eq!(&recording.data[4..], &input[..]);
    assert!(recording.elapsed >= Duration::from_millis(900));
    Ok(())
}

#[tokio::test]
async fn test_round_trip_inline() -> anyhow::Result<()> {
    round_trip(false).await
}

#[tokio::test]
async fn test_round_trip_through_relay() -> anyhow::Result<()> {
    round_trip(true).await
}

#[tokio::test]
async fn test_png_stills_stream_in_order() -> anyhow::Result<()> {
    let mut settings = config(true);
    settings.src_format = SourceFormat::Png;
    settings.fps = 5;
    settings.format = OutputFormat::Gif;
    let session = CaptureSession::new(settings, SolidColours::default(), PassthroughEngine)?;

    let recording = session.record().await?;
    assert_eq!(recording.mime, "image/gif");
    assert_eq!(&recording.data[..], b"PNG0PNG1PNG2PNG3PNG4");
    Ok(())
}

async fn source_failure(use_relay: bool) -> anyhow::Result<()> {
    let source = SolidColours {
        fail_at: Some(3),
        ..SolidColours::default()
    };
    let session = CaptureSession::new(config(use_relay), source, PassthroughEngine)?;
    let state = session.state();

    let err = session.record().await.unwrap_err();
    assert!(matches!(err, CaptureError::FrameSource { .. }), "got {}", err);
    match &*state.borrow() {
        SessionState::Failed(reason) => assert!(reason.contains("render context lost")),
        other => panic!("unexpected state {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_source_failure_fails_inline_session() -> anyhow::Result<()> {
    source_failure(false).await
}

#[tokio::test]
async fn test_source_failure_fails_relayed_session() -> anyhow::Result<()> {
    source_failure(true).await
}

#[tokio::test]
async fn test_engine_failure_is_reported() -> anyhow::Result<()> {
    for use_relay in [false, true] {
        let session =
            CaptureSession::new(config(use_relay), SolidColours::default(), FailingEngine)?;
        let err = session.record().await.unwrap_err();
        assert!(matches!(err, CaptureError::Engine { .. }), "got {}", err);
        assert!(err.to_string().contains("unsupported pixel format"));
    }
    Ok(())
}

#[tokio::test]
async fn test_cancel_stops_recording() -> anyhow::Result<()> {
    let mut settings = config(false);
    settings.time = 10.0;
    let session = CaptureSession::new(settings, SolidColours::default(), PassthroughEngine)?;
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });

    let err = session.record().await.unwrap_err();
    assert!(err.to_string().contains("cancelled"), "got {}", err);
    Ok(())
}

#[test]
fn test_rejects_invalid_config() {
    let mut settings = config(false);
    settings.fps = 0;
    let err = CaptureSession::new(settings, SolidColours::default(), PassthroughEngine)
        .err()
        .unwrap();
    assert!(matches!(err, CaptureError::InvalidConfig { .. }));
}
