use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CapturePlan, CaptureScheduler, FrameSink, SharedSource};
use crate::engine::SourceFormat;
use crate::error::{CaptureError, Result};
use crate::frame::{CapturedFrame, Shape};
use crate::pool::SharedPool;
use crate::source::FrameSource;

#[derive(Default)]
struct CollectSink {
    frames: Mutex<Vec<(u64, CapturedFrame, Instant)>>,
}

impl FrameSink for CollectSink {
    fn submit(&self, index: u64, frame: CapturedFrame) -> Result<()> {
        self.frames.lock().unwrap().push((index, frame, Instant::now()));
        Ok(())
    }
}

fn shared(source: impl FrameSource + 'static) -> SharedSource {
    let source: Box<dyn FrameSource> = Box::new(source);
    Arc::new(Mutex::new(source))
}

fn plan(fps: u32, time: f64) -> CapturePlan {
    CapturePlan {
        width: 4,
        height: 2,
        fps,
        time,
        src_format: SourceFormat::Raw,
    }
}

#[test]
fn test_expected_frames_rounds_up() {
    assert_eq!(plan(25, 5.0).expected_frames(), 125);
    assert_eq!(plan(10, 1.0).expected_frames(), 10);
    assert_eq!(plan(10, 0.25).expected_frames(), 3);
    assert_eq!(plan(30, 0.0).expected_frames(), 0);
    assert_eq!(plan(25, 1.0).delay(), Duration::from_millis(40));
    assert_eq!(plan(3, 1.0).offset(3), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_ticks_fire_on_schedule_with_indices() -> anyhow::Result<()> {
    let start = Instant::now();
    let source = shared(move |_w: u32, _h: u32, dst: &mut [u8]| -> Result<()> {
        let tick = (Instant::now() - start).as_millis() / 100;
        dst.fill(tick as u8);
        Ok(())
    });
    let sink = Arc::new(CollectSink::default());
    let pool = SharedPool::new(Shape::rgba(1, 1));
    let scheduler =
        CaptureScheduler::new(source, pool.clone(), sink.clone(), CancellationToken::new());

    let capture = scheduler.schedule(plan(10, 1.0));
    assert_eq!(capture.expected_frames(), 10);
    assert_eq!(capture.join().await?, 10);

    let mut frames = std::mem::take(&mut *sink.frames.lock().unwrap());
    frames.sort_by_key(|(index, _, _)| *index);
    assert_eq!(frames.len(), 10);
    for (i, (index, frame, at)) in frames.iter().enumerate() {
        assert_eq!(*index, i as u64);
        assert_eq!(*at - start, Duration::from_millis(100 * i as u64));
        match frame {
            CapturedFrame::Pixels(frame) => {
                assert_eq!(frame.shape(), Shape::rgba(4, 2));
                assert!(frame.data().iter().all(|b| *b == i as u8));
            }
            CapturedFrame::Encoded(_) => panic!("expected pixels"),
        }
    }
    // The pool was resized to the plan's shape.
    assert_eq!(pool.shape(), Shape::rgba(4, 2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_failures_are_retried() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let source = shared(move |_w: u32, _h: u32, dst: &mut [u8]| -> Result<()> {
        // Every frame fails twice before succeeding.
        if counter.fetch_add(1, Ordering::SeqCst) % 3 != 2 {
            return Err(CaptureError::source_failure("surface busy", true));
        }
        dst.fill(1);
        Ok(())
    });
    let sink = Arc::new(CollectSink::default());
    let pool = SharedPool::new(Shape::rgba(4, 2));
    let scheduler =
        CaptureScheduler::new(source, pool.clone(), sink.clone(), CancellationToken::new())
            .with_tick_retries(2);

    assert_eq!(scheduler.schedule(plan(5, 1.0)).join().await?, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 15);
    assert_eq!(sink.frames.lock().unwrap().len(), 5);
    // Failed reads gave their frame back; five are held by the sink.
    assert_eq!(pool.lock().outstanding(), 5);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_cancels_remaining_ticks() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let source = shared(move |_w: u32, _h: u32, _dst: &mut [u8]| -> Result<()> {
        if counter.fetch_add(1, Ordering::SeqCst) == 2 {
            return Err(CaptureError::source_failure("context lost", false));
        }
        Ok(())
    });
    let sink = Arc::new(CollectSink::default());
    let scheduler = CaptureScheduler::new(
        source,
        SharedPool::new(Shape::rgba(4, 2)),
        sink.clone(),
        CancellationToken::new(),
    )
    .with_tick_retries(5);

    let err = scheduler.schedule(plan(10, 2.0)).join().await.unwrap_err();
    assert!(matches!(
        err,
        CaptureError::FrameSource {
            recoverable: false,
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(sink.frames.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_pending_ticks() -> anyhow::Result<()> {
    let source = shared(|_w: u32, _h: u32, _dst: &mut [u8]| -> Result<()> { Ok(()) });
    let sink = Arc::new(CollectSink::default());
    let session = CancellationToken::new();
    let scheduler = CaptureScheduler::new(
        source,
        SharedPool::new(Shape::rgba(4, 2)),
        sink.clone(),
        session.clone(),
    );

    let capture = scheduler.schedule(plan(10, 10.0));
    let canceller = session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        canceller.cancel();
    });

    let err = capture.join().await.unwrap_err();
    assert!(matches!(err, CaptureError::Cancelled));
    assert_eq!(sink.frames.lock().unwrap().len(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_png_source_format_uses_snapshots() -> anyhow::Result<()> {
    struct Stills;
    impl FrameSource for Stills {
        fn read_pixels(&mut self, _w: u32, _h: u32, _dst: &mut [u8]) -> Result<()> {
            panic!("raw readback on a png capture");
        }

        fn snapshot_png(&mut self, _w: u32, _h: u32) -> Result<Vec<u8>> {
            Ok(b"\x89PNG-still".to_vec())
        }
    }

    let sink = Arc::new(CollectSink::default());
    let scheduler = CaptureScheduler::new(
        shared(Stills),
        SharedPool::new(Shape::rgba(4, 2)),
        sink.clone(),
        CancellationToken::new(),
    );
    let mut png = plan(4, 1.0);
    png.src_format = SourceFormat::Png;
    assert_eq!(scheduler.schedule(png).join().await?, 4);

    let frames = sink.frames.lock().unwrap();
    assert!(frames
        .iter()
        .all(|(_, f, _)| matches!(f, CapturedFrame::Encoded(b) if &b[..] == b"\x89PNG-still")));
    Ok(())
}

#[test]
fn test_default_source_has_no_png_support() {
    let mut source = |_w: u32, _h: u32, _dst: &mut [u8]| -> Result<()> { Ok(()) };
    let err = FrameSource::snapshot_png(&mut source, 1, 1).unwrap_err();
    assert!(!err.is_recoverable());
}
