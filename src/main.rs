use capture_bus::{CaptureSession, PassthroughEngine};
use tokio::io::AsyncWriteExt as _;

mod config;
mod source;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("capture_bus", log::LevelFilter::Debug)
        .filter_module("framecap", log::LevelFilter::Debug)
        .init();
}

async fn run() -> anyhow::Result<()> {
    let config = config::config();
    let session = CaptureSession::new(
        config.session().clone(),
        source::GradientSource::new(),
        PassthroughEngine,
    )?;
    log::info!(
        "recording {} frames as {:?}",
        session.expected_frames(),
        config.session().format
    );

    let cancel = session.cancel_token();
    let recording = tokio::select! {
        recording = session.record() => recording?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("interrupted");
        }
    };

    let output = config.output();
    let mut file = tokio::fs::File::create(&output).await?;
    file.write_all(&recording.data).await?;
    file.sync_all().await?;
    log::info!(
        "wrote {} ({}, {} bytes, {}x{} x{} frames) in {:?}",
        output,
        recording.mime,
        recording.data.len(),
        recording.width,
        recording.height,
        recording.frames,
        recording.elapsed
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
