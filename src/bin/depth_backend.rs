//! Depth fusion backend - synthetic sensor to shared-memory/socket frames.
//!
//! Runs the full pipeline against the synthetic depth sensor and publishes
//! world frames over the transport(s) selected by the environment. Useful
//! as a development backend and as the producer side for black-box
//! transport tests.
//!
//! Environment:
//!   CALDERA_TRANSPORT     shm | socket | both (default: shm)
//!   CALDERA_RUN_SECS      stop after N seconds (default: run until Ctrl+C)
//!   CALDERA_SENSOR_TYPE   noise | constant | ramp (default: noise)
//!   plus every pipeline/transport key resolved by the config layer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use caldera::{
    FastGaussianBlur, FramePattern, ProcessingConfig, ProcessingPipeline, ShmPublisherConfig,
    SharedMemoryPublisher, SocketPublisher, SocketPublisherConfig, SyntheticSensor,
    SyntheticSensorConfig,
};

fn sensor_pattern() -> FramePattern {
    match std::env::var("CALDERA_SENSOR_TYPE").as_deref() {
        Ok("constant") => FramePattern::Constant { value: 1000 },
        Ok("ramp") => FramePattern::Ramp,
        _ => FramePattern::Noise { max_depth: 1500 },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let level = std::env::var("CALDERA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("caldera={level}").parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let transport = std::env::var("CALDERA_TRANSPORT").unwrap_or_else(|_| "shm".to_string());
    let (use_shm, use_socket) = match transport.as_str() {
        "shm" => (true, false),
        "socket" => (false, true),
        "both" => (true, true),
        other => {
            tracing::warn!("Unknown CALDERA_TRANSPORT '{}', using shm", other);
            (true, false)
        }
    };

    let shm = if use_shm {
        let mut publisher = SharedMemoryPublisher::new(ShmPublisherConfig::from_env());
        publisher.start()?;
        Some(Arc::new(Mutex::new(publisher)))
    } else {
        None
    };
    let socket = if use_socket {
        let mut publisher = SocketPublisher::new(SocketPublisherConfig::from_env());
        publisher.start()?;
        Some(Arc::new(Mutex::new(publisher)))
    } else {
        None
    };

    let cfg = ProcessingConfig::from_env();
    let sigma = cfg.fastgauss_sigma;
    let mut pipeline = ProcessingPipeline::new(cfg);
    pipeline.set_temporal_filter(Box::new(FastGaussianBlur::new(sigma)));

    let sink_shm = shm.clone();
    let sink_socket = socket.clone();
    pipeline.set_frame_sink(Box::new(move |frame| {
        if let Some(publisher) = &sink_shm {
            publisher.lock().unwrap().publish(frame);
        }
        if let Some(publisher) = &sink_socket {
            publisher.lock().unwrap().publish(frame);
        }
    }));

    let pipeline = Arc::new(Mutex::new(pipeline));
    let worker = pipeline.clone();
    let mut sensor = SyntheticSensor::new(SyntheticSensorConfig {
        pattern: sensor_pattern(),
        ..SyntheticSensorConfig::default()
    });
    sensor.set_depth_frame_callback(Box::new(move |raw| {
        worker.lock().unwrap().process_raw_depth_frame(raw);
    }));
    sensor.start();

    let run_secs: u64 = std::env::var("CALDERA_RUN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if run_secs > 0 {
        tracing::info!("Running for {} seconds", run_secs);
        tokio::time::sleep(Duration::from_secs(run_secs)).await;
    } else {
        tracing::info!("Running until Ctrl+C");
        tokio::signal::ctrl_c().await?;
    }

    // Two-phase shutdown: stop the sensor worker first, then the transports.
    sensor.stop();
    let frames = pipeline.lock().unwrap().frames_processed();
    tracing::info!("Processed {} frames", frames);
    if let Some(publisher) = &shm {
        let mut publisher = publisher.lock().unwrap();
        let stats = publisher.snapshot_stats();
        tracing::info!(
            "SHM published={} dropped={} fps={:.1}",
            stats.frames_published,
            stats.frames_dropped_capacity,
            stats.last_publish_fps
        );
        publisher.stop();
    }
    if let Some(publisher) = &socket {
        let mut publisher = publisher.lock().unwrap();
        let stats = publisher.snapshot_stats();
        tracing::info!(
            "Socket published={} fps={:.1}",
            stats.frames_published,
            stats.last_publish_fps
        );
        publisher.stop();
    }
    Ok(())
}
