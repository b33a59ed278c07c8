// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::Args;
use clap::Parser;
use std::{error::Error, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, EnvFilter, Layer};
use vision_camera::{
    arbiter::{NoPins, PinControl, ResourceArbiter, SysfsPins},
    backend::BackendKind,
    camera::{CameraConfig, CameraDevice},
    explain::HttpTransport,
    flash::{FlashLed, SysfsFlash},
    mjpeg,
    pipeline::{CpuScaleRotate, PixelPipeline},
    sensor::I2cBus,
    vision::{VisionConfig, VisionService},
};

mod args;

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stdout_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy(),
    );

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(level)),
        Err(_) => None,
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(level))
    } else {
        None
    };

    let console = args.tokio_console.then(console_subscriber::spawn);

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn build_service(args: &Args) -> Result<VisionService, Box<dyn Error>> {
    let backend = BackendKind::from(args.backend).create();
    let mut camera = CameraDevice::new(backend, CameraConfig::from(args));
    if let Some(path) = &args.i2c_bus {
        match I2cBus::open(path) {
            Ok(bus) => camera = camera.with_bus(Box::new(bus)),
            Err(err) => warn!(path = %path.display(), "sensor bus unavailable: {err}"),
        }
    }
    if args.srm {
        camera = camera.with_pipeline(PixelPipeline::with_engine(Box::new(CpuScaleRotate)));
    }

    let pins: Box<dyn PinControl> = if args.camera_pins.is_empty() {
        Box::new(NoPins)
    } else {
        Box::new(SysfsPins::new(args.camera_pins.clone()))
    };
    let arbiter = Arc::new(ResourceArbiter::new(pins));

    let flash = match &args.flash_led {
        Some(name) => Some(SysfsFlash::open_named(name)?),
        None => SysfsFlash::discover(),
    }
    .map(|led| Box::new(led) as Box<dyn FlashLed>);

    Ok(VisionService::new(
        VisionConfig::from(args),
        camera,
        arbiter,
        Box::new(HttpTransport::new()),
        flash,
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let service = Arc::new(build_service(&args)?);
    {
        let service = service.clone();
        tokio::task::spawn_blocking(move || service.start()).await??;
    }
    info!(status = %service.status(), "camera ready");

    if let Some(question) = args.explain.clone() {
        let worker = service.clone();
        let answer =
            tokio::task::spawn_blocking(move || worker.capture_and_explain(&question)).await?;
        let stopper = service.clone();
        tokio::task::spawn_blocking(move || stopper.stop()).await??;
        println!("{}", answer?);
        return Ok(());
    }

    if args.stream {
        service.start_streaming()?;
    }

    if let Some(addr) = &args.listen {
        let listener = TcpListener::bind(addr).await?;
        let frames = service.frames();
        tokio::spawn(async move {
            if let Err(err) = mjpeg::serve(listener, frames).await {
                error!("mjpeg server stopped: {err}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    tokio::task::spawn_blocking(move || service.stop()).await??;
    Ok(())
}
