// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{
    error::Error,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};
use vision_camera::{
    arbiter::{NoPins, ResourceArbiter, ResourceState},
    backend::PatternBackend,
    camera::{CameraConfig, CameraDevice},
    explain::{
        multipart, ExplainConfig, UploadRequest, UploadResponse, UploadStream, UploadTransport,
    },
    flash::FlashLed,
    vision::{VisionConfig, VisionService},
    ErrorKind,
};

#[derive(Default)]
struct Recorded {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    writes: usize,
    finished: bool,
    abandoned: usize,
}

/// Transport that keeps the request in memory and answers with a fixed status.
#[derive(Clone)]
struct MockTransport {
    recorded: Arc<Mutex<Recorded>>,
    status: u16,
    reply: &'static str,
    refuse: bool,
    /// Total write count at which a write fails.
    fail_at_write: Option<usize>,
}

impl MockTransport {
    fn answering(status: u16, reply: &'static str) -> Self {
        MockTransport {
            recorded: Arc::default(),
            status,
            reply,
            refuse: false,
            fail_at_write: None,
        }
    }

    fn failing_at_write(n: usize, reply: &'static str) -> Self {
        MockTransport {
            fail_at_write: Some(n),
            ..Self::answering(200, reply)
        }
    }

    fn refusing() -> Self {
        MockTransport {
            refuse: true,
            ..Self::answering(200, "")
        }
    }
}

struct MockUpload {
    recorded: Arc<Mutex<Recorded>>,
    response: UploadResponse,
    fail_at_write: Option<usize>,
    finished: bool,
}

impl UploadStream for MockUpload {
    fn write(&mut self, data: &[u8]) -> vision_camera::Result<()> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.writes += 1;
        if Some(recorded.writes) == self.fail_at_write {
            return Err(vision_camera::Error::Network("connection reset".to_string()));
        }
        recorded.body.extend_from_slice(data);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> vision_camera::Result<UploadResponse> {
        self.finished = true;
        self.recorded.lock().unwrap().finished = true;
        Ok(self.response.clone())
    }
}

impl Drop for MockUpload {
    fn drop(&mut self) {
        if !self.finished {
            self.recorded.lock().unwrap().abandoned += 1;
        }
    }
}

impl UploadTransport for MockTransport {
    fn open(&self, request: &UploadRequest) -> vision_camera::Result<Box<dyn UploadStream>> {
        if self.refuse {
            return Err(vision_camera::Error::Network("connection refused".to_string()));
        }
        self.recorded.lock().unwrap().headers = request.headers.clone();
        Ok(Box::new(MockUpload {
            recorded: self.recorded.clone(),
            response: UploadResponse {
                status: self.status,
                body: self.reply.to_string(),
            },
            fail_at_write: self.fail_at_write,
            finished: false,
        }))
    }
}

#[derive(Clone, Default)]
struct MockFlash(Arc<Mutex<Vec<u8>>>);

impl MockFlash {
    fn last(&self) -> Option<u8> {
        self.0.lock().unwrap().last().copied()
    }
}

impl FlashLed for MockFlash {
    fn name(&self) -> &str {
        "mock:flash"
    }

    fn set_level(&mut self, percent: u8) -> vision_camera::Result<()> {
        self.0.lock().unwrap().push(percent);
        Ok(())
    }
}

fn explain_config() -> ExplainConfig {
    ExplainConfig {
        url: "http://explain.local/api".to_string(),
        token: "token".to_string(),
        device_id: "device".to_string(),
        client_id: "client".to_string(),
        ..Default::default()
    }
}

fn camera() -> CameraDevice {
    let config = CameraConfig {
        scratch_memory: Some(8 * 1024 * 1024),
        dequeue_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    CameraDevice::new(Box::new(PatternBackend::new()), config)
}

fn arbiter() -> Arc<ResourceArbiter> {
    Arc::new(
        ResourceArbiter::new(Box::new(NoPins))
            .with_settle(Duration::ZERO)
            .with_lock_timeout(Duration::from_millis(500)),
    )
}

fn service(
    transport: MockTransport,
    flash: Option<MockFlash>,
    explain: Option<ExplainConfig>,
) -> VisionService {
    let config = VisionConfig {
        stream_interval: Duration::from_millis(10),
        flash_settle: Duration::from_millis(1),
        explain,
        ..Default::default()
    };
    service_with(config, transport, flash)
}

fn service_with(
    config: VisionConfig,
    transport: MockTransport,
    flash: Option<MockFlash>,
) -> VisionService {
    VisionService::new(
        config,
        camera(),
        arbiter(),
        Box::new(transport),
        flash.map(|f| Box::new(f) as Box<dyn FlashLed>),
    )
}

#[test]
fn test_explain_success() -> Result<(), Box<dyn Error>> {
    let transport = MockTransport::answering(200, "{\"answer\":\"a test pattern\"}");
    let service = service(transport.clone(), None, Some(explain_config()));
    service.start()?;

    let reply = service.capture_and_explain("what is this?")?;
    assert_eq!(reply, "{\"answer\":\"a test pattern\"}");
    assert!(!service.encoder_in_flight());

    let recorded = transport.recorded.lock().unwrap();
    assert!(recorded.finished);
    assert!(recorded
        .headers
        .iter()
        .any(|(k, v)| k == "Authorization" && v == "Bearer token"));

    let boundary = &explain_config().boundary;
    let head = format!(
        "{}{}",
        multipart::question_part(boundary, "what is this?"),
        multipart::file_part_header(boundary)
    );
    let footer = multipart::footer(boundary);
    let body = &recorded.body;
    assert!(body.starts_with(head.as_bytes()));
    assert!(body.ends_with(footer.as_bytes()));
    let jpeg = &body[head.len()..body.len() - footer.len()];
    assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9]);
    Ok(())
}

#[test]
fn test_explain_http_error() -> Result<(), Box<dyn Error>> {
    let transport = MockTransport::answering(500, "internal error");
    let service = service(transport.clone(), None, Some(explain_config()));
    service.start()?;

    let err = service.capture_and_explain("hello").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    assert!(!service.encoder_in_flight());

    // the service stays usable after a failed upload
    assert!(!service.capture_jpeg()?.is_empty());
    Ok(())
}

#[test]
fn test_explain_write_failure_unblocks_encoder() -> Result<(), Box<dyn Error>> {
    // one chunk of queue and tiny chunks keep the encoder blocked when the
    // upload fails on its second image chunk
    let transport = MockTransport::failing_at_write(4, "second try");
    let config = VisionConfig {
        upload_chunk_size: 64,
        upload_queue_depth: 1,
        explain: Some(explain_config()),
        ..Default::default()
    };
    let service = service_with(config, transport.clone(), None);
    service.start()?;

    let err = service.capture_and_explain("hello").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    assert!(!service.encoder_in_flight());
    {
        let recorded = transport.recorded.lock().unwrap();
        assert_eq!(recorded.writes, 4);
        assert_eq!(recorded.abandoned, 1);
        assert!(!recorded.finished);
    }

    assert!(!service.capture_jpeg()?.is_empty());
    // the encoder and its queue are reusable for the next upload
    assert_eq!(service.capture_and_explain("again")?, "second try");
    let recorded = transport.recorded.lock().unwrap();
    assert!(recorded.finished);
    assert_eq!(recorded.abandoned, 1);
    Ok(())
}

#[test]
fn test_explain_connect_failure() -> Result<(), Box<dyn Error>> {
    let service = service(MockTransport::refusing(), None, Some(explain_config()));
    service.start()?;
    let err = service.capture_and_explain("hello").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    assert!(!service.encoder_in_flight());
    Ok(())
}

#[test]
fn test_explain_unconfigured() -> Result<(), Box<dyn Error>> {
    let transport = MockTransport::answering(200, "");
    let service = service(transport.clone(), None, None);
    service.start()?;
    let err = service.capture_and_explain("hello").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let empty = ExplainConfig {
        url: String::new(),
        ..explain_config()
    };
    let service2 = self::service(transport.clone(), None, Some(empty));
    assert!(service2.capture_and_explain("hello").is_err());
    assert_eq!(transport.recorded.lock().unwrap().writes, 0);
    Ok(())
}

#[test]
fn test_capture_requires_start() -> Result<(), Box<dyn Error>> {
    let service = service(MockTransport::answering(200, ""), None, None);
    let err = service.capture().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(
        service.start_streaming().unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    Ok(())
}

#[test]
fn test_lifecycle_and_status() -> Result<(), Box<dyn Error>> {
    let service = service(MockTransport::answering(200, ""), None, None);
    let status = service.status();
    assert_eq!(status["running"], false);
    assert_eq!(status["available"], true);
    assert_eq!(status["resource_state"], "idle");

    service.start()?;
    assert_eq!(service.arbiter().state(), ResourceState::CameraActive);
    let status = service.status();
    assert_eq!(status["running"], true);
    assert_eq!(status["streaming"], false);
    assert_eq!(status["has_flash"], false);
    assert_eq!(status["sensor"], "OV2640");
    assert_eq!(status["enabled"], true);
    assert_eq!(status["initialized"], true);
    assert_eq!(status["resource_state"], "camera_active");
    for key in ["brightness", "contrast", "saturation", "hmirror", "vflip", "led_intensity"] {
        assert!(status.get(key).is_some(), "missing {key}");
    }

    service.stop()?;
    assert!(!service.is_running());
    assert_eq!(service.arbiter().state(), ResourceState::Idle);
    Ok(())
}

#[test]
fn test_start_while_audio_holds_pins() -> Result<(), Box<dyn Error>> {
    let service = service(MockTransport::answering(200, ""), None, None);
    service.arbiter().lock_for_audio()?;
    assert_eq!(service.start().unwrap_err().kind(), ErrorKind::ResourceBusy);
    assert!(!service.is_running());
    assert_eq!(service.status()["available"], false);

    service.arbiter().release()?;
    service.start()?;
    Ok(())
}

#[test]
fn test_streaming_publishes_frames() -> Result<(), Box<dyn Error>> {
    let service = service(MockTransport::answering(200, ""), None, None);
    service.start()?;
    let mut frames = service.frames();
    service.start_streaming()?;
    assert!(service.is_streaming());
    assert_eq!(
        service.start_streaming().unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(async {
        tokio::time::timeout(Duration::from_secs(5), frames.changed()).await
    })??;
    let frame = frames.borrow_and_update().clone().ok_or_else(|| io::Error::other("no frame"))?;
    assert_eq!(&frame.data[..2], &[0xff, 0xd8]);

    service.stop_streaming();
    assert!(!service.is_streaming());
    // still running, capture works outside streaming
    service.capture()?;
    Ok(())
}

#[test]
fn test_flash_capped_while_streaming() -> Result<(), Box<dyn Error>> {
    let flash = MockFlash::default();
    let service = service(MockTransport::answering(200, ""), Some(flash.clone()), None);
    assert!(service.has_flash());
    service.start()?;

    assert_eq!(service.set_flash_level(80)?, 80);
    assert_eq!(flash.last(), Some(80));

    service.start_streaming()?;
    assert_eq!(flash.last(), Some(50));
    assert_eq!(service.status()["led_intensity"], 50);
    assert_eq!(service.set_flash_level(30)?, 30);
    assert_eq!(service.set_flash_level(120)?, 50);
    assert_eq!(service.flash_level(), 100);

    service.stop_streaming();
    assert_eq!(flash.last(), Some(100));

    assert_eq!(service.set_flash_level(-5)?, 0);
    service.stop()?;
    assert_eq!(flash.last(), Some(0));
    Ok(())
}

#[test]
fn test_flash_capture_restores_level() -> Result<(), Box<dyn Error>> {
    let flash = MockFlash::default();
    let service = service(MockTransport::answering(200, ""), Some(flash.clone()), None);
    service.start()?;
    service.set_flash_level(20)?;

    service.capture_with_flash()?;
    let levels = flash.0.lock().unwrap().clone();
    assert_eq!(levels, vec![20, 100, 20]);
    Ok(())
}

#[test]
fn test_flash_level_without_led() -> Result<(), Box<dyn Error>> {
    let service = service(MockTransport::answering(200, ""), None, None);
    assert!(!service.has_flash());
    assert_eq!(service.set_flash_level(40)?, 40);
    assert_eq!(service.flash_level(), 40);
    Ok(())
}

#[test]
fn test_sensor_controls() -> Result<(), Box<dyn Error>> {
    let service = service(MockTransport::answering(200, ""), None, None);
    service.start()?;
    assert_eq!(service.set_brightness(5)?, 2);
    assert_eq!(service.set_contrast(-7)?, -2);
    service.set_hmirror(true)?;
    let settings = service.settings();
    assert_eq!(settings.brightness, 2);
    assert_eq!(settings.contrast, -2);
    assert!(settings.hmirror);
    assert_eq!(service.status()["brightness"], 2);
    Ok(())
}
