// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::error::Error;
use vision_camera::{
    format::FormatPriority,
    image::{self, frame_size, FourCC, FrameBuffer, Resolution, Rotation},
    pipeline::{rgb888_to_rgb565, CpuScaleRotate, PixelPipeline},
    ErrorKind,
};

#[test]
fn test_formats() -> Result<(), Box<dyn Error>> {
    assert_eq!(frame_size(image::YUYV, 640, 480), Some(614400));
    assert_eq!(frame_size(image::RGBP, 640, 480), Some(614400));
    assert_eq!(frame_size(image::RGB3, 640, 480), Some(921600));
    assert_eq!(frame_size(image::GREY, 640, 480), Some(307200));
    assert_eq!(frame_size(image::YUV420, 640, 480), Some(460800));
    assert_eq!(frame_size(image::JPEG, 640, 480), None);

    let fourcc: FourCC = "YUYV".parse()?;
    assert_eq!(fourcc, image::YUYV);
    assert_eq!(image::YUV422P.to_string(), "422P");
    assert!("YUV".parse::<FourCC>().is_err());
    assert_eq!(Resolution::QVGA.to_string(), "320x240");

    Ok(())
}

#[test]
fn test_negotiate_lowest_rank() -> Result<(), Box<dyn Error>> {
    // RGB24 = 0, RGB565 = 1, YUV420 = 2
    let priority = FormatPriority::rotation(true);
    assert_eq!(priority.select(&[image::YUYV, image::YUV420])?, image::YUV420);
    assert_eq!(
        priority.select(&[image::YUV420, image::RGBP, image::RGB3])?,
        image::RGB3
    );

    let err = FormatPriority::default()
        .select(&[image::JPEG, image::YUYV])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HardwareFault);

    // equal ranks go to the first advertised format
    let tied = FormatPriority::new([(image::RGB3, 1), (image::RGBP, 1)]);
    assert_eq!(tied.select(&[image::RGBP, image::RGB3])?, image::RGBP);
    assert_eq!(tied.select(&[image::RGB3, image::RGBP])?, image::RGB3);

    Ok(())
}

#[test]
fn test_convert() -> Result<(), Box<dyn Error>> {
    let pipeline = PixelPipeline::new();

    // mislabelled planar data is packed already, only the tag changes
    let data = vec![16, 128, 235, 128, 81, 90, 145, 240];
    let frame = FrameBuffer::new(data.clone(), 4, 1, image::YUV422P);
    let out = pipeline.convert(frame, image::YUYV)?;
    assert_eq!(out.format, image::YUYV);
    assert_eq!(out.data, data);

    let frame = FrameBuffer::new(vec![0x12, 0x34, 0x56, 0x78], 2, 1, image::RGBR);
    let out = pipeline.convert(frame, image::RGBP)?;
    assert_eq!(out.data, vec![0x34, 0x12, 0x78, 0x56]);

    let frame = FrameBuffer::new(vec![0, 255], 2, 1, image::GREY);
    let out = pipeline.convert(frame, image::RGB3)?;
    assert_eq!(out.data, vec![0, 0, 0, 255, 255, 255]);

    let frame = FrameBuffer::new(vec![0; 6], 2, 1, image::RGB3);
    let err = pipeline.convert(frame, image::YUYV).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    Ok(())
}

#[test]
fn test_rotate() -> Result<(), Box<dyn Error>> {
    let pipeline = PixelPipeline::new();
    let frame = FrameBuffer::new(vec![0; 4 * 2 * 2], 4, 2, image::RGBP);
    let out = pipeline.rotate(frame, Rotation::Rotation90)?;
    assert_eq!((out.width, out.height), (2, 4));
    assert_eq!(out.format, image::RGBP);

    let frame = FrameBuffer::new(vec![1, 2, 3, 4], 2, 2, image::GREY);
    let out = pipeline.rotate(frame, Rotation::Rotation180)?;
    assert_eq!(out.data, vec![4, 3, 2, 1]);

    // packed 4:2:2 comes back as RGB565
    let frame = FrameBuffer::new(vec![128; 4 * 2 * 2], 4, 2, image::YUYV);
    let out = pipeline.rotate(frame, Rotation::Rotation270)?;
    assert_eq!((out.width, out.height, out.format), (2, 4, image::RGBP));
    assert_eq!(out.len(), 16);

    let frame = FrameBuffer::new(vec![0; 12], 4, 2, image::YUV420);
    let err = pipeline.rotate(frame, Rotation::Rotation90).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    Ok(())
}

#[test]
fn test_rotate_engine_matches_software() -> Result<(), Box<dyn Error>> {
    let (w, h) = (6, 4);
    let rgb: Vec<u8> = (0..w * h * 3).map(|i| (i * 8 % 256) as u8).collect();

    let software = PixelPipeline::new().rotate(
        FrameBuffer::new(rgb.clone(), w, h, image::RGB3),
        Rotation::Rotation90,
    )?;
    let engine = PixelPipeline::with_engine(Box::new(CpuScaleRotate));
    assert_eq!(engine.engine_name(), Some("cpu"));
    let accelerated = engine.rotate(FrameBuffer::new(rgb, w, h, image::RGB3), Rotation::Rotation90)?;

    assert_eq!((accelerated.width, accelerated.height), (h, w));
    assert_eq!(accelerated.format, image::RGBP);
    assert_eq!(accelerated.data, rgb888_to_rgb565(&software.data));

    Ok(())
}

#[test]
fn test_rotate_keeps_metadata() -> Result<(), Box<dyn Error>> {
    let mut frame = FrameBuffer::new(vec![0; 8 * 4 * 3], 8, 4, image::RGB3);
    frame.sequence = 42;
    let timestamp = frame.timestamp;
    let out = PixelPipeline::new().rotate(frame, Rotation::Rotation90)?;
    assert_eq!(out.sequence, 42);
    assert_eq!(out.timestamp, timestamp);
    Ok(())
}
