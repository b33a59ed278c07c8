// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{
    error::Error,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::timeout,
};
use vision_camera::mjpeg::{self, JpegFrame, MjpegWriter, PART_BOUNDARY};

fn frame(data: &[u8], sequence: u64) -> JpegFrame {
    JpegFrame {
        data: Arc::new(data.to_vec()),
        sequence,
        timestamp: UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000),
    }
}

#[test]
fn test_part_framing() -> Result<(), Box<dyn Error>> {
    assert_eq!(
        mjpeg::stream_content_type(),
        format!("multipart/x-mixed-replace;boundary={PART_BOUNDARY}")
    );

    let mut writer = MjpegWriter::new(Vec::new());
    writer.write_frame(&frame(b"\xff\xd8one\xff\xd9", 0))?;
    writer.write_frame(&frame(b"\xff\xd8two!\xff\xd9", 1))?;
    assert_eq!(writer.frames_written(), 2);

    let out = writer.into_inner();
    let expected_first = format!(
        "\r\n--{PART_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: 7\r\nX-Timestamp: 1700000000.250000\r\n\r\n"
    );
    assert!(out.starts_with(expected_first.as_bytes()));
    let text = String::from_utf8_lossy(&out);
    assert_eq!(text.matches(&format!("--{PART_BOUNDARY}\r\n")).count(), 2);
    assert!(text.contains("Content-Length: 8\r\n"));
    Ok(())
}

#[test]
fn test_response_head() -> Result<(), Box<dyn Error>> {
    let mut writer = MjpegWriter::new(Vec::new());
    writer.write_head()?;
    let head = String::from_utf8(writer.into_inner())?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains(&format!("Content-Type: {}\r\n", mjpeg::stream_content_type())));
    assert!(head.ends_with("\r\n\r\n"));
    Ok(())
}

async fn read_until(stream: &mut TcpStream, buf: &mut Vec<u8>, needle: &[u8]) -> std::io::Result<()> {
    let mut chunk = [0u8; 1024];
    while !buf.windows(needle.len()).any(|w| w == needle) {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

#[tokio::test]
async fn test_serve_streams_published_frames() -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = watch::channel(Some(frame(b"FIRST-FRAME", 1)));
    let server = tokio::spawn(mjpeg::serve(listener, rx));

    let mut client = TcpStream::connect(addr).await?;
    client
        .write_all(b"GET /stream HTTP/1.1\r\nHost: camera\r\n\r\n")
        .await?;

    let mut received = Vec::new();
    timeout(
        Duration::from_secs(5),
        read_until(&mut client, &mut received, b"FIRST-FRAME"),
    )
    .await??;
    let text = String::from_utf8_lossy(&received).to_string();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("multipart/x-mixed-replace"));

    tx.send_replace(Some(JpegFrame {
        timestamp: SystemTime::now(),
        ..frame(b"SECOND-FRAME", 2)
    }));
    timeout(
        Duration::from_secs(5),
        read_until(&mut client, &mut received, b"SECOND-FRAME"),
    )
    .await??;
    assert!(String::from_utf8_lossy(&received).contains("Content-Length: 12\r\n"));

    server.abort();
    Ok(())
}
