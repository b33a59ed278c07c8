// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Live MJPEG streaming as `multipart/x-mixed-replace`.
//!
//! Every part carries one complete JPEG with its length and capture time.
//! The stream continues until the client goes away or a write fails.

use std::{
    io::{self, Write},
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, info, warn};

pub const PART_BOUNDARY: &str = "123456789000000000000987654321";

/// Largest request head read before the stream starts.
const MAX_REQUEST_HEAD: usize = 4096;

/// A compressed frame ready to be streamed.
#[derive(Clone, Debug)]
pub struct JpegFrame {
    pub data: Arc<Vec<u8>>,
    pub sequence: u64,
    pub timestamp: SystemTime,
}

pub fn stream_content_type() -> String {
    format!("multipart/x-mixed-replace;boundary={PART_BOUNDARY}")
}

/// Boundary line and headers preceding a part of `len` bytes.
pub fn part_header(len: usize, timestamp: SystemTime) -> String {
    let ts = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!(
        "\r\n--{PART_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\nX-Timestamp: {}.{:06}\r\n\r\n",
        ts.as_secs(),
        ts.subsec_micros()
    )
}

fn response_head() -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        stream_content_type()
    )
}

/// Frames JPEG images onto a blocking writer.
pub struct MjpegWriter<W: Write> {
    inner: W,
    frames: u64,
}

impl<W: Write> MjpegWriter<W> {
    pub fn new(inner: W) -> Self {
        MjpegWriter { inner, frames: 0 }
    }

    /// Writes the HTTP response head announcing the stream.
    pub fn write_head(&mut self) -> io::Result<()> {
        self.inner.write_all(response_head().as_bytes())
    }

    pub fn write_frame(&mut self, frame: &JpegFrame) -> io::Result<()> {
        self.inner
            .write_all(part_header(frame.data.len(), frame.timestamp).as_bytes())?;
        self.inner.write_all(&frame.data)?;
        self.inner.flush()?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &JpegFrame) -> io::Result<()> {
    stream
        .write_all(part_header(frame.data.len(), frame.timestamp).as_bytes())
        .await?;
    stream.write_all(&frame.data).await?;
    stream.flush().await
}

async fn read_request_head(stream: &mut TcpStream) -> io::Result<()> {
    let mut head = Vec::with_capacity(512);
    let mut buf = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&buf[..n]);
        if head.len() > MAX_REQUEST_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
    Ok(())
}

async fn stream_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut frames: watch::Receiver<Option<JpegFrame>>,
) -> io::Result<u64> {
    read_request_head(&mut stream).await?;
    stream.write_all(response_head().as_bytes()).await?;
    debug!(%peer, "mjpeg client connected");

    let mut sent = 0;
    let current = frames.borrow_and_update().clone();
    if let Some(frame) = current {
        write_frame(&mut stream, &frame).await?;
        sent += 1;
    }
    // ends when the publisher is dropped
    while frames.changed().await.is_ok() {
        let frame = frames.borrow_and_update().clone();
        if let Some(frame) = frame {
            write_frame(&mut stream, &frame).await?;
            sent += 1;
        }
    }
    Ok(sent)
}

/// Streams published frames to every client that connects to `listener`.
///
/// Any request path receives the stream. Runs until accepting fails.
pub async fn serve(
    listener: TcpListener,
    frames: watch::Receiver<Option<JpegFrame>>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "mjpeg server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let frames = frames.clone();
        tokio::spawn(async move {
            match stream_client(stream, peer, frames).await {
                Ok(sent) => debug!(%peer, sent, "mjpeg stream ended"),
                Err(err) => match err.kind() {
                    io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof => debug!(%peer, "mjpeg client left"),
                    _ => warn!(%peer, "mjpeg stream failed: {err}"),
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timestamp_has_microseconds() {
        let ts = UNIX_EPOCH + Duration::new(12, 3_000);
        let header = part_header(100, ts);
        assert!(header.contains("X-Timestamp: 12.000003\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }
}
