// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! JPEG compression and chunked background encoding.
//!
//! [`JpegEncoder::encode_async`] compresses a frame on a background thread
//! and hands the result to the caller as a sequence of small chunks through
//! a bounded queue, so uploads can start before the whole image exists and
//! memory use stays bounded when the consumer is slow. The stream always
//! ends with a sentinel; a stream that ends without any data means the
//! encode failed.

use crate::{
    error::{Error, Result},
    image::{FrameBuffer, GREY, JPEG, RGB3, RGBP, RGBR, YUV420, YUV422P, YUYV},
    pipeline::{rgb565_to_rgb888, swap16, yuv420_to_rgb888, yuyv_to_rgb888},
};
use std::{borrow::Cow, sync::Arc, thread, thread::JoinHandle};
use tracing::{debug, error, warn};
use turbojpeg::{PixelFormat, Subsamp};

/// Encoder quality used when none is configured.
pub const DEFAULT_QUALITY: i32 = 80;
/// Bytes per queued chunk.
pub const CHUNK_SIZE: usize = 512;
/// Chunks the queue holds before the encoder blocks.
pub const QUEUE_CAPACITY: usize = 40;

/// Compresses a frame to JPEG using turbojpeg.
///
/// Raw YUV and RGB565 frames are expanded to RGB888 first; greyscale is
/// encoded as a single-channel JPEG. JPEG frames are returned as-is.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormat`] for formats without a conversion
/// and [`Error::Encode`] when compression fails.
///
/// # Example
///
/// ```no_run
/// use vision_camera::{image::{FrameBuffer, RGB3}, jpeg::encode_jpeg};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let frame = FrameBuffer::new(vec![128; 640 * 480 * 3], 640, 480, RGB3);
/// let jpeg = encode_jpeg(&frame, 80)?;
/// println!("Compressed to {} bytes", jpeg.len());
/// # Ok(())
/// # }
/// ```
pub fn encode_jpeg(frame: &FrameBuffer, quality: i32) -> Result<Vec<u8>> {
    let (w, h) = (frame.width, frame.height);
    let (pixels, format, channels, subsamp): (Cow<[u8]>, _, _, _) = match frame.format {
        JPEG => return Ok(frame.data.clone()),
        GREY => (Cow::Borrowed(frame.data.as_slice()), PixelFormat::GRAY, 1, Subsamp::Gray),
        RGB3 => (Cow::Borrowed(frame.data.as_slice()), PixelFormat::RGB, 3, Subsamp::Sub2x2),
        RGBP => (Cow::Owned(rgb565_to_rgb888(&frame.data)), PixelFormat::RGB, 3, Subsamp::Sub2x2),
        RGBR => (
            Cow::Owned(rgb565_to_rgb888(&swap16(&frame.data))),
            PixelFormat::RGB,
            3,
            Subsamp::Sub2x2,
        ),
        YUYV | YUV422P => (
            Cow::Owned(yuyv_to_rgb888(&frame.data, w, h)),
            PixelFormat::RGB,
            3,
            Subsamp::Sub2x1,
        ),
        YUV420 => (
            Cow::Owned(yuv420_to_rgb888(&frame.data, w, h)),
            PixelFormat::RGB,
            3,
            Subsamp::Sub2x2,
        ),
        other => return Err(Error::UnsupportedFormat(other)),
    };

    let pitch = w as usize * channels;
    if pixels.len() < pitch * h as usize {
        return Err(Error::Encode(format!(
            "frame holds {} bytes, {}x{} {} needs {}",
            pixels.len(),
            w,
            h,
            frame.format,
            pitch * h as usize
        )));
    }
    let image = turbojpeg::Image {
        pixels: pixels.as_ref(),
        width: w as usize,
        pitch,
        height: h as usize,
        format,
    };
    Ok(turbojpeg::compress(image, quality.clamp(1, 100), subsamp)?.to_vec())
}

/// Encodes `frame` and feeds the result to `sink` in pieces of at most
/// `chunk_size` bytes. Stops early when `sink` returns false.
pub fn encode_chunked(
    frame: &FrameBuffer,
    quality: i32,
    chunk_size: usize,
    mut sink: impl FnMut(&[u8]) -> bool,
) -> Result<usize> {
    let jpeg = encode_jpeg(frame, quality)?;
    let mut sent = 0;
    for chunk in jpeg.chunks(chunk_size.max(1)) {
        if !sink(chunk) {
            return Err(Error::Encode("chunk consumer went away".to_string()));
        }
        sent += chunk.len();
    }
    Ok(sent)
}

#[derive(Debug, PartialEq, Eq)]
pub enum JpegChunk {
    Data(Vec<u8>),
    /// End of stream, successful or not.
    Sentinel,
}

/// Producer half of a chunk queue.
pub struct ChunkSender {
    tx: kanal::Sender<JpegChunk>,
    sealed: bool,
}

impl ChunkSender {
    /// Queues a copy of `data`, blocking while the queue is full. Empty
    /// slices are skipped.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Error::Encode("chunk pushed after end of stream".to_string()));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(JpegChunk::Data(data.to_vec()))
            .map_err(|_| Error::Encode("chunk queue closed".to_string()))
    }

    /// Ends the stream. Later pushes are rejected.
    pub fn finish(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.sealed = true;
        self.tx
            .send(JpegChunk::Sentinel)
            .map_err(|_| Error::Encode("chunk queue closed".to_string()))
    }
}

impl Drop for ChunkSender {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            debug!("sentinel not delivered: {err}");
        }
    }
}

/// Consumer half of a chunk queue.
pub struct ChunkStream {
    rx: kanal::Receiver<JpegChunk>,
    done: bool,
    received: usize,
}

impl ChunkStream {
    /// Next chunk in submission order, `None` once the sentinel arrived.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv() {
            Ok(JpegChunk::Data(data)) => {
                self.received += data.len();
                Ok(Some(data))
            }
            Ok(JpegChunk::Sentinel) => {
                self.done = true;
                Ok(None)
            }
            Err(_) => {
                self.done = true;
                Err(Error::Encode("chunk queue closed without sentinel".to_string()))
            }
        }
    }

    /// Collects the remaining chunks into one buffer.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv()? {
            out.extend_from_slice(&chunk);
        }
        if self.received == 0 {
            return Err(Error::Encode("encoder produced no data".to_string()));
        }
        Ok(out)
    }

    /// Discards everything up to the sentinel, returning the bytes dropped.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while !self.done {
            match self.rx.recv() {
                Ok(JpegChunk::Data(data)) => dropped += data.len(),
                Ok(JpegChunk::Sentinel) | Err(_) => self.done = true,
            }
        }
        dropped
    }

    /// Chunks waiting in the queue.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Bytes of data handed out so far.
    pub fn bytes_received(&self) -> usize {
        self.received
    }

    /// True once the sentinel has been consumed.
    pub fn is_finished(&self) -> bool {
        self.done
    }
}

/// Creates a bounded chunk queue.
pub fn chunk_queue(capacity: usize) -> (ChunkSender, ChunkStream) {
    let (tx, rx) = kanal::bounded(capacity.max(1));
    (
        ChunkSender { tx, sealed: false },
        ChunkStream {
            rx,
            done: false,
            received: 0,
        },
    )
}

/// Background JPEG encoder with at most one encode in flight.
pub struct JpegEncoder {
    quality: i32,
    chunk_size: usize,
    capacity: usize,
    task: Option<JoinHandle<()>>,
}

impl Default for JpegEncoder {
    fn default() -> Self {
        JpegEncoder::new(DEFAULT_QUALITY)
    }
}

impl JpegEncoder {
    pub fn new(quality: i32) -> Self {
        JpegEncoder {
            quality,
            chunk_size: CHUNK_SIZE,
            capacity: QUEUE_CAPACITY,
            task: None,
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, capacity: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.capacity = capacity.max(1);
        self
    }

    pub fn quality(&self) -> i32 {
        self.quality
    }

    /// Starts encoding `frame` in the background.
    ///
    /// Waits for the previous encode to finish first, so the stream it
    /// returned must have been drained or dropped.
    pub fn encode_async(&mut self, frame: Arc<FrameBuffer>) -> ChunkStream {
        self.join();
        let (mut tx, rx) = chunk_queue(self.capacity);
        let (quality, chunk_size) = (self.quality, self.chunk_size);
        let spawned = thread::Builder::new()
            .name("jpeg-encoder".to_string())
            .spawn(move || {
                match encode_chunked(&frame, quality, chunk_size, |chunk| tx.push(chunk).is_ok()) {
                    Ok(bytes) => debug!(bytes, "jpeg encoded"),
                    Err(err) => warn!("jpeg encode failed: {err}"),
                }
                if let Err(err) = tx.finish() {
                    debug!("sentinel not delivered: {err}");
                }
            });
        match spawned {
            Ok(handle) => self.task = Some(handle),
            // the sender was dropped with the closure and sealed the stream
            Err(err) => error!("failed to spawn jpeg encoder: {err}"),
        }
        rx
    }

    /// Waits for the outstanding encode, if any.
    pub fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if task.join().is_err() {
                error!("jpeg encoder panicked");
            }
        }
    }

    /// True while an encode task handle is outstanding.
    pub fn in_flight(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for JpegEncoder {
    fn drop(&mut self) {
        self.join();
    }
}
