// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Streaming multipart upload of a captured image to a vision endpoint.
//!
//! The request body is written piece by piece while the JPEG encoder is
//! still producing data: the question field, the file part header, the
//! image chunks as they arrive and finally the closing boundary. The
//! transport is a trait so the facade can be exercised without a network.

use crate::error::{Error, Result};
use std::{
    fs,
    io::{self, Read},
    path::Path,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, trace};

pub const DEFAULT_BOUNDARY: &str = "----VISION_CAMERA_BOUNDARY";

pub const NET_CLASS_ROOT: &str = "/sys/class/net";
pub const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Chunks buffered between the caller and the HTTP worker.
const BODY_QUEUE_CAPACITY: usize = 16;

#[derive(Clone, Debug)]
pub struct ExplainConfig {
    pub url: String,
    /// Sent as a bearer token when not empty.
    pub token: String,
    pub device_id: String,
    pub client_id: String,
    pub boundary: String,
    pub timeout: Duration,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        ExplainConfig {
            url: String::new(),
            token: String::new(),
            device_id: String::new(),
            client_id: String::new(),
            boundary: DEFAULT_BOUNDARY.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Method-less description of the upload: target and headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl UploadRequest {
    pub fn new(config: &ExplainConfig) -> Self {
        let mut headers = vec![
            ("Device-Id".to_string(), config.device_id.clone()),
            ("Client-Id".to_string(), config.client_id.clone()),
        ];
        if !config.token.is_empty() {
            headers.push((
                "Authorization".to_string(),
                format!("Bearer {}", config.token),
            ));
        }
        headers.push((
            "Content-Type".to_string(),
            format!("multipart/form-data; boundary={}", config.boundary),
        ));
        headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        UploadRequest {
            url: config.url.clone(),
            headers,
            timeout: config.timeout,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// MAC address of the first interface under `root`, by name, that has a
/// non-zero hardware address. Loopback is skipped.
pub fn interface_mac_in(root: impl AsRef<Path>) -> Option<String> {
    let mut interfaces: Vec<_> = fs::read_dir(root.as_ref())
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.file_name().is_some_and(|n| n != "lo"))
        .collect();
    interfaces.sort();
    interfaces.into_iter().find_map(|path| {
        let mac = fs::read_to_string(path.join("address")).ok()?;
        let mac = mac.trim().to_ascii_lowercase();
        let zero = mac.chars().all(|c| c == '0' || c == ':');
        (!mac.is_empty() && !zero).then_some(mac)
    })
}

/// Identifier of this device: the primary MAC address, falling back to the
/// systemd machine id.
pub fn host_device_id() -> Option<String> {
    interface_mac_in(NET_CLASS_ROOT).or_else(|| {
        fs::read_to_string(MACHINE_ID_PATH)
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    })
}

/// Fresh random client identifier.
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Body pieces of the `multipart/form-data` upload.
pub mod multipart {
    pub fn question_part(boundary: &str, question: &str) -> String {
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"question\"\r\n\r\n{question}\r\n"
        )
    }

    pub fn file_part_header(boundary: &str) -> String {
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"camera.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
        )
    }

    pub fn footer(boundary: &str) -> String {
        format!("\r\n--{boundary}--\r\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: String,
}

/// An open upload whose body is still being written.
pub trait UploadStream: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Ends the body and waits for the response.
    fn finish(self: Box<Self>) -> Result<UploadResponse>;
}

pub trait UploadTransport: Send + Sync {
    fn open(&self, request: &UploadRequest) -> Result<Box<dyn UploadStream>>;
}

/// Pieces of the request body handed to the upload worker.
enum BodyPart {
    Data(Vec<u8>),
    /// The body is complete. Without it a closed channel aborts the request.
    End,
}

/// Adapts a channel of body parts into a [`Read`] for the request body.
struct ChannelReader {
    rx: kanal::Receiver<BodyPart>,
    current: Vec<u8>,
    offset: usize,
    ended: bool,
}

impl ChannelReader {
    fn new(rx: kanal::Receiver<BodyPart>) -> Self {
        ChannelReader {
            rx,
            current: Vec::new(),
            offset: 0,
            ended: false,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.current.len() {
            if self.ended {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(BodyPart::Data(next)) => {
                    self.current = next;
                    self.offset = 0;
                }
                Ok(BodyPart::End) => self.ended = true,
                // sender dropped before the end marker: fail the body so the
                // client tears the connection down instead of terminating it
                Err(_) => return Err(io::Error::other("upload aborted")),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

/// HTTP transport built on the blocking reqwest client.
///
/// Each upload runs on its own worker thread which owns the client, so the
/// transport can be driven from any thread including runtime worker
/// threads inside `spawn_blocking`.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn new() -> Self {
        HttpTransport
    }
}

fn send_request(request: UploadRequest, body: ChannelReader) -> Result<UploadResponse> {
    let client = reqwest::blocking::Client::builder()
        .timeout(request.timeout)
        .build()
        .map_err(|err| Error::Network(err.to_string()))?;
    let mut builder = client.post(&request.url);
    for (name, value) in &request.headers {
        // the client frames a body of unknown length as chunked itself
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    let response = builder
        .body(reqwest::blocking::Body::new(body))
        .send()
        .map_err(|err| Error::Network(err.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .map_err(|err| Error::Network(err.to_string()))?;
    Ok(UploadResponse { status, body })
}

impl UploadTransport for HttpTransport {
    fn open(&self, request: &UploadRequest) -> Result<Box<dyn UploadStream>> {
        if request.url.is_empty() {
            return Err(Error::ExplainUnconfigured);
        }
        let (tx, rx) = kanal::bounded(BODY_QUEUE_CAPACITY);
        let reader = ChannelReader::new(rx);
        let request = request.clone();
        debug!(url = %request.url, "opening upload");
        let task = thread::Builder::new()
            .name("explain-upload".to_string())
            .spawn(move || send_request(request, reader))?;
        Ok(Box::new(HttpUpload {
            tx: Some(tx),
            task: Some(task),
            written: 0,
        }))
    }
}

struct HttpUpload {
    tx: Option<kanal::Sender<BodyPart>>,
    task: Option<JoinHandle<Result<UploadResponse>>>,
    written: usize,
}

impl HttpUpload {
    fn join(&mut self) -> Result<UploadResponse> {
        self.tx = None;
        match self.task.take() {
            Some(task) => task.join().unwrap_or_else(|_| {
                error!("upload worker panicked");
                Err(Error::Network("upload worker panicked".to_string()))
            }),
            None => Err(Error::Network("upload already finished".to_string())),
        }
    }
}

impl UploadStream for HttpUpload {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Network("upload already finished".to_string()))?;
        if tx.send(BodyPart::Data(data.to_vec())).is_err() {
            // the worker quit early, its result says why
            return match self.join() {
                Ok(response) => Err(Error::HttpStatus {
                    status: response.status,
                    body: response.body,
                }),
                Err(err) => Err(err),
            };
        }
        self.written += data.len();
        trace!(bytes = data.len(), total = self.written, "upload write");
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<UploadResponse> {
        debug!(bytes = self.written, "upload body complete");
        if let Some(tx) = &self.tx {
            // a failed send means the worker already quit, join reports why
            let _ = tx.send(BodyPart::End);
        }
        self.join()
    }
}

impl Drop for HttpUpload {
    /// Dropping an unfinished upload closes the channel without an end
    /// marker, which aborts the request on the wire.
    fn drop(&mut self) {
        if self.task.is_some() {
            debug!(bytes = self.written, "aborting unfinished upload");
            if let Err(err) = self.join() {
                debug!("abandoned upload: {err}");
            }
        }
    }
}
