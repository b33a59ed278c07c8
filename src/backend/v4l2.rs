// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! V4L2 capture through memory-mapped streaming I/O.

use super::{BackendConfig, CaptureBackend, Control, DequeuedSlot, NegotiatedFormat};
use crate::{
    error::{Error, Result},
    image::{FourCC, Resolution},
};
use libc::{c_int, c_void, mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::{
    fs::{File, OpenOptions},
    io,
    mem::zeroed,
    os::fd::{AsRawFd, RawFd},
    ptr::null_mut,
    slice::from_raw_parts,
    time::Duration,
};
use tracing::{debug, info, warn};

#[allow(non_camel_case_types)]
mod sys {
    use libc::{c_int, c_ulong, c_void, timeval};

    pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
    pub const V4L2_MEMORY_MMAP: u32 = 1;
    pub const V4L2_FIELD_ANY: u32 = 0;

    pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
    pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
    pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

    pub const V4L2_CID_BRIGHTNESS: u32 = 0x0098_0900;
    pub const V4L2_CID_CONTRAST: u32 = 0x0098_0901;
    pub const V4L2_CID_SATURATION: u32 = 0x0098_0902;
    pub const V4L2_CID_HFLIP: u32 = 0x0098_0914;
    pub const V4L2_CID_VFLIP: u32 = 0x0098_0915;
    pub const V4L2_CID_SHARPNESS: u32 = 0x0098_091b;
    pub const V4L2_CID_JPEG_COMPRESSION_QUALITY: u32 = 0x009d_0903;

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_capability {
        pub driver: [u8; 16],
        pub card: [u8; 32],
        pub bus_info: [u8; 32],
        pub version: u32,
        pub capabilities: u32,
        pub device_caps: u32,
        pub reserved: [u32; 3],
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_fmtdesc {
        pub index: u32,
        pub type_: u32,
        pub flags: u32,
        pub description: [u8; 32],
        pub pixelformat: u32,
        pub mbus_code: u32,
        pub reserved: [u32; 3],
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_pix_format {
        pub width: u32,
        pub height: u32,
        pub pixelformat: u32,
        pub field: u32,
        pub bytesperline: u32,
        pub sizeimage: u32,
        pub colorspace: u32,
        pub priv_: u32,
        pub flags: u32,
        pub ycbcr_enc: u32,
        pub quantization: u32,
        pub xfer_func: u32,
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub union v4l2_format_fmt {
        pub pix: v4l2_pix_format,
        pub raw_data: [u8; 200],
        // v4l2_window carries pointers
        _align: [*mut c_void; 0],
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_format {
        pub type_: u32,
        pub fmt: v4l2_format_fmt,
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_requestbuffers {
        pub count: u32,
        pub type_: u32,
        pub memory: u32,
        pub capabilities: u32,
        pub flags: u8,
        pub reserved: [u8; 3],
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_timecode {
        pub type_: u32,
        pub flags: u32,
        pub frames: u8,
        pub seconds: u8,
        pub minutes: u8,
        pub hours: u8,
        pub userbits: [u8; 4],
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub union v4l2_buffer_m {
        pub offset: u32,
        pub userptr: c_ulong,
        pub planes: *mut c_void,
        pub fd: i32,
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_buffer {
        pub index: u32,
        pub type_: u32,
        pub bytesused: u32,
        pub flags: u32,
        pub field: u32,
        pub timestamp: timeval,
        pub timecode: v4l2_timecode,
        pub sequence: u32,
        pub memory: u32,
        pub m: v4l2_buffer_m,
        pub length: u32,
        pub reserved2: u32,
        pub request_fd: i32,
    }

    #[repr(C)]
    #[derive(Copy, Clone)]
    pub struct v4l2_control {
        pub id: u32,
        pub value: i32,
    }

    nix::ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
    nix::ioctl_readwrite!(vidioc_enum_fmt, b'V', 2, v4l2_fmtdesc);
    nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
    nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
    nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
    nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
    nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
    nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
    nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
    nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
    nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, v4l2_control);
}

use sys::*;

/// Driver slot mapped into our address space. Unmapped on drop.
struct MappedSlot {
    mmap: *mut u8,
    len: usize,
}

// The mapping is owned exclusively by the backend.
unsafe impl Send for MappedSlot {}

impl MappedSlot {
    fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.mmap, self.len) }
    }
}

impl Drop for MappedSlot {
    fn drop(&mut self) {
        if unsafe { munmap(self.mmap.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed!");
        }
    }
}

/// Maps the sensor quality scale (0..=63, lower is better) onto the V4L2
/// percentage scale.
fn jpeg_quality_percent(quality: i32) -> i32 {
    100 - quality.clamp(0, 63) * 100 / 63
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[derive(Default)]
pub struct V4l2Backend {
    file: Option<File>,
    slots: Vec<MappedSlot>,
    streaming: bool,
    timeout: Duration,
}

impl V4l2Backend {
    pub fn new() -> Self {
        V4l2Backend {
            file: None,
            slots: Vec::new(),
            streaming: false,
            timeout: Duration::from_secs(2),
        }
    }

    fn fd(&self) -> Result<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or(Error::NotReady)
    }

    fn release_slots(&mut self) {
        self.slots.clear();
        if let Ok(fd) = self.fd() {
            let mut req: v4l2_requestbuffers = unsafe { zeroed() };
            req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
            req.memory = V4L2_MEMORY_MMAP;
            if let Err(err) = unsafe { vidioc_reqbufs(fd, &mut req) } {
                debug!("VIDIOC_REQBUFS(0) failed: {err}");
            }
        }
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(&mut self, config: &BackendConfig) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|err| Error::device("open", err))?;
        let fd = file.as_raw_fd();

        let mut cap: v4l2_capability = unsafe { zeroed() };
        unsafe { vidioc_querycap(fd, &mut cap) }
            .map_err(|err| Error::device("VIDIOC_QUERYCAP", err))?;
        let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        if caps & V4L2_CAP_VIDEO_CAPTURE == 0 || caps & V4L2_CAP_STREAMING == 0 {
            return Err(Error::device(
                "VIDIOC_QUERYCAP",
                io::Error::other("not a streaming capture device"),
            ));
        }

        let mut fmt: v4l2_format = unsafe { zeroed() };
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        if unsafe { vidioc_g_fmt(fd, &mut fmt) }.is_ok() {
            let pix = unsafe { fmt.fmt.pix };
            debug!(
                "current format {}x{} {}",
                pix.width,
                pix.height,
                FourCC::from(pix.pixelformat)
            );
        }

        info!(
            device = %config.device.display(),
            driver = %c_string(&cap.driver),
            card = %c_string(&cap.card),
            pixel_clock_hz = config.pixel_clock_hz,
            "opened capture device"
        );
        self.file = Some(file);
        self.timeout = config.dequeue_timeout;

        if let Err(err) = self.set_control(Control::JpegQuality, config.jpeg_quality) {
            debug!("jpeg quality control unavailable: {err}");
        }
        Ok(())
    }

    fn enum_formats(&mut self) -> Result<Vec<FourCC>> {
        let fd = self.fd()?;
        let mut formats = Vec::new();
        for index in 0.. {
            let mut desc: v4l2_fmtdesc = unsafe { zeroed() };
            desc.index = index;
            desc.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
            match unsafe { vidioc_enum_fmt(fd, &mut desc) } {
                Ok(_) => formats.push(FourCC::from(desc.pixelformat)),
                Err(nix::errno::Errno::EINVAL) => break,
                Err(err) => return Err(Error::device("VIDIOC_ENUM_FMT", err)),
            }
        }
        Ok(formats)
    }

    fn set_format(&mut self, format: FourCC, resolution: Resolution) -> Result<NegotiatedFormat> {
        let fd = self.fd()?;
        let mut fmt: v4l2_format = unsafe { zeroed() };
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix = v4l2_pix_format {
            width: resolution.width,
            height: resolution.height,
            pixelformat: format.into(),
            field: V4L2_FIELD_ANY,
            ..unsafe { zeroed() }
        };
        unsafe { vidioc_s_fmt(fd, &mut fmt) }.map_err(|err| Error::device("VIDIOC_S_FMT", err))?;
        let pix = unsafe { fmt.fmt.pix };
        Ok(NegotiatedFormat {
            format: FourCC::from(pix.pixelformat),
            width: pix.width,
            height: pix.height,
        })
    }

    fn request_buffers(&mut self, count: usize) -> Result<usize> {
        let fd = self.fd()?;
        self.slots.clear();

        let mut req: v4l2_requestbuffers = unsafe { zeroed() };
        req.count = count as u32;
        req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = V4L2_MEMORY_MMAP;
        unsafe { vidioc_reqbufs(fd, &mut req) }
            .map_err(|err| Error::device("VIDIOC_REQBUFS", err))?;
        if req.count == 0 {
            return Err(Error::device(
                "VIDIOC_REQBUFS",
                io::Error::other("driver granted no buffers"),
            ));
        }

        for index in 0..req.count {
            let mut buf: v4l2_buffer = unsafe { zeroed() };
            buf.index = index;
            buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
            buf.memory = V4L2_MEMORY_MMAP;
            unsafe { vidioc_querybuf(fd, &mut buf) }
                .map_err(|err| Error::device("VIDIOC_QUERYBUF", err))?;

            let len = buf.length as usize;
            let ptr = unsafe {
                mmap(
                    null_mut(),
                    len,
                    PROT_READ | PROT_WRITE,
                    MAP_SHARED,
                    fd,
                    buf.m.offset as libc::off_t,
                )
            };
            if ptr == MAP_FAILED {
                return Err(Error::device("mmap", io::Error::last_os_error()));
            }
            self.slots.push(MappedSlot {
                mmap: ptr.cast::<u8>(),
                len,
            });
        }
        debug!(requested = count, granted = req.count, "buffers mapped");
        Ok(req.count as usize)
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        let fd = self.fd()?;
        let mut buf: v4l2_buffer = unsafe { zeroed() };
        buf.index = index as u32;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        unsafe { vidioc_qbuf(fd, &mut buf) }.map_err(|err| Error::device("VIDIOC_QBUF", err))?;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedSlot> {
        let fd = self.fd()?;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = self.timeout.as_millis().min(c_int::MAX as u128) as c_int;
        match unsafe { libc::poll(&mut pfd, 1, timeout_ms) } {
            0 => return Err(Error::CaptureTimeout),
            n if n < 0 => return Err(Error::device("poll", io::Error::last_os_error())),
            _ => {}
        }

        let mut buf: v4l2_buffer = unsafe { zeroed() };
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        unsafe { vidioc_dqbuf(fd, &mut buf) }
            .map_err(|err| Error::device("VIDIOC_DQBUF", err))?;
        Ok(DequeuedSlot {
            index: buf.index as usize,
            bytes_used: buf.bytesused as usize,
        })
    }

    fn slot(&self, index: usize) -> Option<&[u8]> {
        self.slots.get(index).map(MappedSlot::as_slice)
    }

    fn stream_on(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let ty = V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        unsafe { vidioc_streamon(fd, &ty) }
            .map_err(|err| Error::device("VIDIOC_STREAMON", err))?;
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let ty = V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        unsafe { vidioc_streamoff(fd, &ty) }
            .map_err(|err| Error::device("VIDIOC_STREAMOFF", err))?;
        self.streaming = false;
        Ok(())
    }

    fn set_control(&mut self, control: Control, value: i32) -> Result<()> {
        let fd = self.fd()?;
        let (id, value) = match control {
            Control::Brightness => (V4L2_CID_BRIGHTNESS, value),
            Control::Contrast => (V4L2_CID_CONTRAST, value),
            Control::Saturation => (V4L2_CID_SATURATION, value),
            Control::Sharpness => (V4L2_CID_SHARPNESS, value),
            Control::HorizontalFlip => (V4L2_CID_HFLIP, value),
            Control::VerticalFlip => (V4L2_CID_VFLIP, value),
            Control::JpegQuality => (V4L2_CID_JPEG_COMPRESSION_QUALITY, jpeg_quality_percent(value)),
        };
        let mut ctrl = v4l2_control { id, value };
        unsafe { vidioc_s_ctrl(fd, &mut ctrl) }
            .map_err(|err| Error::device("VIDIOC_S_CTRL", err))?;
        Ok(())
    }

    fn close(&mut self) {
        if self.file.is_none() {
            return;
        }
        if self.streaming {
            if let Err(err) = self.stream_off() {
                warn!("stream off during close failed: {err}");
            }
        }
        self.release_slots();
        self.file = None;
        debug!("capture device closed");
    }
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        self.close();
    }
}
