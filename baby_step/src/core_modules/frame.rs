// THEORY:
// A `FramePacket` is one encoded camera image, exactly as the capture side produced
// it. The detector decodes it transiently and never keeps it. The `LatestFrame` slot
// is the single-frame buffer shared between the capture pump, the control loop and
// the video feed. It owns its own lock, separate from the actuation gate, so video
// never waits on servo motion.

use std::sync::Arc;
use std::time::SystemTime;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, RgbImage};
use tokio::sync::watch;

use crate::error::RobotResult;

const JPEG_QUALITY: u8 = 80;

/// Encoding of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
    Png,
}

impl FrameFormat {
    fn image_format(self) -> ImageFormat {
        match self {
            FrameFormat::Jpeg => ImageFormat::Jpeg,
            FrameFormat::Png => ImageFormat::Png,
        }
    }

    /// MIME type used when serving the frame.
    pub fn mime(self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
            FrameFormat::Png => "image/png",
        }
    }
}

/// One encoded camera frame.
#[derive(Debug, Clone)]
pub struct FramePacket {
    /// Monotonic frame counter assigned by the capture side.
    pub frame_id: u64,
    pub captured_at: SystemTime,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub data: Arc<[u8]>,
}

impl FramePacket {
    pub fn new(frame_id: u64, width: u32, height: u32, format: FrameFormat, data: Vec<u8>) -> Self {
        Self {
            frame_id,
            captured_at: SystemTime::now(),
            width,
            height,
            format,
            data: data.into(),
        }
    }

    /// Decodes the buffer into an image.
    pub fn decode(&self) -> RobotResult<DynamicImage> {
        Ok(image::load_from_memory_with_format(&self.data, self.format.image_format())?)
    }
}

/// Encodes an RGB image into the requested format.
pub fn encode_rgb(image: &RgbImage, format: FrameFormat) -> RobotResult<Vec<u8>> {
    let mut buffer = Vec::new();
    let (width, height) = image.dimensions();
    match format {
        FrameFormat::Jpeg => JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).write_image(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?,
        FrameFormat::Png => {
            PngEncoder::new(&mut buffer).write_image(image.as_raw(), width, height, ExtendedColorType::Rgb8)?
        }
    }
    Ok(buffer)
}

/// Anything that can hand out the most recent camera frame.
///
/// `None` means "nothing new right now" and is never fatal.
pub trait FrameSource: Send + Sync {
    fn get_frame(&self) -> Option<FramePacket>;
}

/// Thread-safe single-frame buffer. Writers replace, readers clone.
#[derive(Clone)]
pub struct LatestFrame {
    slot: Arc<watch::Sender<Option<FramePacket>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot: Arc::new(slot) }
    }

    /// Replaces the buffered frame.
    pub fn publish(&self, frame: FramePacket) {
        self.slot.send_replace(Some(frame));
    }

    /// Receiver for consumers that want to await each new frame.
    pub fn subscribe(&self) -> watch::Receiver<Option<FramePacket>> {
        self.slot.subscribe()
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for LatestFrame {
    fn get_frame(&self) -> Option<FramePacket> {
        self.slot.borrow().clone()
    }
}
