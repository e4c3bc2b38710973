// THEORY:
// OpenCV capture device for the real robot. Frames are JPEG-encoded right after
// capture so the rest of the system only ever handles encoded buffers, the same
// shape the synthetic camera produces.

use baby_step::frame::{FrameFormat, FramePacket};
use baby_step::runtime::CameraDevice;
use baby_step::{RobotError, RobotResult};
use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::info;

const JPEG_QUALITY: i32 = 80;

fn camera_error(e: opencv::Error) -> RobotError {
    RobotError::camera(e.to_string())
}

pub struct OpenCvCamera {
    index: i32,
    capture: Option<VideoCapture>,
    frame: Mat,
    frame_id: u64,
}

impl OpenCvCamera {
    pub fn new(index: i32) -> Self {
        Self {
            index,
            capture: None,
            frame: Mat::default(),
            frame_id: 0,
        }
    }
}

impl CameraDevice for OpenCvCamera {
    fn open(&mut self) -> RobotResult<()> {
        let capture = VideoCapture::new(self.index, videoio::CAP_ANY).map_err(camera_error)?;
        if !capture.is_opened().map_err(camera_error)? {
            return Err(RobotError::camera(format!("camera {} could not be opened", self.index)));
        }
        info!(index = self.index, "camera opened");
        self.capture = Some(capture);
        Ok(())
    }

    fn capture(&mut self) -> RobotResult<FramePacket> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| RobotError::camera("camera is not open"))?;
        if !capture.read(&mut self.frame).map_err(camera_error)? || self.frame.empty() {
            return Err(RobotError::camera("no frame returned"));
        }

        let mut buffer = Vector::<u8>::new();
        let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, JPEG_QUALITY]);
        imgcodecs::imencode(".jpg", &self.frame, &mut buffer, &params).map_err(camera_error)?;

        let packet = FramePacket::new(
            self.frame_id,
            self.frame.cols() as u32,
            self.frame.rows() as u32,
            FrameFormat::Jpeg,
            buffer.to_vec(),
        );
        self.frame_id += 1;
        Ok(packet)
    }
}
