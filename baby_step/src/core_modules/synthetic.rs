// THEORY:
// Synthetic scenes stand in for the camera on a desk and in tests. A scene is a flat
// gray background with any number of bright squares; rendering is deterministic and
// lossless (PNG), so the detector sees exactly the pixels the test placed.

use image::{Rgb, RgbImage};

use crate::core_modules::frame::{FrameFormat, FramePacket, encode_rgb};
use crate::error::RobotResult;
use crate::runtime::CameraDevice;

/// An axis-aligned filled square, top-left anchored, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Square {
    pub x: u32,
    pub y: u32,
    pub size: u32,
    pub intensity: u8,
}

impl Square {
    /// A white square centered on `(cx, cy)`.
    pub fn centered(cx: u32, cy: u32, size: u32) -> Self {
        Self {
            x: cx.saturating_sub(size / 2),
            y: cy.saturating_sub(size / 2),
            size,
            intensity: 255,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub width: u32,
    pub height: u32,
    pub background: u8,
    pub squares: Vec<Square>,
}

impl SyntheticScene {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: 0,
            squares: Vec::new(),
        }
    }

    pub fn with_square(mut self, square: Square) -> Self {
        self.squares.push(square);
        self
    }

    pub fn render(&self) -> RgbImage {
        let mut image = RgbImage::from_pixel(self.width, self.height, Rgb([self.background; 3]));
        for square in &self.squares {
            let x_end = (square.x + square.size).min(self.width);
            let y_end = (square.y + square.size).min(self.height);
            for y in square.y.min(self.height)..y_end {
                for x in square.x.min(self.width)..x_end {
                    image.put_pixel(x, y, Rgb([square.intensity; 3]));
                }
            }
        }
        image
    }

    pub fn render_packet(&self, frame_id: u64) -> RobotResult<FramePacket> {
        let data = encode_rgb(&self.render(), FrameFormat::Png)?;
        Ok(FramePacket::new(frame_id, self.width, self.height, FrameFormat::Png, data))
    }
}

/// A capture device that slides a square back and forth across an empty room.
///
/// The square parks for `dwell_frames` frames between hops so the detector sees
/// discrete motion events rather than continuous drift.
pub struct SyntheticCamera {
    scene: SyntheticScene,
    frame_id: u64,
    square_size: u32,
    hop: i64,
    dwell_frames: u64,
    position: i64,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            scene: SyntheticScene::new(width, height),
            frame_id: 0,
            square_size: (width.min(height) / 4).max(4),
            hop: i64::from(width / 5),
            dwell_frames: 40,
            position: i64::from(width / 2),
        }
    }

    fn advance(&mut self) {
        if self.frame_id == 0 || self.frame_id % self.dwell_frames != 0 {
            return;
        }
        let max = i64::from(self.scene.width.saturating_sub(self.square_size));
        let next = self.position + self.hop;
        if next < 0 || next > max {
            self.hop = -self.hop;
        }
        self.position = (self.position + self.hop).clamp(0, max);
    }
}

impl CameraDevice for SyntheticCamera {
    fn open(&mut self) -> RobotResult<()> {
        Ok(())
    }

    fn capture(&mut self) -> RobotResult<FramePacket> {
        self.advance();
        // position tracks the square's left edge
        let square = Square {
            x: self.position as u32,
            y: (self.scene.height.saturating_sub(self.square_size)) / 2,
            size: self.square_size,
            intensity: 255,
        };
        self.scene.squares = vec![square];
        let packet = self.scene.render_packet(self.frame_id)?;
        self.frame_id += 1;
        Ok(packet)
    }
}
