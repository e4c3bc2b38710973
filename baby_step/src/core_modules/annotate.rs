// THEORY:
// The annotation overlay is purely diagnostic. It draws the detection's bounding
// box, a marker on its center and a line back to the frame center on a copy of the
// frame, then JPEG-encodes the result for the dashboard. Nothing here feeds back
// into the detection math.

use std::sync::Arc;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::core_modules::frame::{FrameFormat, encode_rgb};
use crate::core_modules::motion_detector::Detection;
use crate::core_modules::smart_blob::Point;
use crate::error::RobotResult;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const CENTER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_COLOR: Rgb<u8> = Rgb([0, 128, 255]);
const MARKER_RADIUS: i32 = 5;

/// An encoded still image ready to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub format: FrameFormat,
    pub data: Arc<[u8]>,
}

/// Renders the overlay for `detection` on top of `frame` and encodes it as JPEG.
pub fn annotate(frame: &RgbImage, detection: &Detection) -> RobotResult<EncodedImage> {
    let mut canvas = frame.clone();
    draw_box(&mut canvas, detection);
    draw_line_segment_mut(&mut canvas, pixel(detection.center), pixel(detection.frame_center), LINE_COLOR);
    let (cx, cy) = pixel(detection.center);
    draw_filled_circle_mut(&mut canvas, (cx.round() as i32, cy.round() as i32), MARKER_RADIUS, CENTER_COLOR);
    let data = encode_rgb(&canvas, FrameFormat::Jpeg)?;
    Ok(EncodedImage {
        format: FrameFormat::Jpeg,
        data: data.into(),
    })
}

fn pixel(point: Point) -> (f32, f32) {
    (point.x as f32, point.y as f32)
}

fn draw_box(canvas: &mut RgbImage, detection: &Detection) {
    let b = detection.bbox;
    draw_hollow_rect_mut(canvas, Rect::at(b.x as i32, b.y as i32).of_size(b.w, b.h), BOX_COLOR);
    // second ring inside the first
    if b.w > 2 && b.h > 2 {
        let inner = Rect::at(b.x as i32 + 1, b.y as i32 + 1).of_size(b.w - 2, b.h - 2);
        draw_hollow_rect_mut(canvas, inner, BOX_COLOR);
    }
}
