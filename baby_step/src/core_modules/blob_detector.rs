// THEORY:
// The blob detector is the spatial grouping step of motion detection. It takes the
// binary difference mask produced by the background model and turns it into regions.
//
// Algorithm:
// 1.  **Dilation**: a 3x3 dilation, repeated a configurable number of times, closes
//     the small gaps that sensor noise and thin edges leave inside one moving object
//     so it is found as one region rather than many fragments.
// 2.  **Region growing**: every unvisited foreground pixel seeds an iterative flood
//     fill over its 8 neighbours. The `visited` grid guarantees each pixel is claimed
//     by exactly one region.
// 3.  **Aggregation**: each finished region reports its bounding box and pixel count
//     as a `MotionBlob`.
//
// Like the rest of the spatial layer it is stateless: one mask in, regions out.

use crate::core_modules::smart_blob::{BoundingBox, MotionBlob};

/// Binary foreground mask in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl MotionMask {
    pub fn new(width: u32, height: u32, bits: Vec<bool>) -> Self {
        debug_assert_eq!(bits.len(), (width * height) as usize);
        Self { width, height, bits }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.bits[(y * self.width + x) as usize]
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Grows every foreground pixel into its 3x3 neighbourhood, `iterations` times.
    pub fn dilate(&self, iterations: u32) -> MotionMask {
        let mut current = self.clone();
        for _ in 0..iterations {
            current = current.dilate_once();
        }
        current
    }

    fn dilate_once(&self) -> MotionMask {
        let (w, h) = (self.width as i64, self.height as i64);
        let mut out = vec![false; self.bits.len()];
        for y in 0..h {
            for x in 0..w {
                if !self.bits[(y * w + x) as usize] {
                    continue;
                }
                for ny in (y - 1).max(0)..=(y + 1).min(h - 1) {
                    for nx in (x - 1).max(0)..=(x + 1).min(w - 1) {
                        out[(ny * w + nx) as usize] = true;
                    }
                }
            }
        }
        MotionMask::new(self.width, self.height, out)
    }
}

/// Finds every 8-connected foreground region in the mask.
pub fn find_blobs(mask: &MotionMask) -> Vec<MotionBlob> {
    let (w, h) = (mask.width as i64, mask.height as i64);
    let mut visited = vec![false; mask.bits.len()];
    let mut blobs = Vec::new();

    for start in 0..mask.bits.len() {
        if !mask.bits[start] || visited[start] {
            continue;
        }

        visited[start] = true;
        let mut stack = vec![start];
        let (mut min_x, mut min_y) = (i64::MAX, i64::MAX);
        let (mut max_x, mut max_y) = (0i64, 0i64);
        let mut area = 0usize;

        while let Some(index) = stack.pop() {
            let x = index as i64 % w;
            let y = index as i64 / w;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    let neighbour = (ny * w + nx) as usize;
                    if mask.bits[neighbour] && !visited[neighbour] {
                        visited[neighbour] = true;
                        stack.push(neighbour);
                    }
                }
            }
        }

        blobs.push(MotionBlob {
            bounding_box: BoundingBox {
                x: min_x as u32,
                y: min_y as u32,
                w: (max_x - min_x + 1) as u32,
                h: (max_y - min_y + 1) as u32,
            },
            area,
        });
    }

    blobs
}

/// The region with the largest pixel count, if any.
pub fn largest_blob(mask: &MotionMask) -> Option<MotionBlob> {
    find_blobs(mask).into_iter().max_by_key(|blob| blob.area)
}
