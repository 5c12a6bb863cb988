//! Grayscale LCD compositing.
//!
//! Passive-matrix LCDs fade slowly between states. Each update moves every
//! composite pixel 1/8 of the way towards its current target, so flicker
//! driven grayscale shows up as intermediate shades.

use crate::engine::{Engine, HardwareProfile};

/// Intensity of a lit (set) pixel.
const LOW: i32 = 0x00;
/// Intensity of a clear pixel, and of the whole panel when it is off.
const HIGH: i32 = 0xFF;

const WHITE: u32 = 0xFFFF_FFFF;

fn gray(level: i32) -> u32 {
    let g = level as u32 & 0xFF;
    0xFF00_0000 | (g << 16) | (g << 8) | g
}

/// Raw and composite frame buffers for one session.
#[derive(Debug, Clone)]
pub struct DisplayCompositor {
    width: usize,
    height: usize,
    raw: Vec<u8>,
    composite: Vec<u32>,
}

impl DisplayCompositor {
    /// Allocate buffers for `profile`. The composite starts white.
    pub fn new(profile: &HardwareProfile) -> Self {
        Self {
            width: profile.lcd_width,
            height: profile.lcd_height,
            raw: vec![0; profile.frame_bytes()],
            composite: vec![WHITE; profile.pixel_count()],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Composite pixels as `0xFFRRGGBB`, row-major.
    pub fn pixels(&self) -> &[u32] {
        &self.composite
    }

    /// Last monochrome frame fetched from the engine.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Fold the engine's current frame into the composite.
    /// Returns whether any pixel changed.
    pub fn update<E: Engine + ?Sized>(&mut self, engine: &E) -> bool {
        let active = engine.display_active();
        let (low, high) = if active {
            engine.monochrome_frame(&mut self.raw);
            (LOW, HIGH)
        } else {
            (HIGH, HIGH)
        };

        let mut changed = false;
        for (i, pixel) in self.composite.iter_mut().enumerate() {
            let lit = self.raw[i / 8] & (0x80 >> (i % 8)) != 0;
            let v = if lit { low } else { high };
            let prev = ((*pixel >> 16) & 0xFF) as i32;
            let next = gray(v + (prev - v) * 7 / 8);
            if next != *pixel {
                *pixel = next;
                changed = true;
            }
        }
        changed
    }

    /// Nearest-neighbour resample of the composite.
    pub fn scaled(&self, width: usize, height: usize) -> Vec<u32> {
        if self.width == 0 || self.height == 0 {
            return vec![WHITE; width * height];
        }
        let mut out = Vec::with_capacity(width * height);
        for y in 0..height {
            let sy = y * self.height / height.max(1);
            for x in 0..width {
                let sx = x * self.width / width.max(1);
                out.push(self.composite[sy * self.width + sx]);
            }
        }
        out
    }
}
