use crate::detect::Landmarks;
use image::{Rgb, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Degenerate landmarks, cannot estimate transform")]
    Degenerate,
}

/// Side length of the aligned face crop
pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace reference keypoints inside the 112x112 crop
pub const REFERENCE_LANDMARKS: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst`
    fn estimate(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f32;
        let (mut sx, mut sy, mut su, mut sv) = (0.0, 0.0, 0.0, 0.0);
        let (mut sq, mut dot, mut cross) = (0.0, 0.0, 0.0);

        for (&(x, y), &(u, v)) in src.iter().zip(dst.iter()) {
            sx += x;
            sy += y;
            su += u;
            sv += v;
            sq += x * x + y * y;
            dot += u * x + v * y;
            cross += v * x - u * y;
        }

        let denom = n * sq - sx * sx - sy * sy;
        if denom.abs() < 1e-6 {
            return None;
        }

        let a = (n * dot - su * sx - sv * sy) / denom;
        let b = (n * cross + su * sy - sv * sx) / denom;
        Some(Self {
            a,
            b,
            tx: (su - a * sx + b * sy) / n,
            ty: (sv - b * sx - a * sy) / n,
        })
    }

    /// Map an output pixel back into the source image
    fn invert(&self, u: f32, v: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (du, dv) = (u - self.tx, v - self.ty);
        Some((
            (self.a * du + self.b * dv) / det,
            (self.a * dv - self.b * du) / det,
        ))
    }
}

/// Warp the face described by `landmarks` into the canonical crop
pub fn align_face(image: &RgbImage, landmarks: &Landmarks) -> Result<RgbImage, AlignmentError> {
    let transform =
        Similarity::estimate(landmarks, &REFERENCE_LANDMARKS).ok_or(AlignmentError::Degenerate)?;

    let mut aligned = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    for (u, v, pixel) in aligned.enumerate_pixels_mut() {
        let (x, y) = transform
            .invert(u as f32, v as f32)
            .ok_or(AlignmentError::Degenerate)?;
        *pixel = sample_bilinear(image, x, y);
    }

    Ok(aligned)
}

/// Out-of-bounds samples are black
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    if x0 < 0 || y0 < 0 || x0 + 1 >= image.width() as i64 || y0 + 1 >= image.height() as i64 {
        return Rgb([0, 0, 0]);
    }

    let (x0, y0) = (x0 as u32, y0 as u32);
    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x0 + 1, y0);
    let p01 = image.get_pixel(x0, y0 + 1);
    let p11 = image.get_pixel(x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
