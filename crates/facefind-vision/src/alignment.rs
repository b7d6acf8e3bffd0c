//! Five-landmark face alignment onto the ArcFace crop.
//!
//! The detector's landmarks (left eye, right eye, nose, left and right mouth
//! corner) are fitted to a fixed template with a least-squares similarity
//! transform, and the photo is resampled through its inverse.

use image::{Rgb, RgbImage};

/// Side of the aligned square crop, in pixels.
pub const ALIGNED_SIZE: u32 = 112;

/// Landmark positions inside the aligned crop, as used to train ArcFace.
const TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Rotation, uniform scale and translation:
/// `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares similarity taking `src` onto `dst`.
    ///
    /// Degenerate input (all source points coincide) yields the identity.
    pub fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let (sx, sy) = centroid(src);
        let (dx, dy) = centroid(dst);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (&(px, py), &(qx, qy)) in src.iter().zip(dst) {
            let (px, py) = (px - sx, py - sy);
            let (qx, qy) = (qx - dx, qy - dy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            energy += px * px + py * py;
        }
        if energy < f32::EPSILON {
            return Self::IDENTITY;
        }

        let a = dot / energy;
        let b = cross / energy;
        Self {
            a,
            b,
            tx: dx - (a * sx - b * sy),
            ty: dy - (b * sx + a * sy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// The inverse transform, or `None` when the scale is zero.
    pub fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < f32::EPSILON {
            return None;
        }
        let (ia, ib) = (self.a / det, self.b / det);
        Some(Self {
            a: ia,
            b: -ib,
            tx: -(ia * self.tx + ib * self.ty),
            ty: ib * self.tx - ia * self.ty,
        })
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / points.len() as f32, sy / points.len() as f32)
}

/// Warp the face described by `landmarks` into an `ALIGNED_SIZE` square crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let to_source = Similarity::fit(landmarks, &TEMPLATE)
        .invert()
        .unwrap_or(Similarity::IDENTITY);

    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        let (sx, sy) = to_source.apply((x as f32, y as f32));
        sample_bilinear(image, sx, sy)
    })
}

/// Bilinear sample at a sub-pixel position; black outside the image.
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let tl = image.get_pixel(x0, y0).0;
    let tr = image.get_pixel(x1, y0).0;
    let bl = image.get_pixel(x0, y1).0;
    let br = image.get_pixel(x1, y1).0;

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] as f32 * (1.0 - fx) + tr[c] as f32 * fx;
        let bottom = bl[c] as f32 * (1.0 - fx) + br[c] as f32 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&TEMPLATE, &TEMPLATE);
        assert!((t.a - 1.0).abs() < 1e-5);
        assert!(t.b.abs() < 1e-5);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_scale_and_shift() {
        // Source is the template at twice the size, shifted by (10, 20).
        let src = TEMPLATE.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 + 20.0));
        let t = Similarity::fit(&src, &TEMPLATE);
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4);
        for (s, d) in src.iter().zip(TEMPLATE.iter()) {
            assert!(close(t.apply(*s), *d));
        }
    }

    #[test]
    fn test_fit_recovers_rotation() {
        // 90° rotation about the origin: (x, y) -> (-y, x)
        let src = TEMPLATE.map(|(x, y)| (y, -x));
        let t = Similarity::fit(&src, &TEMPLATE);
        assert!(t.a.abs() < 1e-4);
        assert!((t.b - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_invert_roundtrip() {
        let t = Similarity {
            a: 0.8,
            b: 0.3,
            tx: 12.0,
            ty: -4.0,
        };
        let inv = t.invert().unwrap();
        let p = (33.0, 71.5);
        assert!(close(inv.apply(t.apply(p)), p));
    }

    #[test]
    fn test_invert_zero_scale() {
        let t = Similarity {
            a: 0.0,
            b: 0.0,
            tx: 1.0,
            ty: 1.0,
        };
        assert!(t.invert().is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(320, 240, Rgb([128, 128, 128]));
        let landmarks = TEMPLATE.map(|(x, y)| (x + 100.0, y + 60.0));
        let aligned = align_face(&image, &landmarks);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_align_face_keeps_colour() {
        // Face region is red, landmarks sit inside it at template scale.
        let mut image = RgbImage::from_pixel(300, 300, Rgb([0, 0, 255]));
        for y in 50..200 {
            for x in 50..200 {
                image.put_pixel(x, y, Rgb([200, 10, 10]));
            }
        }
        let landmarks = TEMPLATE.map(|(x, y)| (x + 70.0, y + 70.0));
        let aligned = align_face(&image, &landmarks);
        assert_eq!(aligned.get_pixel(56, 72), &Rgb([200, 10, 10]));
    }

    #[test]
    fn test_sample_outside_is_black() {
        let image = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
        assert_eq!(sample_bilinear(&image, -1.0, 5.0), Rgb([0, 0, 0]));
        assert_eq!(sample_bilinear(&image, 5.0, 10.5), Rgb([0, 0, 0]));
        assert_eq!(sample_bilinear(&image, 4.5, 4.5), Rgb([255, 255, 255]));
    }
}
