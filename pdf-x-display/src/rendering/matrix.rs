//! Affine transforms in the `[a b c d e f]` form used throughout PDF.
//!
//! A point maps as `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.

pub type Matrix = [f64; 6];

pub const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// `m1 * m2`: applies `m2` first, then `m1`.
///
/// This is what `concat_matrix(m2)` does to a current transform `m1`.
pub fn multiply(m1: &Matrix, m2: &Matrix) -> Matrix {
    [
        m1[0] * m2[0] + m1[2] * m2[1],
        m1[1] * m2[0] + m1[3] * m2[1],
        m1[0] * m2[2] + m1[2] * m2[3],
        m1[1] * m2[2] + m1[3] * m2[3],
        m1[0] * m2[4] + m1[2] * m2[5] + m1[4],
        m1[1] * m2[4] + m1[3] * m2[5] + m1[5],
    ]
}

pub fn apply(m: &Matrix, x: f64, y: f64) -> (f64, f64) {
    (m[0] * x + m[2] * y + m[4], m[1] * x + m[3] * y + m[5])
}

/// The inverse transform, or `None` for a singular matrix.
pub fn inverse(m: &Matrix) -> Option<Matrix> {
    let det = m[0] * m[3] - m[1] * m[2];
    if det == 0.0 || !det.is_finite() {
        return None;
    }
    Some([
        m[3] / det,
        -m[1] / det,
        -m[2] / det,
        m[0] / det,
        (m[2] * m[5] - m[4] * m[3]) / det,
        (m[4] * m[1] - m[5] * m[0]) / det,
    ])
}

pub fn translation(x: f64, y: f64) -> Matrix {
    [1.0, 0.0, 0.0, 1.0, x, y]
}

pub fn scaling(sx: f64, sy: f64) -> Matrix {
    [sx, 0.0, 0.0, sy, 0.0, 0.0]
}

/// Orders the corners of `[x0, y0, x1, y1]` so that `x0 <= x1`, `y0 <= y1`.
pub fn normalize_rect(rect: &[f64; 4]) -> [f64; 4] {
    [
        rect[0].min(rect[2]),
        rect[1].min(rect[3]),
        rect[0].max(rect[2]),
        rect[1].max(rect[3]),
    ]
}

/// Axis-aligned bounds of `rect` after transformation.
pub fn transform_bbox(rect: &[f64; 4], m: &Matrix) -> [f64; 4] {
    let corners = [
        apply(m, rect[0], rect[1]),
        apply(m, rect[0], rect[3]),
        apply(m, rect[2], rect[1]),
        apply(m, rect[2], rect[3]),
    ];
    let mut bounds = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    for (x, y) in corners {
        bounds[0] = bounds[0].min(x);
        bounds[1] = bounds[1].min(y);
        bounds[2] = bounds[2].max(x);
        bounds[3] = bounds[3].max(y);
    }
    bounds
}

/// Intersection of two rectangles, `None` if they do not overlap.
pub fn intersect(a: &[f64; 4], b: &[f64; 4]) -> Option<[f64; 4]> {
    let a = normalize_rect(a);
    let b = normalize_rect(b);
    let x0 = a[0].max(b[0]);
    let y0 = a[1].max(b[1]);
    let x1 = a[2].min(b[2]);
    let y1 = a[3].min(b[3]);
    (x0 <= x1 && y0 <= y1).then_some([x0, y0, x1, y1])
}

/// Scale factors of the transform along its principal axes (the singular
/// values of its linear part).
pub fn singular_value_scale(m: &Matrix) -> (f64, f64) {
    let [a, b, c, d, ..] = *m;
    // M^T * M
    let p = a * a + b * b;
    let q = a * c + b * d;
    let r = c * c + d * d;
    let mean = (p + r) / 2.0;
    let disc = (((p - r) / 2.0).powi(2) + q * q).sqrt();
    let sx = (mean + disc).max(0.0).sqrt();
    let sy = (mean - disc).max(0.0).sqrt();
    (sx, sy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Matrix, b: &Matrix) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_multiply_applies_right_operand_first() {
        let m = multiply(&translation(10.0, 20.0), &scaling(2.0, 2.0));
        assert_eq!(apply(&m, 1.0, 1.0), (12.0, 22.0));
        let m = multiply(&scaling(2.0, 2.0), &translation(10.0, 20.0));
        assert_eq!(apply(&m, 1.0, 1.0), (22.0, 42.0));
    }

    #[test]
    fn test_inverse() {
        let m = [2.0, 0.5, -1.0, 3.0, 7.0, -4.0];
        let inv = inverse(&m).unwrap();
        assert!(close(&multiply(&m, &inv), &IDENTITY));
        assert_eq!(inverse(&[0.0, 0.0, 0.0, 0.0, 1.0, 1.0]), None);
    }

    #[test]
    fn test_transform_bbox_with_flip() {
        let bbox = transform_bbox(&[0.0, 0.0, 100.0, 50.0], &[1.0, 0.0, 0.0, -1.0, 0.0, 792.0]);
        assert_eq!(bbox, [0.0, 742.0, 100.0, 792.0]);
    }

    #[test]
    fn test_intersect() {
        assert_eq!(
            intersect(&[0.0, 0.0, 10.0, 10.0], &[5.0, 5.0, 20.0, 20.0]),
            Some([5.0, 5.0, 10.0, 10.0])
        );
        assert_eq!(intersect(&[0.0, 0.0, 1.0, 1.0], &[2.0, 2.0, 3.0, 3.0]), None);
    }

    #[test]
    fn test_singular_value_scale_of_rotation_is_unit() {
        let angle: f64 = 0.7;
        let m = [angle.cos(), angle.sin(), -angle.sin(), angle.cos(), 0.0, 0.0];
        let (sx, sy) = singular_value_scale(&m);
        assert!((sx - 1.0).abs() < 1e-9 && (sy - 1.0).abs() < 1e-9);
        let (sx, sy) = singular_value_scale(&scaling(3.0, -2.0));
        assert!((sx - 3.0).abs() < 1e-9 && (sy - 2.0).abs() < 1e-9);
    }
}
