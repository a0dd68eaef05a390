//! Pose Reconstructor.
//!
//! Recovers the rigid transform of a square marker relative to the camera
//! from its four detected corners.
//!
//! The marker model is a `size × size` square centred on the origin of the
//! marker's own z = 0 plane.  Pixel corners are first mapped to normalised
//! image coordinates with the pinhole parameters, so the plane-to-image
//! homography is directly proportional to `[r1 r2 t]`:
//!
//! ```text
//! λ · (x, y, 1)ᵀ = [r1 r2 t] · (X, Y, 1)ᵀ
//! ```
//!
//! The scale λ follows from requiring unit rotation columns, its sign from
//! requiring the marker to lie in front of the camera (+Z), `r3 = r1 × r2`,
//! and a final polar decomposition snaps the result onto SO(3).
//!
//! Degenerate corner sets (collinear or coincident points) are not rejected;
//! the solve then produces non-finite entries.

use nalgebra::{Matrix3, Matrix4, Point2, Rotation3, SMatrix, SVector, UnitQuaternion, Vector3};
use tagframe_types::{Quaternion, RawDetection, Transform3D, Vec3};

use crate::camera_model::CameraParameters;

/// Compute the camera-relative 4×4 transform of the marker seen in
/// `detection`.
///
/// `size` is the marker edge length in metres; the translation of the
/// result is expressed in the same unit.
pub fn reconstruct(detection: &RawDetection, size: f64, camera: &CameraParameters) -> Matrix4<f64> {
    let model = model_corners(size).map(|p| Point2::new(p.x, p.y));
    let observed = detection
        .corners
        .map(|[u, v]| Point2::new((u - camera.px) / camera.fx, (v - camera.py) / camera.fy));

    match homography_from_4pt(&model, &observed) {
        Some(h) => homography_to_pose(&h),
        None => Matrix4::from_element(f64::NAN),
    }
}

/// Re-project the four model corners through `transform` into pixels.
///
/// Inverse of [`reconstruct`] for noise-free input.
pub fn project(transform: &Matrix4<f64>, size: f64, camera: &CameraParameters) -> [[f64; 2]; 4] {
    let rotation: Matrix3<f64> = transform.fixed_view::<3, 3>(0, 0).into_owned();
    let translation: Vector3<f64> = transform.fixed_view::<3, 1>(0, 3).into_owned();
    model_corners(size).map(|corner| {
        let p = rotation * corner + translation;
        [
            camera.fx * p.x / p.z + camera.px,
            camera.fy * p.y / p.z + camera.py,
        ]
    })
}

/// Convert a homogeneous rigid transform into translation + unit quaternion.
pub fn transform_from_matrix(m: &Matrix4<f64>) -> Transform3D {
    let rotation = Rotation3::from_matrix_unchecked(m.fixed_view::<3, 3>(0, 0).into_owned());
    let q = UnitQuaternion::from_rotation_matrix(&rotation);
    Transform3D::new(
        Vec3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]),
        Quaternion::new(q.w, q.i, q.j, q.k),
    )
}

/// Model corners in the marker frame, in detector corner order.
fn model_corners(size: f64) -> [Vector3<f64>; 4] {
    let s = size / 2.0;
    [
        Vector3::new(-s, -s, 0.0),
        Vector3::new(s, -s, 0.0),
        Vector3::new(s, s, 0.0),
        Vector3::new(-s, s, 0.0),
    ]
}

fn hartley_normalization(pts: &[Point2<f64>; 4]) -> Matrix3<f64> {
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / 4.0;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / 4.0;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / 4.0;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn apply(t: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = t * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// H such that `dst ~ H * src`, from exactly four correspondences.
fn homography_from_4pt(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Option<Matrix3<f64>> {
    let t_src = hartley_normalization(src);
    let t_dst = hartley_normalization(dst);

    // Unknowns: [h11 h12 h13 h21 h22 h23 h31 h32], with h33 = 1.
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for k in 0..4 {
        let s = apply(&t_src, &src[k]);
        let d = apply(&t_dst, &dst[k]);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;
    let hn = Matrix3::new(
        x[0], x[1], x[2], //
        x[3], x[4], x[5], //
        x[6], x[7], 1.0,
    );
    Some(t_dst.try_inverse()? * hn * t_src)
}

/// Decompose a plane-to-normalised-image homography into `[R | t]`.
fn homography_to_pose(h: &Matrix3<f64>) -> Matrix4<f64> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    // Geometric mean of the two column lengths; both should be 1 / λ.
    let mut s = 1.0 / (h1.norm() * h2.norm()).sqrt();
    if h3.z < 0.0 {
        s = -s;
    }

    let r1 = h1 * s;
    let r2 = h2 * s;
    let t = h3 * s;
    let r3 = r1.cross(&r2);
    let approx = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = approx.svd(true, true);
    let rotation = match (svd.u, svd.v_t) {
        (Some(mut u), Some(v_t)) => {
            if (u * v_t).determinant() < 0.0 {
                let flipped = -u.column(2).into_owned();
                u.set_column(2, &flipped);
            }
            u * v_t
        }
        _ => return Matrix4::from_element(f64::NAN),
    };

    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(&t);
    m
}
