//! Camera Model Selector.
//!
//! Pose recovery only needs four numbers from the calibration: the focal
//! lengths and the principal point.  They can be taken either from the
//! intrinsic matrix `K` (the historical behaviour) or from the projection
//! matrix `P` of the rectified image, which is the correct choice for
//! rectified input.

use tagframe_types::CameraInfo;

/// Which calibration matrix supplies the pinhole parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraModel {
    /// `fx = K[0]`, `fy = K[4]`, `px = K[2]`, `py = K[5]`.
    #[default]
    Raw,
    /// `fx = P[0]`, `fy = P[5]`, `px = P[2]`, `py = P[6]`.
    Projected,
}

/// Pinhole parameters in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraParameters {
    pub fx: f64,
    pub fy: f64,
    pub px: f64,
    pub py: f64,
}

impl CameraParameters {
    pub fn new(fx: f64, fy: f64, px: f64, py: f64) -> Self {
        Self { fx, fy, px, py }
    }
}

impl CameraModel {
    /// Map the `projected_optics` configuration flag.
    pub fn from_projected_optics(projected_optics: bool) -> Self {
        if projected_optics {
            CameraModel::Projected
        } else {
            CameraModel::Raw
        }
    }

    /// Extract the pinhole parameters from `info`.  No sanity checks are made.
    pub fn select(self, info: &CameraInfo) -> CameraParameters {
        match self {
            CameraModel::Projected => {
                CameraParameters::new(info.p[0], info.p[5], info.p[2], info.p[6])
            }
            CameraModel::Raw => CameraParameters::new(info.k[0], info.k[4], info.k[2], info.k[5]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tagframe_types::Header;

    fn info() -> CameraInfo {
        CameraInfo {
            header: Header::new(Utc::now(), "camera"),
            width: 640,
            height: 480,
            k: [600.0, 0.0, 320.0, 0.0, 610.0, 240.0, 0.0, 0.0, 1.0],
            p: [
                580.0, 0.0, 318.0, 0.0, //
                0.0, 590.0, 236.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        }
    }

    #[test]
    fn raw_model_reads_intrinsic_matrix() {
        let params = CameraModel::Raw.select(&info());
        assert_eq!(params, CameraParameters::new(600.0, 610.0, 320.0, 240.0));
    }

    #[test]
    fn projected_model_reads_projection_matrix() {
        let params = CameraModel::Projected.select(&info());
        assert_eq!(params, CameraParameters::new(580.0, 590.0, 318.0, 236.0));
    }

    #[test]
    fn default_is_raw() {
        assert_eq!(CameraModel::default(), CameraModel::Raw);
        assert_eq!(CameraModel::from_projected_optics(false), CameraModel::Raw);
        assert_eq!(
            CameraModel::from_projected_optics(true),
            CameraModel::Projected
        );
    }
}
