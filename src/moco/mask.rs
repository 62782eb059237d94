use crate::volume::Volume3D;

/// How a user-supplied mask is fed into registration.
///
/// The distinction is a single global decision made before the job loop,
/// because the external optimizer can only honour hard regions of interest:
/// a binary mask is passed through as-is, a soft (continuous) mask is baked
/// into the voxel data by multiplication instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Binary,
    Soft,
}

/// A mask is binary iff every voxel equals its own boolean cast, values
/// being exactly 0 or 1. Anything else makes it soft.
pub fn classify_mask(mask: &Volume3D) -> MaskKind {
    let binary = mask
        .data
        .iter()
        .all(|&v| v == if v != 0.0 { 1.0 } else { 0.0 });
    if binary {
        MaskKind::Binary
    } else {
        MaskKind::Soft
    }
}

#[cfg(test)]
mod mask_tests {
    use super::*;
    use crate::volume::Orientation;
    use ndarray::Array3;

    fn mock_mask(values: &[f64]) -> Volume3D {
        Volume3D {
            data: Array3::from_shape_vec((values.len(), 1, 1), values.to_vec()).unwrap(),
            spacing: [1.0, 1.0, 1.0],
            orientation: Orientation::RPI,
        }
    }

    #[test]
    fn test_binary_mask_detected() {
        assert_eq!(classify_mask(&mock_mask(&[0.0, 1.0, 1.0, 0.0])), MaskKind::Binary);
        assert_eq!(classify_mask(&mock_mask(&[0.0, 0.0])), MaskKind::Binary);
    }

    #[test]
    fn test_soft_mask_detected() {
        assert_eq!(classify_mask(&mock_mask(&[0.0, 0.5, 1.0])), MaskKind::Soft);
        assert_eq!(classify_mask(&mock_mask(&[0.0, 2.0])), MaskKind::Soft);
        assert_eq!(classify_mask(&mock_mask(&[-1.0, 0.0])), MaskKind::Soft);
    }

    #[test]
    fn test_soft_mask_multiplies_into_data() {
        let mask = mock_mask(&[0.0, 0.5, 1.0]);
        let mut vol = mock_mask(&[4.0, 4.0, 4.0]);
        vol.multiply(&mask).unwrap();
        assert_eq!(vol.data.as_slice().unwrap(), &[0.0, 2.0, 4.0]);
    }
}
