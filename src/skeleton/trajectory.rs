use super::SkeletonError;
use ndarray::{Array3, ArrayD, Ix3};
use ndarray_npy::{read_npy, ReadNpyError};
use std::path::Path;

fn read_failed(path: &Path, err: impl std::fmt::Display) -> SkeletonError {
    SkeletonError::ReadFailed {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Reads a `frames x joints x 3` `.npy` array, accepting float64 or float32 data.
pub fn load_trajectory(path: &Path) -> Result<Array3<f64>, SkeletonError> {
    let data: ArrayD<f64> = match read_npy::<_, ArrayD<f64>>(path) {
        Ok(data) => data,
        Err(ReadNpyError::WrongDescriptor(_)) => read_npy::<_, ArrayD<f32>>(path)
            .map_err(|e| read_failed(path, e))?
            .mapv(f64::from),
        Err(e) => return Err(read_failed(path, e)),
    };

    let shape = data.shape().to_vec();
    if shape.len() != 3 || shape[2] != 3 {
        return Err(SkeletonError::BadShape(shape));
    }
    data.into_dimensionality::<Ix3>()
        .map_err(|_| SkeletonError::BadShape(shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};
    use ndarray_npy::write_npy;

    #[test]
    fn test_loads_f64_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.npy");
        let original = Array3::from_shape_fn((3, 33, 3), |(f, j, c)| (f + j + c) as f64 * 0.5);
        write_npy(&path, &original).unwrap();

        let loaded = load_trajectory(&path).unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn test_loads_f32_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.npy");
        write_npy(&path, &Array3::<f32>::from_elem((2, 33, 3), 1.5)).unwrap();

        let loaded = load_trajectory(&path).unwrap();

        assert_eq!(loaded.dim(), (2, 33, 3));
        assert_eq!(loaded[[1, 32, 2]], 1.5);
    }

    #[test]
    fn test_rejects_wrong_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.npy");
        write_npy(&path, &Array2::<f64>::zeros((10, 3))).unwrap();

        assert!(matches!(
            load_trajectory(&path),
            Err(SkeletonError::BadShape(shape)) if shape == vec![10, 3]
        ));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = load_trajectory(Path::new("/no/such/file.npy"));
        assert!(matches!(result, Err(SkeletonError::ReadFailed { .. })));
    }
}
