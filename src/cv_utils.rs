use opencv::{
    core::{Mat, Size, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use thiserror::Error;

/// Linear downscale factor applied to every frame served to the viewer.
pub const PREVIEW_SCALE: i32 = 4;

#[derive(Error, Debug)]
pub enum CvUtilsError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("Encoder rejected frame as {0}")]
    EncoderRejected(&'static str),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
    #[error("OpenCV decode error: {0}")]
    OpenCvDecodeError(opencv::Error),
    #[error("Cannot process an empty frame")]
    EmptyFrame,
}

impl From<opencv::Error> for CvUtilsError {
    fn from(err: opencv::Error) -> Self {
        CvUtilsError::OpenCvError(err)
    }
}

pub struct CvImage {
    pub mat: Mat,
}

impl CvImage {
    pub fn new(mat: Mat) -> Self {
        Self { mat }
    }

    /// Decodes a compressed still image as 8-bit BGR.
    ///
    /// Returns `Ok(None)` when OpenCV cannot make sense of the bytes, which it
    /// reports as an empty matrix rather than an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>, CvUtilsError> {
        let mat = imgcodecs::imdecode(&Vector::<u8>::from_slice(bytes), imgcodecs::IMREAD_COLOR)
            .map_err(CvUtilsError::OpenCvDecodeError)?;
        if mat.empty() {
            return Ok(None);
        }
        Ok(Some(Self { mat }))
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn resize(&self, width: i32, height: i32) -> Result<Self, CvUtilsError> {
        if self.mat.empty() {
            return Err(CvUtilsError::EmptyFrame);
        }
        let mut resized = Mat::default();
        imgproc::resize(
            &self.mat,
            &mut resized,
            Size::new(width.max(1), height.max(1)),
            0.0,
            0.0,
            imgproc::INTER_AREA,
        )?;
        Ok(Self { mat: resized })
    }

    /// Shrinks each linear dimension by `factor`.
    pub fn downscale(&self, factor: i32) -> Result<Self, CvUtilsError> {
        self.resize(self.width() / factor, self.height() / factor)
    }

    pub fn to_webp(&self, quality: i32) -> Result<Vec<u8>, CvUtilsError> {
        let params = Vector::from_iter([imgcodecs::IMWRITE_WEBP_QUALITY, quality]);
        self.encode(".webp", &params)
    }

    pub fn to_png(&self) -> Result<Vec<u8>, CvUtilsError> {
        self.encode(".png", &Vector::new())
    }

    fn encode(&self, ext: &'static str, params: &Vector<i32>) -> Result<Vec<u8>, CvUtilsError> {
        if self.mat.empty() {
            return Err(CvUtilsError::EmptyFrame);
        }
        let mut buf = Vector::<u8>::new();
        let ok = imgcodecs::imencode(ext, &self.mat, &mut buf, params)
            .map_err(CvUtilsError::EncodeFrameFailed)?;
        if !ok {
            return Err(CvUtilsError::EncoderRejected(ext));
        }
        Ok(buf.into())
    }
}

/// Downscales a decoded frame for the viewer and re-encodes it as WebP.
pub fn preview_webp(mat: Mat, quality: i32) -> Result<Vec<u8>, CvUtilsError> {
    CvImage::new(mat).downscale(PREVIEW_SCALE)?.to_webp(quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    fn solid(rows: i32, cols: i32, bgr: (f64, f64, f64)) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::new(bgr.0, bgr.1, bgr.2, 0.0))
            .unwrap()
    }

    #[test]
    fn test_png_bytes_decode_back_to_same_size() {
        let encoded = CvImage::new(solid(12, 20, (0.0, 0.0, 255.0))).to_png().unwrap();
        let decoded = CvImage::from_bytes(&encoded).unwrap().unwrap();

        assert_eq!(decoded.width(), 20);
        assert_eq!(decoded.height(), 12);
    }

    #[test]
    fn test_garbage_bytes_decode_to_none() {
        let decoded = CvImage::from_bytes(b"not an image at all").unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_preview_is_quarter_resolution() {
        let webp = preview_webp(solid(480, 640, (10.0, 20.0, 30.0)), 70).unwrap();
        let decoded = CvImage::from_bytes(&webp).unwrap().unwrap();

        assert_eq!(decoded.width(), 160);
        assert_eq!(decoded.height(), 120);
    }

    #[test]
    fn test_encoding_empty_frame_fails() {
        let result = CvImage::new(Mat::default()).to_webp(70);
        assert!(matches!(result, Err(CvUtilsError::EmptyFrame)));
    }
}
