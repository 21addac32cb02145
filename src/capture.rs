use opencv::{core::Mat, prelude::*, videoio};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open video {0:?}")]
    OpenVideoFailed(PathBuf),
    #[error("Frame {index} not found, video has {total} frames")]
    FrameOutOfRange { index: i64, total: i64 },
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
    #[error("Error reading frame {0}")]
    EmptyFrame(i64),
    #[error("Capture task failed: {0}")]
    TaskFailed(String),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for CaptureError {
    fn from(err: opencv::Error) -> Self {
        CaptureError::OpenCvError(err)
    }
}

/// A decoding handle over one video file.
pub struct VideoSource {
    capture: videoio::VideoCapture,
    path: PathBuf,
}

impl VideoSource {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let capture =
            videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(CaptureError::OpenVideoFailed(path.to_path_buf()));
        }
        Ok(Self {
            capture,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> Result<i64, CaptureError> {
        Ok(self.capture.get(videoio::CAP_PROP_FRAME_COUNT)? as i64)
    }

    /// Reads the next frame, `None` at end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Mat>, CaptureError> {
        let mut frame = Mat::default();
        let ok = self
            .capture
            .read(&mut frame)
            .map_err(CaptureError::ReadFrameFailed)?;
        if !ok || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Seeks to `index` and decodes exactly that frame.
    pub fn read_frame_at(&mut self, index: i64) -> Result<Mat, CaptureError> {
        let total = self.frame_count()?;
        if index < 0 || index >= total {
            return Err(CaptureError::FrameOutOfRange { index, total });
        }
        self.capture
            .set(videoio::CAP_PROP_POS_FRAMES, index as f64)?;
        tracing::debug!("Reading frame {} of {}", index, total);
        self.read_frame()?.ok_or(CaptureError::EmptyFrame(index))
    }

    /// Decodes every remaining frame into memory.
    pub fn read_all(mut self) -> Result<Vec<Mat>, CaptureError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.read_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// One capture handle shared by every request, each seek-and-read done under the lock.
#[derive(Clone)]
pub struct SharedCapture {
    source: Arc<Mutex<VideoSource>>,
}

impl SharedCapture {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let source = VideoSource::open(path)?;
        tracing::info!(
            "Opened capture {:?} with {} frames",
            source.path(),
            source.frame_count()?
        );
        Ok(Self {
            source: Arc::new(Mutex::new(source)),
        })
    }

    pub async fn frame_at(&self, index: i64) -> Result<Mat, CaptureError> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || source.lock().read_frame_at(index))
            .await
            .map_err(|e| CaptureError::TaskFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, Size, Vec3b, CV_8UC3};

    fn write_video(path: &Path, frames: usize) {
        let fourcc = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
        let mut writer = videoio::VideoWriter::new(
            &path.to_string_lossy(),
            fourcc,
            10.0,
            Size::new(32, 24),
            true,
        )
        .unwrap();
        for i in 0..frames {
            let frame =
                Mat::new_rows_cols_with_default(24, 32, CV_8UC3, Scalar::all(i as f64 * 60.0))
                    .unwrap();
            writer.write(&frame).unwrap();
        }
        writer.release().unwrap();
    }

    fn brightness(frame: &Mat) -> u8 {
        frame.at_2d::<Vec3b>(12, 16).unwrap()[0]
    }

    #[test]
    fn test_seek_reads_requested_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        write_video(&path, 4);
        let mut source = VideoSource::open(&path).unwrap();

        assert_eq!(source.frame_count().unwrap(), 4);
        let third = source.read_frame_at(2).unwrap();
        assert!(brightness(&third).abs_diff(120) <= 8);
        let first = source.read_frame_at(0).unwrap();
        assert!(brightness(&first) <= 8);

        assert!(matches!(
            source.read_frame_at(4),
            Err(CaptureError::FrameOutOfRange { index: 4, total: 4 })
        ));
        assert!(matches!(
            source.read_frame_at(-1),
            Err(CaptureError::FrameOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_capture_reads_off_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        write_video(&path, 3);
        let capture = SharedCapture::open(&path).unwrap();

        let frame = capture.frame_at(1).await.unwrap();
        assert_eq!(frame.size().unwrap(), Size::new(32, 24));
        assert_eq!(VideoSource::open(&path).unwrap().read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_open_missing_video_fails() {
        let result = VideoSource::open(Path::new("/no/such/video.mp4"));
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = CaptureError::FrameOutOfRange {
            index: 12,
            total: 10,
        };
        assert_eq!(err.to_string(), "Frame 12 not found, video has 10 frames");
    }
}
