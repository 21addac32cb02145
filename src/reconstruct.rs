use crate::{
    capture::{CaptureError, VideoSource},
    config::{CompositeConfig, CompositeLayout, UploadConfig},
    cv_utils::{CvImage, CvUtilsError},
    frame_store::{FrameStore, UploadSession},
    telemetry::Metrics,
};
use opencv::{
    core::{self, Mat, Rect, Size},
    prelude::*,
    videoio,
};
use std::{
    collections::BTreeMap,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ReconstructError {
    #[error("Failed to open video writer for {0}")]
    WriterNotOpened(String),
    #[error("Invalid fourcc code {0:?}")]
    InvalidFourcc(String),
    #[error("No frames to write")]
    NoFrames,
    #[error("Cv utils error: {0}")]
    CvUtils(#[from] CvUtilsError),
    #[error("Recorded video error: {0}")]
    Capture(#[from] CaptureError),
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
    #[error("Reconstruction panicked")]
    Panicked,
}

/// Destination for reconstructed frames.
pub trait FrameSink {
    fn write(&mut self, frame: &Mat) -> Result<(), ReconstructError>;
    fn finish(&mut self) -> Result<(), ReconstructError>;
}

pub struct VideoFileSink {
    writer: videoio::VideoWriter,
}

impl VideoFileSink {
    pub fn create(path: &Path, fourcc: &str, fps: f64, size: Size) -> Result<Self, ReconstructError> {
        let code: Vec<char> = fourcc.chars().collect();
        let &[a, b, c, d] = code.as_slice() else {
            return Err(ReconstructError::InvalidFourcc(fourcc.to_string()));
        };
        let fourcc = videoio::VideoWriter::fourcc(a, b, c, d)?;
        let target = path.to_string_lossy();
        let writer = videoio::VideoWriter::new(&target, fourcc, fps, size, true)?;
        if !writer.is_opened()? {
            return Err(ReconstructError::WriterNotOpened(target.into_owned()));
        }
        Ok(Self { writer })
    }
}

impl FrameSink for VideoFileSink {
    fn write(&mut self, frame: &Mat) -> Result<(), ReconstructError> {
        self.writer.write(frame)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ReconstructError> {
        self.writer.release()?;
        Ok(())
    }
}

/// Writes frames `0..total` in index order and returns how many were written.
///
/// A missing index, or one whose upload failed to decode, is skipped with a
/// warning; the video simply ends up shorter.
pub fn write_sequence<S: FrameSink>(
    frames: &BTreeMap<usize, Option<Mat>>,
    total: usize,
    sink: &mut S,
) -> Result<usize, ReconstructError> {
    let mut written = 0;
    for index in 0..total {
        match frames.get(&index) {
            Some(Some(frame)) => {
                sink.write(frame)?;
                written += 1;
            }
            Some(None) => tracing::warn!("Undecodable frame: {}", index),
            None => tracing::warn!("Missing frame: {}", index),
        }
    }
    sink.finish()?;
    Ok(written)
}

/// Both sources resized to `target`, rendered on the left.
pub fn compose_side_by_side(
    rendered: &Mat,
    recorded: &Mat,
    target: Size,
) -> Result<Mat, ReconstructError> {
    let left = CvImage::new(rendered.clone()).resize(target.width, target.height)?;
    let right = CvImage::new(recorded.clone()).resize(target.width, target.height)?;
    let mut canvas = Mat::default();
    core::hconcat2(&left.mat, &right.mat, &mut canvas)?;
    Ok(canvas)
}

/// Size of the recorded-video inset for a rendered canvas of `canvas` size.
///
/// Height is a quarter of the canvas height, width follows the recorded
/// frame's aspect ratio, clipped to the canvas.
pub fn overlay_inset_size(canvas: Size, recorded: Size) -> Size {
    let height = (canvas.height / 4).max(1);
    let aspect = recorded.width as f64 / recorded.height.max(1) as f64;
    let width = ((height as f64 * aspect).round() as i32).clamp(1, canvas.width.max(1));
    Size::new(width, height)
}

/// Pastes a shrunken copy of `recorded` into the top-left corner of `rendered`.
pub fn compose_overlay(rendered: &Mat, recorded: &Mat) -> Result<Mat, ReconstructError> {
    if rendered.empty() || recorded.empty() {
        return Err(CvUtilsError::EmptyFrame.into());
    }
    let mut canvas = rendered.clone();
    let inset = overlay_inset_size(canvas.size()?, recorded.size()?);
    let small = CvImage::new(recorded.clone()).resize(inset.width, inset.height)?;
    let mut roi = Mat::roi_mut(&mut canvas, Rect::new(0, 0, inset.width, inset.height))?;
    small.mat.copy_to(&mut roi)?;
    Ok(canvas)
}

/// Output frame size for a composite built from `rendered_size` frames.
pub fn composite_canvas_size(layout: CompositeLayout, rendered_size: Size, target: Size) -> Size {
    match layout {
        CompositeLayout::SideBySide => Size::new(target.width * 2, target.height),
        CompositeLayout::Overlay => rendered_size,
    }
}

/// Pairs rendered frame `i` with recorded frame `i`, one composite per pair.
///
/// Covers `0..min(total, recorded.len())`. A missing or undecodable rendered
/// frame is skipped together with its recorded partner, keeping later pairs aligned.
pub fn write_composite<S: FrameSink>(
    rendered: &BTreeMap<usize, Option<Mat>>,
    total: usize,
    recorded: &[Mat],
    layout: CompositeLayout,
    target: Size,
    sink: &mut S,
) -> Result<usize, ReconstructError> {
    let count = total.min(recorded.len());
    if total != recorded.len() {
        tracing::warn!(
            "Frame count mismatch: {} rendered vs {} recorded, pairing {}",
            total,
            recorded.len(),
            count
        );
    }
    let mut written = 0;
    for (index, record) in recorded.iter().enumerate().take(count) {
        match rendered.get(&index) {
            Some(Some(render)) => {
                let frame = match layout {
                    CompositeLayout::SideBySide => compose_side_by_side(render, record, target)?,
                    CompositeLayout::Overlay => compose_overlay(render, record)?,
                };
                sink.write(&frame)?;
                written += 1;
            }
            Some(None) => tracing::warn!("Undecodable frame: {}", index),
            None => tracing::warn!("Missing frame: {}", index),
        }
    }
    sink.finish()?;
    Ok(written)
}

#[derive(Debug, Clone)]
pub struct ReconstructSettings {
    pub output_dir: PathBuf,
    pub fps: f64,
    pub fourcc: String,
    pub container: String,
    pub composite: Option<CompositeConfig>,
}

impl From<&UploadConfig> for ReconstructSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            fps: config.fps,
            fourcc: config.fourcc.clone(),
            container: config.container.clone(),
            composite: config.composite.clone(),
        }
    }
}

impl ReconstructSettings {
    pub fn output_path(&self, session_id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{}", session_id, self.container))
    }
}

/// Turns a completed upload session into a video file on disk.
///
/// With a composite configured, the uploaded frames are treated as the
/// rendered view and combined with the recorded video.
pub fn reconstruct_session(
    session: UploadSession,
    settings: &ReconstructSettings,
) -> Result<(PathBuf, usize), ReconstructError> {
    let output_path = settings.output_path(session.id());
    let target = Size::new(session.width(), session.height());

    let written = match &settings.composite {
        None => {
            let mut sink =
                VideoFileSink::create(&output_path, &settings.fourcc, settings.fps, target)?;
            write_sequence(session.frames(), session.expected_total(), &mut sink)?
        }
        Some(composite) => {
            let recorded = VideoSource::open(&composite.recorded_video)?.read_all()?;
            let first = session
                .frames()
                .values()
                .flatten()
                .next()
                .ok_or(ReconstructError::NoFrames)?;
            let canvas = composite_canvas_size(composite.layout, first.size()?, target);
            let mut sink =
                VideoFileSink::create(&output_path, &settings.fourcc, settings.fps, canvas)?;
            write_composite(
                session.frames(),
                session.expected_total(),
                &recorded,
                composite.layout,
                target,
                &mut sink,
            )?
        }
    };

    Ok((output_path, written))
}

/// Runs a session's reconstruction on the blocking pool.
///
/// The outcome, including a panic inside the codec, is written to the
/// session's status record in `store`; nothing is returned to the caller.
pub fn spawn_reconstruction(
    store: Arc<FrameStore>,
    session: UploadSession,
    settings: Arc<ReconstructSettings>,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let session_id = session.id().to_string();
        let started = Instant::now();
        tracing::info!(
            "Starting video creation for session {} with {} frames",
            session_id,
            session.expected_total()
        );

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            reconstruct_session(session, &settings)
        }))
        .unwrap_or_else(|_| Err(ReconstructError::Panicked));

        let elapsed = started.elapsed();
        metrics.record_reconstruction(elapsed.as_millis() as u64, outcome.is_ok());
        match &outcome {
            Ok((path, written)) => tracing::info!(
                "Video saved as {:?} with {} frames in {:?}",
                path,
                written,
                elapsed
            ),
            Err(e) => tracing::error!("Video creation failed for session {}: {}", session_id, e),
        }

        store.finish(&session_id, outcome.map_err(|e| e.to_string()));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_store::{BatchOutcome, FrameBatch, SessionState};
    use bytes::Bytes;
    use opencv::core::{Scalar, Vec3b, CV_8UC3};

    #[derive(Default)]
    struct CountingSink {
        sizes: Vec<Size>,
        frames: Vec<Mat>,
        finished: bool,
    }

    impl FrameSink for CountingSink {
        fn write(&mut self, frame: &Mat) -> Result<(), ReconstructError> {
            self.sizes.push(frame.size()?);
            self.frames.push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<(), ReconstructError> {
            self.finished = true;
            Ok(())
        }
    }

    fn solid(rows: i32, cols: i32, bgr: (f64, f64, f64)) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::new(bgr.0, bgr.1, bgr.2, 0.0))
            .unwrap()
    }

    fn pixel(mat: &Mat, row: i32, col: i32) -> Vec3b {
        *mat.at_2d::<Vec3b>(row, col).unwrap()
    }

    #[test]
    fn test_complete_sequence_writes_every_frame() {
        let frames: BTreeMap<usize, Option<Mat>> =
            (0..5).map(|i| (i, Some(solid(8, 8, (0.0, 0.0, 0.0))))).collect();
        let mut sink = CountingSink::default();

        let written = write_sequence(&frames, 5, &mut sink).unwrap();

        assert_eq!(written, 5);
        assert_eq!(sink.sizes.len(), 5);
        assert!(sink.finished);
    }

    #[test]
    fn test_gaps_are_skipped_not_fatal() {
        let mut frames: BTreeMap<usize, Option<Mat>> = BTreeMap::new();
        frames.insert(0, Some(solid(8, 8, (0.0, 0.0, 0.0))));
        frames.insert(2, None);
        frames.insert(3, Some(solid(8, 8, (0.0, 0.0, 0.0))));
        let mut sink = CountingSink::default();

        let written = write_sequence(&frames, 5, &mut sink).unwrap();

        assert_eq!(written, 2);
        assert!(sink.finished);
    }

    #[test]
    fn test_side_by_side_doubles_width() {
        let rendered = solid(100, 200, (255.0, 0.0, 0.0));
        let recorded = solid(720, 1280, (0.0, 0.0, 255.0));

        let out = compose_side_by_side(&rendered, &recorded, Size::new(160, 90)).unwrap();

        assert_eq!(out.cols(), 320);
        assert_eq!(out.rows(), 90);
        assert_eq!(pixel(&out, 45, 10), Vec3b::from([255, 0, 0]));
        assert_eq!(pixel(&out, 45, 300), Vec3b::from([0, 0, 255]));
    }

    #[test]
    fn test_overlay_inset_keeps_aspect_ratio() {
        let inset = overlay_inset_size(Size::new(800, 400), Size::new(1920, 1080));
        assert_eq!(inset, Size::new(178, 100));
    }

    #[test]
    fn test_overlay_pastes_top_left_only() {
        let rendered = solid(400, 800, (255.0, 0.0, 0.0));
        let recorded = solid(1080, 1920, (0.0, 255.0, 0.0));

        let out = compose_overlay(&rendered, &recorded).unwrap();

        assert_eq!(out.rows(), 400);
        assert_eq!(out.cols(), 800);
        assert_eq!(pixel(&out, 0, 0), Vec3b::from([0, 255, 0]));
        assert_eq!(pixel(&out, 99, 177), Vec3b::from([0, 255, 0]));
        assert_eq!(pixel(&out, 100, 0), Vec3b::from([255, 0, 0]));
        assert_eq!(pixel(&out, 0, 178), Vec3b::from([255, 0, 0]));
        assert_eq!(pixel(&out, 399, 799), Vec3b::from([255, 0, 0]));
    }

    #[test]
    fn test_composite_stops_at_shorter_source() {
        let rendered: BTreeMap<usize, Option<Mat>> = (0..4)
            .map(|i| (i, Some(solid(40, 80, (0.0, 0.0, 0.0)))))
            .collect();
        let recorded: Vec<Mat> = (0..3).map(|_| solid(30, 40, (9.0, 9.0, 9.0))).collect();
        let mut sink = CountingSink::default();

        let written = write_composite(
            &rendered,
            4,
            &recorded,
            CompositeLayout::SideBySide,
            Size::new(80, 40),
            &mut sink,
        )
        .unwrap();

        assert_eq!(written, 3);
        assert!(sink.sizes.iter().all(|s| *s == Size::new(160, 40)));
    }

    #[test]
    fn test_composite_gaps_keep_pairs_aligned() {
        let mut rendered: BTreeMap<usize, Option<Mat>> = BTreeMap::new();
        rendered.insert(0, Some(solid(20, 20, (0.0, 0.0, 0.0))));
        rendered.insert(1, None);
        rendered.insert(3, Some(solid(20, 20, (0.0, 0.0, 0.0))));
        let recorded: Vec<Mat> = (0..4)
            .map(|i| solid(20, 20, (i as f64 * 50.0, 0.0, 0.0)))
            .collect();
        let mut sink = CountingSink::default();

        let written = write_composite(
            &rendered,
            4,
            &recorded,
            CompositeLayout::SideBySide,
            Size::new(20, 20),
            &mut sink,
        )
        .unwrap();

        assert_eq!(written, 2);
        assert!(sink.finished);
        assert_eq!(pixel(&sink.frames[0], 10, 30), Vec3b::from([0, 0, 0]));
        assert_eq!(pixel(&sink.frames[1], 10, 30), Vec3b::from([150, 0, 0]));
    }

    #[test]
    fn test_canvas_size_per_layout() {
        let rendered = Size::new(640, 480);
        let target = Size::new(320, 240);
        assert_eq!(
            composite_canvas_size(CompositeLayout::SideBySide, rendered, target),
            Size::new(640, 240)
        );
        assert_eq!(
            composite_canvas_size(CompositeLayout::Overlay, rendered, target),
            rendered
        );
    }

    #[tokio::test]
    async fn test_failed_reconstruction_is_recorded_and_store_stays_empty() {
        let store = Arc::new(FrameStore::new(500));
        let png = CvImage::new(solid(6, 8, (1.0, 2.0, 3.0))).to_png().unwrap();
        let outcome = store
            .ingest(FrameBatch {
                session_id: Some("s1".to_string()),
                batch_index: 0,
                batch_size: Some(1),
                width: 8,
                height: 6,
                total_frames: 1,
                files: vec![Bytes::from(png)],
            })
            .unwrap();
        let BatchOutcome::Complete(session) = outcome else {
            panic!("session should be complete");
        };
        let settings = Arc::new(ReconstructSettings {
            output_dir: PathBuf::from("/no/such/dir"),
            fps: 30.0,
            fourcc: "mp4v".to_string(),
            container: "mp4".to_string(),
            composite: Some(CompositeConfig {
                recorded_video: PathBuf::from("/no/such/video.mp4"),
                layout: CompositeLayout::Overlay,
            }),
        });

        spawn_reconstruction(
            store.clone(),
            session,
            settings,
            Arc::new(Metrics::new().unwrap()),
        )
        .await
        .unwrap();

        let status = store.status("s1").unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert!(status.error.is_some());
        assert_eq!(store.buffered_frames(), 0);
    }
}
