use crate::{
    capture::{CaptureError, VideoSource},
    config::ArchiveConfig,
    cv_utils::{preview_webp, CvUtilsError},
};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to build archive thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Capture error for {path:?}: {source}")]
    Capture {
        path: PathBuf,
        source: CaptureError,
    },
    #[error("Failed to re-encode frame {index} of {path:?}: {source}")]
    Encode {
        path: PathBuf,
        index: usize,
        source: CvUtilsError,
    },
}

/// Every frame of one source video, downscaled and re-encoded.
#[derive(Debug, Clone)]
pub struct ArchivedSource {
    pub name: String,
    pub frames: Vec<Bytes>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub frame_count: usize,
}

/// Compressed frames for each configured source, built once at startup.
#[derive(Debug, Default)]
pub struct FrameArchive {
    sources: Vec<ArchivedSource>,
}

impl FrameArchive {
    pub fn from_sources(sources: Vec<ArchivedSource>) -> Self {
        Self { sources }
    }

    /// Extracts every configured source in parallel on a dedicated pool.
    pub fn build(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("archive-{}", i))
            .build()?;

        let started = Instant::now();
        let sources = pool.install(|| {
            config
                .sources
                .par_iter()
                .map(|path| archive_video(path, config.quality))
                .collect::<Result<Vec<_>, _>>()
        })?;

        tracing::info!(
            "Archived {} sources ({} frames) in {:?}",
            sources.len(),
            sources.iter().map(|s| s.frames.len()).sum::<usize>(),
            started.elapsed()
        );

        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[ArchivedSource] {
        &self.sources
    }

    /// Base64 frame `index` of every source long enough to have one, keyed by source index.
    pub fn frames_at(&self, index: i64) -> BTreeMap<String, String> {
        let Ok(index) = usize::try_from(index) else {
            return BTreeMap::new();
        };
        self.sources
            .iter()
            .enumerate()
            .filter_map(|(source_index, source)| {
                source
                    .frames
                    .get(index)
                    .map(|frame| (source_index.to_string(), general_purpose::STANDARD.encode(frame)))
            })
            .collect()
    }

    pub fn info(&self) -> BTreeMap<String, SourceInfo> {
        self.sources
            .iter()
            .enumerate()
            .map(|(source_index, source)| {
                (
                    source_index.to_string(),
                    SourceInfo {
                        name: source.name.clone(),
                        frame_count: source.frames.len(),
                    },
                )
            })
            .collect()
    }
}

fn archive_video(path: &Path, quality: i32) -> Result<ArchivedSource, ArchiveError> {
    let started = Instant::now();
    let capture_error = |source| ArchiveError::Capture {
        path: path.to_path_buf(),
        source,
    };
    let mut video = VideoSource::open(path).map_err(capture_error)?;
    let expected = video.frame_count().map_err(capture_error)?;

    let mut frames = Vec::with_capacity(usize::try_from(expected).unwrap_or_default());
    while let Some(frame) = video.read_frame().map_err(capture_error)? {
        let encoded = preview_webp(frame, quality).map_err(|source| ArchiveError::Encode {
            path: path.to_path_buf(),
            index: frames.len(),
            source,
        })?;
        frames.push(Bytes::from(encoded));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    tracing::info!(
        "Archived {} frames of {} in {:?}",
        frames.len(),
        name,
        started.elapsed()
    );

    Ok(ArchivedSource { name, frames })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> FrameArchive {
        FrameArchive::from_sources(vec![
            ArchivedSource {
                name: "cam1.mp4".to_string(),
                frames: vec![Bytes::from_static(b"a0"), Bytes::from_static(b"a1")],
            },
            ArchivedSource {
                name: "cam2.mp4".to_string(),
                frames: vec![
                    Bytes::from_static(b"b0"),
                    Bytes::from_static(b"b1"),
                    Bytes::from_static(b"b2"),
                ],
            },
        ])
    }

    #[test]
    fn test_frames_at_includes_every_covering_source() {
        let frames = archive().frames_at(1);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames["0"], general_purpose::STANDARD.encode(b"a1"));
        assert_eq!(frames["1"], general_purpose::STANDARD.encode(b"b1"));
    }

    #[test]
    fn test_short_sources_are_omitted() {
        let frames = archive().frames_at(2);

        assert_eq!(frames.keys().collect::<Vec<_>>(), vec!["1"]);
    }

    #[test]
    fn test_out_of_range_and_negative_are_empty() {
        assert!(archive().frames_at(3).is_empty());
        assert!(archive().frames_at(-1).is_empty());
    }

    #[test]
    fn test_info_reports_names_and_counts() {
        let info = archive().info();

        assert_eq!(
            info["1"],
            SourceInfo {
                name: "cam2.mp4".to_string(),
                frame_count: 3
            }
        );
    }

    #[test]
    fn test_missing_source_fails_build() {
        let config = ArchiveConfig {
            sources: vec![PathBuf::from("/no/such/cam.mp4")],
            workers: 2,
            quality: 70,
        };

        assert!(matches!(
            FrameArchive::build(&config),
            Err(ArchiveError::Capture { .. })
        ));
    }
}
