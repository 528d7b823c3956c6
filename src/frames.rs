//! Still-frame producers
//!
//! Camera and screen capture are external subsystems; the conversation core
//! only asks for "the latest frame" when an utterance is a visual query.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Where a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Device camera
    Camera,
    /// Screen capture
    Screen,
}

impl FrameKind {
    /// Label for logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

/// One encoded still image
#[derive(Debug, Clone)]
pub struct Frame {
    /// Producer that captured it
    pub kind: FrameKind,
    /// Encoded image bytes
    pub data: Vec<u8>,
    /// MIME type of `data`
    pub mime_type: String,
    /// Capture time
    pub captured_at: DateTime<Utc>,
}

/// Pushes still frames on demand
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Which producer this is
    fn kind(&self) -> FrameKind;

    /// Grab the most recent frame
    ///
    /// # Errors
    ///
    /// Returns error if no frame is available
    async fn capture(&self) -> Result<Frame>;
}

/// Serves whatever image currently sits at a path
///
/// Works with any external tool that periodically writes a snapshot
/// (a webcam daemon, a screenshot cron job).
pub struct ImageFileSource {
    kind: FrameKind,
    path: PathBuf,
}

impl ImageFileSource {
    /// Create a source backed by `path`
    #[must_use]
    pub fn new(kind: FrameKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Guess an image MIME type from a file extension
#[must_use]
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
impl FrameSource for ImageFileSource {
    fn kind(&self) -> FrameKind {
        self.kind
    }

    async fn capture(&self) -> Result<Frame> {
        let mime_type = mime_for_path(&self.path).ok_or_else(|| {
            Error::Frame(format!("unsupported image type: {}", self.path.display()))
        })?;

        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::Frame(format!("{}: {e}", self.path.display())))?;
        if data.is_empty() {
            return Err(Error::Frame(format!("{} is empty", self.path.display())));
        }

        Ok(Frame {
            kind: self.kind,
            data,
            mime_type: mime_type.to_string(),
            captured_at: Utc::now(),
        })
    }
}

/// The optional camera and screen producers
#[derive(Clone, Default)]
pub struct FrameProducers {
    camera: Option<Arc<dyn FrameSource>>,
    screen: Option<Arc<dyn FrameSource>>,
}

impl FrameProducers {
    /// Register a producer, replacing any previous one of the same kind
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn FrameSource>) -> Self {
        match source.kind() {
            FrameKind::Camera => self.camera = Some(source),
            FrameKind::Screen => self.screen = Some(source),
        }
        self
    }

    /// Whether nothing is registered
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.camera.is_none() && self.screen.is_none()
    }

    /// Capture from the requested producer, falling back to the other one
    ///
    /// Failures are logged and yield `None` so the utterance still goes out
    /// as plain text.
    pub async fn capture(&self, kind: FrameKind) -> Option<Frame> {
        let (preferred, fallback) = match kind {
            FrameKind::Camera => (&self.camera, &self.screen),
            FrameKind::Screen => (&self.screen, &self.camera),
        };

        for source in [preferred, fallback].into_iter().flatten() {
            match source.capture().await {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::warn!(source = source.kind().as_str(), error = %e, "frame capture failed");
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for FrameProducers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProducers")
            .field("camera", &self.camera.is_some())
            .field("screen", &self.screen.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for_path(Path::new("a/b.PNG")), Some("image/png"));
        assert_eq!(mime_for_path(Path::new("shot.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("notes.txt")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }

    #[tokio::test]
    async fn file_source_reads_latest_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let source = ImageFileSource::new(FrameKind::Camera, &path);
        let frame = source.capture().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Camera);
        assert_eq!(frame.mime_type, "image/png");
        assert_eq!(frame.data.len(), 4);
    }

    #[tokio::test]
    async fn producers_fall_back_to_other_source() {
        let dir = tempfile::tempdir().unwrap();
        let screen_path = dir.path().join("screen.jpg");
        std::fs::write(&screen_path, [0xFF, 0xD8, 0xFF]).unwrap();

        let producers = FrameProducers::default()
            .with_source(Arc::new(ImageFileSource::new(
                FrameKind::Camera,
                dir.path().join("missing.png"),
            )))
            .with_source(Arc::new(ImageFileSource::new(FrameKind::Screen, &screen_path)));

        let frame = producers.capture(FrameKind::Camera).await.unwrap();
        assert_eq!(frame.kind, FrameKind::Screen);
    }

    #[tokio::test]
    async fn empty_producers_yield_nothing() {
        let producers = FrameProducers::default();
        assert!(producers.is_empty());
        assert!(producers.capture(FrameKind::Screen).await.is_none());
    }
}
