//! Builds a wired `FrameController` from source descriptors.

use crate::channel;
use crate::controller::FrameController;
use crate::error::ConfigurationError;
use crate::frame::{Frame, SourceId};
use crate::policy::PublishPolicy;
use crate::source::{
    CaptureSettings, FrameSource, SourceKind, SourceWiring, Transform, identity,
};
use crate::stream::{MediaOpener, StreamOpener};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Highest accepted capture rate; the derived channel capacity grows with it.
pub const MAX_FPS: f64 = 1000.0;

fn default_fps() -> f64 {
    30.0
}

fn default_timeout_ms() -> u64 {
    100
}

/// Device index or file path, as written in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Index(i64),
    Path(String),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Index(index) => write!(f, "{}", index),
            Target::Path(path) => f.write_str(path),
        }
    }
}

/// One source as described in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceDescriptor {
    /// Explicit id; defaults to the device index or the file name.
    #[serde(default)]
    pub id: Option<String>,
    /// `device` or `file`.
    pub kind: String,
    pub target: Target,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Publish timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl SourceDescriptor {
    pub fn device(index: u32, fps: f64) -> Self {
        Self {
            id: None,
            kind: "device".to_string(),
            target: Target::Index(index.into()),
            fps,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn file(path: impl Into<String>, fps: f64) -> Self {
        Self {
            id: None,
            kind: "file".to_string(),
            target: Target::Path(path.into()),
            fps,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    fn resolve_kind(&self, index: usize) -> Result<SourceKind, ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidTarget {
            index,
            target: self.target.to_string(),
            reason: reason.to_string(),
        };

        match self.kind.to_lowercase().as_str() {
            "device" => {
                let device = match &self.target {
                    Target::Index(n) => u32::try_from(*n).ok(),
                    Target::Path(s) => s.trim().parse::<u32>().ok(),
                };
                device
                    .map(SourceKind::Device)
                    .ok_or_else(|| invalid("device target must be a non-negative integer"))
            }
            "file" => match &self.target {
                Target::Path(path) if !path.trim().is_empty() => {
                    Ok(SourceKind::File(PathBuf::from(path)))
                }
                Target::Path(_) => Err(invalid("file target must not be empty")),
                Target::Index(_) => Err(invalid("file target must be a path")),
            },
            other => Err(ConfigurationError::UnknownKind {
                index,
                kind: other.to_string(),
            }),
        }
    }
}

/// Channel capacity sized to one second of the average source rate, plus one.
///
/// Non-positive rates count as zero.
pub fn default_capacity(fps: impl IntoIterator<Item = f64>) -> usize {
    let (sum, count) = fps
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), fps| (sum + fps.max(0.0), count + 1));
    if count == 0 {
        return 1;
    }
    let mean = (sum / count as f64).round();
    (mean as usize).saturating_add(1).max(1)
}

struct ResolvedSource {
    id: SourceId,
    kind: SourceKind,
    settings: CaptureSettings,
}

/// Translates descriptors into a controller with one worker per source.
pub struct FrameControllerFactory {
    descriptors: Vec<SourceDescriptor>,
    capacity: Option<usize>,
    policy: PublishPolicy,
    opener: Arc<dyn StreamOpener>,
}

impl FrameControllerFactory {
    pub fn new(descriptors: Vec<SourceDescriptor>) -> Self {
        Self {
            descriptors,
            capacity: None,
            policy: PublishPolicy::default(),
            opener: Arc::new(MediaOpener),
        }
    }

    /// Explicit channel capacity; `None` sizes it from the sources' fps.
    pub fn with_capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: PublishPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the default V4L2 / Motion-JPEG opener.
    pub fn with_opener(mut self, opener: impl StreamOpener + 'static) -> Self {
        self.opener = Arc::new(opener);
        self
    }

    /// Controller publishing raw frames.
    pub fn build(&self) -> Result<FrameController<Frame>, ConfigurationError> {
        self.build_with_transform(identity())
    }

    /// Controller publishing whatever `transform` makes of each frame.
    pub fn build_with_transform<P: Send + 'static>(
        &self,
        transform: Transform<P>,
    ) -> Result<FrameController<P>, ConfigurationError> {
        let resolved = self.resolve()?;
        let capacity = match self.capacity {
            Some(0) => return Err(ConfigurationError::ZeroCapacity),
            Some(capacity) => capacity,
            None => default_capacity(resolved.iter().map(|s| s.settings.fps)),
        };

        let (publisher, collector) = channel::bounded(capacity);
        let sources: Vec<_> = resolved
            .into_iter()
            .map(|source| {
                tracing::debug!(
                    source_id = %source.id,
                    kind = ?source.kind,
                    fps = source.settings.fps,
                    "Source configured"
                );
                FrameSource::new(
                    source.id,
                    source.kind,
                    source.settings,
                    SourceWiring {
                        publisher: publisher.clone(),
                        opener: Arc::clone(&self.opener),
                        transform: Arc::clone(&transform),
                        policy: self.policy,
                    },
                )
            })
            .collect();

        tracing::info!(
            sources = sources.len(),
            capacity,
            policy = ?self.policy,
            "Frame pipeline built"
        );
        Ok(FrameController::new(sources, collector))
    }

    fn resolve(&self) -> Result<Vec<ResolvedSource>, ConfigurationError> {
        if self.descriptors.is_empty() {
            return Err(ConfigurationError::NoSources);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.descriptors.len());
        for (index, descriptor) in self.descriptors.iter().enumerate() {
            let kind = descriptor.resolve_kind(index)?;
            if !descriptor.fps.is_finite() || descriptor.fps > MAX_FPS {
                return Err(ConfigurationError::InvalidFps {
                    index,
                    fps: descriptor.fps,
                });
            }

            let id = match &descriptor.id {
                Some(id) => SourceId::Name(id.clone()),
                None => kind.default_id(),
            };
            // Index(0) and Name("0") print the same
            if !seen.insert(id.to_string()) {
                return Err(ConfigurationError::DuplicateSource(id));
            }

            resolved.push(ResolvedSource {
                id,
                kind,
                settings: CaptureSettings {
                    fps: descriptor.fps,
                    timeout: Duration::from_millis(descriptor.timeout_ms),
                },
            });
        }
        Ok(resolved)
    }
}
