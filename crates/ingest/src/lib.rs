pub mod channel;
pub mod config;
pub mod controller;
pub mod decoder;
#[cfg(feature = "v4l2")]
pub mod device;
pub mod error;
pub mod factory;
pub mod frame;
pub mod logging;
pub mod mjpeg;
pub mod policy;
pub mod rate_limiter;
pub mod source;
pub mod stream;

pub use config::AppConfig;
pub use controller::FrameController;
pub use decoder::{FrameDecoder, MjpegDecoder, YuyvDecoder};
#[cfg(feature = "v4l2")]
pub use device::{DeviceStream, PixelFormat};
pub use error::{CaptureError, ConfigurationError, PublishError};
pub use factory::{FrameControllerFactory, SourceDescriptor, Target, default_capacity};
pub use frame::{Envelope, Frame, SourceId};
pub use mjpeg::MjpegFileStream;
pub use policy::{BackoffConfig, PublishPolicy};
pub use rate_limiter::RateLimiter;
pub use source::{
    CaptureSettings, LivenessState, SourceExit, SourceKind, SourceStats, Transform, identity,
};
pub use stream::{CaptureStream, MediaOpener, StreamOpener, SyntheticStream};
