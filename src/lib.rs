mod archive;
mod cv_utils;
mod reconstruct;
mod routes;
mod skeleton;
mod telemetry;

pub mod app;
pub mod capture;
pub mod config;
pub mod frame_store;
pub mod server;

pub use app::start_app;
pub use archive::{ArchivedSource, FrameArchive};
pub use routes::ECHO_PREFIX;
pub use telemetry::Metrics;
