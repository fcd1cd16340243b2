//! An Uptane-verifying update agent for a vehicle's Primary ECU: fetches
//! and cross-verifies Director/Image repository metadata, downloads and
//! installs targets for itself and any registered Secondary ECUs, and
//! reports signed manifests back to the Director.
//!
//! [`device::Device`] is the entry point embedders construct; everything
//! else in this crate is a collaborator it wires together.

pub mod clock;
pub mod command_queue;
pub mod config;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod http;
pub mod installer;
pub mod manifest;
pub mod metadata;
pub mod orchestrator;
pub mod pacman;
pub mod secondary;
pub mod storage;
pub mod util;
pub mod verifier;

pub use config::Config;
pub use device::Device;
pub use error::Error;
pub use events::{Event, EventSink};
