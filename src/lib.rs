//! Pull an image from a Docker registry and run a command inside a chroot
//! built from its layers.

pub mod config;
pub mod error;
pub mod fs;
pub mod images;
pub mod layer;
pub mod reference;
pub mod sandbox;
pub mod transport;

pub use config::Config;
pub use error::{ConfigError, Result, SandboxError, TransportError};
pub use reference::ImageReference;
pub use sandbox::{ChrootIsolation, Isolation, NoIsolation, Sandbox, SandboxRoot};
pub use transport::{HttpTransport, Transport};
