pub mod config;
pub mod protocol;
pub mod runtime;

pub use config::{ClientConfig, ServerConfig};
pub use protocol::{DeviceClient, DeviceServer, ShutdownHandle};
pub use runtime::{AcceleratorRuntime, HostRuntime, RuntimeError, RuntimeFactory};
