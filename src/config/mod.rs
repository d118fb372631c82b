pub mod network;

pub use network::{ConfigError, NetworkConfig};
