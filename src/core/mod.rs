//! Core types shared by every layer: constants, errors, configuration,
//! message traits, the wire codec and host time.

mod codec;
mod config;
pub mod constants;
mod error;
mod time;
mod traits;

pub use codec::{Reader, Writer};
pub use config::{
    CompressorKind, HostConfig, HostConfigBuilder, PeerConfig, PeerConfigBuilder, SimulatorConfig,
};
pub use constants::*;
pub use error::{CompressionError, CryptoError, DecodeError, NetError, NetResult};
pub use time::{HostClock, HostTimestamp};
pub use traits::{BytesMessage, Message};
