#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]

mod endpoint;
mod error;
mod host;
mod message;
mod plugin;
mod proxy;
mod session;
mod transport;

pub use error::{Error, Result};
pub use host::Host;
pub use message::MessageType;
pub use plugin::Plugin;
pub use proxy::{MethodFailure, Proxy};
pub use transport::Connection;

// Params travel as self-describing MessagePack values; callers build and
// inspect them through this type.
pub use rmpv::Value;
