//! Framed MQTT stream layer.
//!
//! Wraps an async byte stream in the protocol codec, probes the protocol
//! version from the CONNECT preamble, and exposes version-specific
//! send/recv helpers with timeouts applied from a [`Builder`] configuration.

#![deny(unsafe_code)]

mod error;
mod server;
mod stream;

pub use error::MqttError;
pub use server::{Builder, Listener};
pub use stream::{v3, v5, Dispatcher, MqttStream};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
