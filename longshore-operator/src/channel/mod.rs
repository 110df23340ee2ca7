//! Persistent control channel to the control plane.
//!
//! The operator dials out, authenticates with a `hello` frame and then
//! pumps inbound commands to the deploy worker and the app monitor. Every
//! session failure tears the connection down and redials after a flat
//! delay; commands lost mid-flight are resent by the control plane.

pub mod client;

pub use client::ChannelClient;

use thiserror::Error;

use longshore_wire::WireError;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("connection closed by the control plane")]
    Closed,
    #[error("control plane did not welcome the connection")]
    NoWelcome,
}
