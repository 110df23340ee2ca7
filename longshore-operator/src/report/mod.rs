//! Reporting back to the control plane: deploy/command results and the
//! throttled app status push pipeline.

pub mod client;
pub mod reporter;

pub use client::ControlPlaneClient;
pub use reporter::StatusReporter;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control plane returned {status} for {url}")]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
}
