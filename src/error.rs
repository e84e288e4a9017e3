use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to time API failed: {0}")]
    Transport(#[source] ureq::Error),
    #[error("time API responded with status {0}")]
    Status(u16),
    #[error("failed to read time API response: {0}")]
    Body(#[source] ureq::Error),
    #[error("malformed time API response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("time API returned an impossible date-time {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{seconds:02}")]
    InvalidDateTime {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        seconds: u32,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind HTTP server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("invalid response header `{0}`")]
    InvalidHeader(String),
    #[error("HTTP server I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("cannot install Ctrl+C handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("cannot start background task: {0}")]
    Io(#[from] io::Error),
}
