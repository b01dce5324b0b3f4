//! Error types for the MAC learning subsystem.
//!
//! Most failure modes inside the learning pipeline are not errors at all:
//! an entry whose preconditions are unmet simply reports `false` from
//! `add()`, an exhausted token pool pauses a queue, and stale requests are
//! dropped. The variants here cover the outer surface (configuration, queue
//! shutdown) and the generation guard on releasing deleted DB objects.

use std::path::PathBuf;
use thiserror::Error;
use vrouter_types::{InterfaceId, ParseError, VrfId};

#[derive(Debug, Error)]
pub enum LearningError {
    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read.
    #[error("Failed to read configuration {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::LearningConfig`].
    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A worker queue was closed (service shut down).
    #[error("{0} queue closed")]
    ChannelClosed(&'static str),

    /// A state release carried a generation that no longer matches the
    /// deleted object.
    #[error("Stale generation for {object}: requested {requested}, current {current:?}")]
    StaleGeneration {
        object: String,
        requested: u64,
        current: Option<u64>,
    },

    /// Trap arrived on an interface the agent does not know.
    #[error("Unknown interface: {0}")]
    UnknownInterface(InterfaceId),

    /// Trap arrived for a VRF the agent does not know.
    #[error("Unknown VRF: {0}")]
    UnknownVrf(VrfId),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, LearningError>;
