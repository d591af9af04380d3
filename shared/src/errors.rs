//! Errors raised by the frame codec, ids and session hand-off

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Could not encode {what}: {message}")]
    Encode { what: &'static str, message: String },

    #[error("Could not decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error("Invalid id '{input}'")]
    InvalidId { input: String },

    #[error("Unknown broker environment '{value}'")]
    UnknownEnvironment { value: String },

    #[error("Environment variable {name} is not set")]
    MissingSession { name: &'static str },

    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type SharedResult<T> = Result<T, SharedError>;
