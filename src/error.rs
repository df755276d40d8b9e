use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    #[cfg(feature = "consul")]
    Http(reqwest::Error),
    Status { status: u16, body: String },
    Decode(String),
    InvalidSpec(String),
    UnknownDatacenter(String),
    SessionNotFound(String),
    Internal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            #[cfg(feature = "consul")]
            Error::Http(err) => write!(f, "http error: {err}"),
            Error::Status { status, body } => {
                write!(f, "unexpected status {status}: {}", body.trim())
            }
            Error::Decode(msg) => write!(f, "decode error: {msg}"),
            Error::InvalidSpec(msg) => write!(f, "invalid spec: {msg}"),
            Error::UnknownDatacenter(dc) => write!(f, "no path to datacenter: {dc}"),
            Error::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            #[cfg(feature = "consul")]
            Error::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

#[cfg(feature = "consul")]
impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Http(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
