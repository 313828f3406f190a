use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StompError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("malformed header line `{0}`")]
    MalformedHeader(String),
    #[error("invalid escape sequence `\\{0}` in header")]
    InvalidEscape(char),
    #[error("invalid content-length `{0}`")]
    InvalidContentLength(String),
    #[error("frame body is not terminated by NUL")]
    MissingTerminator,
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("frame header is not valid UTF-8")]
    InvalidUtf8,
    #[error("incomplete frame")]
    Incomplete,
    #[error("{0} bytes of trailing data after frame")]
    TrailingData(usize),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StompError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
