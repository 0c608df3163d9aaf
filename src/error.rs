use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),

    #[error("malformed MIME header: {0}")]
    MalformedHeader(String),

    #[error("request header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("no destination host in request")]
    MissingHost,

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
