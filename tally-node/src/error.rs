use thiserror::Error;

/// Errors that can occur in the tally node library
#[derive(Error, Debug)]
pub enum TallyError {
    /// Resolve, bind, listen or multicast-join failure. Fatal.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Send or receive failure on an established transport
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The participant is no longer registered
    #[error("Participant {0} is not registered")]
    UnknownParticipant(u64),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

impl From<String> for TallyError {
    fn from(s: String) -> Self {
        TallyError::Other(s)
    }
}

impl From<&str> for TallyError {
    fn from(s: &str) -> Self {
        TallyError::Other(s.to_string())
    }
}

impl From<config::ConfigError> for TallyError {
    fn from(err: config::ConfigError) -> Self {
        TallyError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TallyError {
    fn from(err: toml::ser::Error) -> Self {
        TallyError::Config(err.to_string())
    }
}

impl TallyError {
    /// Wrap an I/O error raised while setting up a listener or socket
    pub fn setup(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        TallyError::Setup(format!("{}: {}", context, err))
    }
}
