use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config Error: cannot read '{path}': {source}")]
    ConfigReadError {
        path: String,
        source: std::io::Error,
    },

    #[error("Config Error: {0}")]
    ConfigParseError(#[from] serde_json::Error),

    #[error("Config Error: '{key}' {reason}")]
    InvalidParameter { key: &'static str, reason: String },

    #[error("Missing prototype for sensor model '{0}'")]
    UnknownSensorModel(String),

    #[error("Unknown clustering algorithm '{0}'")]
    UnknownClusterizer(String),

    #[error("The agent id {0} is not present in the list of the agents")]
    AgentNotListed(i32),

    #[error("Network Error: {0}")]
    NetworkError(std::io::Error),

    #[error("I/O Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed agent packet: {0}")]
    PacketError(String),

    #[error("Malformed observation file at line {line}: {reason}")]
    ObservationFileError { line: usize, reason: String },
}
