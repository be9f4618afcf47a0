use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Keystore(#[from] toolgate_keystore::KeystoreError),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}
