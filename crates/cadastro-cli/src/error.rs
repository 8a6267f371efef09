use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] cadastro_core::ValidationError),

    #[error(transparent)]
    Settings(#[from] cadastro_core::SettingsError),

    #[error("usage error: {0}")]
    Usage(String),

    #[error(transparent)]
    Store(#[from] cadastro_store::StoreError),

    #[error(transparent)]
    Dispatch(#[from] cadastro_core::DispatchError),

    #[error(transparent)]
    Queue(#[from] cadastro_core::QueueError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Settings(_) | Self::Usage(_) => 2,
            Self::Queue(cadastro_core::QueueError::Validation(_)) => 2,
            Self::Store(_) => 3,
            Self::Dispatch(_) | Self::Queue(_) => 4,
            Self::Serialization(_) | Self::Io(_) => 5,
        }
    }
}
