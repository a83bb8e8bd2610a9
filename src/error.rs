use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid retention expression [{0}]")]
    InvalidRetention(String),
    #[error("invalid snapshot name [{0}]")]
    InvalidSnapshotName(String),
    #[error("invalid subvolume line [{0}]")]
    InvalidSubvolume(String),
    #[error("invalid location url [{0}]")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error(
        "inconsistent path detected at [{url}] [{expected} != {found}], indicating a nested \
         folder/subvolume structure within a container subvolume. each backup job must have a \
         dedicated source/destination container subvolume"
    )]
    InconsistentLayout {
        url: String,
        expected: String,
        found: String,
    },
    #[error(
        "new snapshot name [{new}] would not be newer than the newest existing snapshot [{head}], \
         which may indicate a system time problem"
    )]
    ClockSkew { new: String, head: String },
    #[error("location is not initialized [{0}]")]
    NotInitialized(String),
    #[error("location is already initialized [{0}]")]
    AlreadyInitialized(String),
    #[error("job locations have inconsistent uuids [{0} != {1}]")]
    InconsistentJob(uuid::Uuid, uuid::Uuid),
    #[error("configuration at [{0}] has no usable peer url")]
    NoPeer(String),
    #[error("command failed with exit code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },
    #[error("transfer failed (send exited with {send}, receive exited with {receive})")]
    TransferFailed { send: i32, receive: i32 },
    #[error(transparent)]
    Uuid(#[from] uuid::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
