use thiserror::Error;

pub type Result<T> = std::result::Result<T, TalusError>;

#[derive(Error, Debug)]
pub enum TalusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CAN interface error: {0}")]
    Can(String),

    #[error("frame payload of {len} bytes exceeds the {limit} byte limit")]
    DataTooLong { len: usize, limit: usize },

    #[error("malformed frame: {0}")]
    BadFrame(String),

    #[error("retry limit reached while sending command 0x{code:04X}")]
    MaxRetries { code: u16 },

    #[error("send has been aborted")]
    SendAborted,

    #[error("commit barrier expired with commands outstanding")]
    CommitTimeout,

    #[error("node {node}: firmware version {version} does not satisfy {required}")]
    VersionUnsupported {
        node: u32,
        version: String,
        required: String,
    },

    #[error("node {node}: unrecognisable firmware version {version:?}")]
    UnknownVersion { node: u32, version: String },

    #[error("pose requires a negative length on actuator {index}")]
    ImpossiblePose { index: u8 },

    #[error("no such platform {0}")]
    UnknownPlatform(String),

    #[error("no such bus {0}")]
    UnknownBus(String),

    #[error("platform {name} is unable to perform action {action}")]
    UnsupportedAction { name: String, action: String },

    #[error("unable to work with config version {0}")]
    ConfigVersion(u32),

    #[error("invalid configuration: {0}")]
    Config(String),
}
