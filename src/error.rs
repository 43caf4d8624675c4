use crate::offsets::Field;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to initialize introspection session for `{target}`: {err}")]
    Init {
        target: String,
        err: memflow::error::Error,
    },

    #[error("required offsets unavailable: {}", display_fields(.0))]
    OffsetUnavailable(Vec<Field>),

    #[error("unable to read list head at 0x{addr:x}: {err}")]
    ListHead {
        addr: u64,
        err: memflow::error::Error,
    },

    #[error("invalid scan window: {0}")]
    InvalidScanWindow(&'static str),

    #[error("unknown profile `{0}`")]
    UnknownProfile(String),

    #[error("symbol file has no {0} structure")]
    MissingStruct(&'static str),

    #[error("symbol `{0}` not found")]
    MissingSymbol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed symbol file: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn display_fields(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| f.config_key())
        .collect::<Vec<_>>()
        .join(", ")
}
