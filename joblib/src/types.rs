use uuid::Uuid;

pub type Program = std::path::PathBuf;
pub type Args = Vec<String>;
pub type JobId = Uuid;
pub type OutputBlob = bytes::Bytes;
