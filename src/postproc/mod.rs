pub mod jpeg;
pub mod processor;

pub use self::jpeg::{
    EncodeJob, JobId, JpegCallback, JpegEngine, JpegEvent, JpegStatus, SoftwareJpegEngine,
    SourceImage,
};
pub use self::processor::{EncodeSettings, PostProcHost, PostProcessor, StreamShape};
