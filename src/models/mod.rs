pub mod detection;
pub mod image;
pub mod job;
pub mod product;

pub use detection::{Detection, DetectionSource, NewDetection};
pub use image::{
    DecoderAttempt, Image, ImageStatus, PreprocessingInfo, ProcessingError, ProcessingInfo,
};
pub use job::{Job, JobStatus, JobType};
pub use product::Product;
