pub mod barcode;
pub mod gemini;
pub mod normalize;
pub mod queue;
pub mod storage;
pub mod zbar;
