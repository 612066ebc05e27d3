pub mod audio;
pub mod http;

pub use http::{AnswerResponse, Server, StatusResponse, TranscriptionResponse, UploadResponse};
