use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Image transformation error: {0}")]
    InvalidImage(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Session mutex poisoned: {0}")]
    PoisonedSession(String),
    #[error("No Tokio runtime available to schedule the request")]
    NoRuntime,
    #[error("Recognizer dropped the request without completing it")]
    CompletionDropped,
}

#[derive(Error, Debug)]
pub enum VisionAnimalDetectionError {
    #[error("Vision error: {0}")]
    VisionError(#[from] RecognizerError),
}
