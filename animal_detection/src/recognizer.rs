use crate::{detected_animal::BoundingBox, error::RecognizerError};
use image::DynamicImage;

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedLabel {
    pub identifier: String,
    pub confidence: f32,
}

impl RecognizedLabel {
    pub fn new(identifier: impl Into<String>, confidence: f32) -> Self {
        Self {
            identifier: identifier.into(),
            confidence,
        }
    }
}

/// A region found by the recognizer. Labels are ranked, most confident first.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub bounding_box: BoundingBox,
    pub labels: Vec<RecognizedLabel>,
}

pub type RecognitionResult = Result<Vec<Observation>, RecognizerError>;

pub type CompletionHandler = Box<dyn FnOnce(RecognitionResult) + Send + 'static>;

/// Callback-based recognition engine.
///
/// `perform` returns an error when the request cannot be submitted. Once it
/// returns `Ok`, the engine must call `completion` exactly once, from any thread.
pub trait AnimalRecognizer: Send + Sync + 'static {
    fn perform(
        &self,
        image: &DynamicImage,
        completion: CompletionHandler,
    ) -> Result<(), RecognizerError>;
}
