mod detected_animal;
mod detection;
mod error;
mod labels;
mod ort_recognizer;
mod recognizer;

pub mod app;
pub mod config;

pub use app::start_app;
pub use detected_animal::{BoundingBox, DetectedAnimal};
pub use detection::{detect_animals, VisionAnimalDetection};
pub use error::{RecognizerError, VisionAnimalDetectionError};
pub use labels::{LabelSet, LabelsError};
pub use ort_recognizer::OrtAnimalRecognizer;
pub use recognizer::{
    AnimalRecognizer, CompletionHandler, Observation, RecognitionResult, RecognizedLabel,
};
