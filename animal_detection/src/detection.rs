use crate::{
    detected_animal::DetectedAnimal,
    error::{RecognizerError, VisionAnimalDetectionError},
    recognizer::{AnimalRecognizer, CompletionHandler},
};
use image::DynamicImage;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::instrument;

/// Submits one recognition request and waits for its completion.
///
/// Each observation is reduced to its first label; observations without labels
/// are dropped and the recognizer's order is preserved. A failed submission is
/// reported even if the recognizer also fired the completion.
#[instrument(skip_all)]
pub async fn detect_animals<R>(
    recognizer: &R,
    image: &DynamicImage,
) -> Result<Vec<DetectedAnimal>, VisionAnimalDetectionError>
where
    R: AnimalRecognizer + ?Sized,
{
    let (tx, rx) = oneshot::channel();
    let completion: CompletionHandler = Box::new(move |result| {
        // The receiver is gone only when submission already failed.
        let _ = tx.send(result);
    });

    recognizer.perform(image, completion)?;

    let observations = rx
        .await
        .map_err(|_| RecognizerError::CompletionDropped)??;

    let animals: Vec<DetectedAnimal> = observations
        .into_iter()
        .filter_map(DetectedAnimal::from_observation)
        .collect();

    tracing::debug!("Returning {} detections", animals.len());
    for (i, animal) in animals.iter().enumerate() {
        tracing::debug!(
            "Detection {}: label={}, confidence={:.3}, bbox=({:.3}, {:.3}, {:.3}, {:.3})",
            i,
            animal.label,
            animal.confidence,
            animal.bounding_box.x,
            animal.bounding_box.y,
            animal.bounding_box.width,
            animal.bounding_box.height
        );
    }

    Ok(animals)
}

#[derive(Debug)]
pub struct VisionAnimalDetection<R: AnimalRecognizer> {
    recognizer: Arc<R>,
}

impl<R: AnimalRecognizer> Clone for VisionAnimalDetection<R> {
    fn clone(&self) -> Self {
        Self {
            recognizer: self.recognizer.clone(),
        }
    }
}

impl<R: AnimalRecognizer> VisionAnimalDetection<R> {
    pub fn new(recognizer: R) -> Self {
        Self {
            recognizer: Arc::new(recognizer),
        }
    }

    pub async fn detect_animals(
        &self,
        image: &DynamicImage,
    ) -> Result<Vec<DetectedAnimal>, VisionAnimalDetectionError> {
        detect_animals(self.recognizer.as_ref(), image).await
    }
}
