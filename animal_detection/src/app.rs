use crate::{
    config::Config,
    detected_animal::DetectedAnimal,
    detection::VisionAnimalDetection,
    error::VisionAnimalDetectionError,
    ort_recognizer::OrtAnimalRecognizer,
    recognizer::AnimalRecognizer,
};
use futures::future::join_all;
use std::{
    error::Error,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Image decoding task failed: {0}")]
    DecodeTask(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Detection(#[from] VisionAnimalDetectionError),
}

async fn detect_file<R: AnimalRecognizer>(
    detector: &VisionAnimalDetection<R>,
    path: &Path,
) -> Result<Vec<DetectedAnimal>, AppError> {
    let path = path.to_path_buf();
    let image = tokio::task::spawn_blocking(move || image::open(path)).await??;
    Ok(detector.detect_animals(&image).await?)
}

/// Runs detection on every image concurrently and prints one line per animal.
pub async fn run_detections<R: AnimalRecognizer>(
    detector: &VisionAnimalDetection<R>,
    image_paths: Vec<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let total = image_paths.len();
    let jobs = image_paths.into_iter().map(|path| async move {
        let result = detect_file(detector, &path).await;
        (path, result)
    });

    let mut failures = 0;
    for (path, result) in join_all(jobs).await {
        match result {
            Ok(animals) if animals.is_empty() => println!("{}: no animals", path.display()),
            Ok(animals) => {
                for animal in animals {
                    println!("{}: {}", path.display(), animal);
                }
            }
            Err(e) => {
                tracing::error!("Detection failed for {}: {}", path.display(), e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} of {} images failed", failures, total).into());
    }

    Ok(())
}

pub async fn start_app(config: Config, image_paths: Vec<PathBuf>) -> Result<(), Box<dyn Error>> {
    let recognizer = match OrtAnimalRecognizer::new(&config.model, &config.labels) {
        Ok(recognizer) => recognizer,
        Err(e) => {
            tracing::error!("Failed to initialize recognizer: {}", e);
            return Err(e);
        }
    };

    let detector = VisionAnimalDetection::new(recognizer);
    tracing::info!("Detecting animals in {} images", image_paths.len());

    run_detections(&detector, image_paths).await
}
