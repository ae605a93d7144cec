use crate::{
    config::{LabelsConfig, ModelConfig, Validatable},
    detected_animal::BoundingBox,
    error::RecognizerError,
    labels::LabelSet,
    recognizer::{AnimalRecognizer, CompletionHandler, Observation, RecognizedLabel},
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayView2, ArrayViewD, Axis, Ix3, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::runtime::Handle;

fn check_dimensions(image: &DynamicImage) -> Result<(), RecognizerError> {
    let (img_width, img_height) = image.dimensions();
    if img_width == 0 || img_height == 0 {
        return Err(RecognizerError::InvalidImage(format!(
            "image has no pixels ({}x{})",
            img_width, img_height
        )));
    }
    Ok(())
}

fn transform_image(
    image: &DynamicImage,
    input_size: u32,
) -> Result<Array<f32, Ix4>, RecognizerError> {
    check_dimensions(image)?;

    let img = image.resize_exact(input_size, input_size, FilterType::CatmullRom);
    let size = input_size as usize;

    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as _;
        let y = pixel.1 as _;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok(input)
}

#[derive(Debug, Clone, Copy)]
struct DecodeSettings {
    input_size: u32,
    min_probability: f32,
    iou_threshold: f32,
    max_labels: usize,
}

impl From<&ModelConfig> for DecodeSettings {
    fn from(model_config: &ModelConfig) -> Self {
        Self {
            input_size: model_config.input_size,
            min_probability: model_config.min_probability,
            iou_threshold: model_config.iou_threshold,
            max_labels: model_config.max_labels.max(1),
        }
    }
}

/// Decodes a `[1, 4 + classes, candidates]` YOLO output into animal observations.
fn decode_output(
    output: ArrayViewD<f32>,
    labels: &LabelSet,
    settings: &DecodeSettings,
) -> Result<Vec<Observation>, RecognizerError> {
    let output = output
        .into_dimensionality::<Ix3>()
        .map_err(|e| RecognizerError::Inference(format!("unexpected output rank: {}", e)))?;

    let shape = output.shape();
    if shape[0] != 1 || shape[1] != 4 + labels.len() {
        return Err(RecognizerError::Inference(format!(
            "unexpected output shape {:?} for {} classes",
            shape,
            labels.len()
        )));
    }

    let size = settings.input_size as f32;
    let mut candidates = Vec::new();

    // One row per candidate: [xc, yc, w, h, class scores...]
    let rows: ArrayView2<f32> = output.slice(s![0, .., ..]).reversed_axes();
    for row in rows.axis_iter(Axis(0)) {
        let mut ranked: Vec<(usize, f32)> = row
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .filter(|(class_id, prob)| {
                labels.is_animal(*class_id) && *prob >= settings.min_probability
            })
            .collect();

        if ranked.is_empty() {
            continue;
        }

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(settings.max_labels);

        let (xc, yc, w, h) = (row[0], row[1], row[2], row[3]);
        let x1 = ((xc - w / 2.) / size).clamp(0., 1.);
        let y1 = ((yc - h / 2.) / size).clamp(0., 1.);
        let x2 = ((xc + w / 2.) / size).clamp(0., 1.);
        let y2 = ((yc + h / 2.) / size).clamp(0., 1.);

        candidates.push(Observation {
            bounding_box: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
            labels: ranked
                .into_iter()
                .map(|(class_id, prob)| {
                    RecognizedLabel::new(labels.name(class_id).unwrap_or_default(), prob)
                })
                .collect(),
        });
    }

    Ok(non_max_suppression(candidates, settings.iou_threshold))
}

fn top_confidence(observation: &Observation) -> f32 {
    observation
        .labels
        .first()
        .map(|label| label.confidence)
        .unwrap_or_default()
}

fn non_max_suppression(mut candidates: Vec<Observation>, iou_threshold: f32) -> Vec<Observation> {
    candidates.sort_by(|a, b| top_confidence(b).total_cmp(&top_confidence(a)));

    let mut result: Vec<Observation> = Vec::new();
    for candidate in candidates {
        let overlaps = result.iter().any(|kept| {
            kept.bounding_box.iou(&candidate.bounding_box) >= iou_threshold
        });
        if !overlaps {
            result.push(candidate);
        }
    }

    result
}

/// Recognizer backed by a pool of ONNX Runtime sessions.
#[derive(Clone)]
pub struct OrtAnimalRecognizer {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    labels: Arc<LabelSet>,
    settings: DecodeSettings,
}

impl OrtAnimalRecognizer {
    pub fn new(
        model_config: &ModelConfig,
        labels_config: &LabelsConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let labels = LabelSet::from_config(labels_config)?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions for {} classes",
            num_instances,
            labels.len()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            labels: Arc::new(labels),
            settings: DecodeSettings::from(model_config),
        })
    }

    fn run_inference(
        &self,
        input: &Array<f32, Ix4>,
    ) -> Result<ndarray::ArrayD<f32>, RecognizerError> {
        if self.sessions.is_empty() {
            return Err(RecognizerError::Inference(
                "no ONNX sessions available".to_string(),
            ));
        }

        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| RecognizerError::PoisonedSession(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs["output0"].try_extract_tensor::<f32>()?;
        let array = ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| RecognizerError::Inference(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }

    fn recognize(&self, image: &DynamicImage) -> Result<Vec<Observation>, RecognizerError> {
        let input = transform_image(image, self.settings.input_size)?;
        let output = self.run_inference(&input)?;
        decode_output(output.view(), &self.labels, &self.settings)
    }
}

impl AnimalRecognizer for OrtAnimalRecognizer {
    fn perform(
        &self,
        image: &DynamicImage,
        completion: CompletionHandler,
    ) -> Result<(), RecognizerError> {
        let runtime = Handle::try_current().map_err(|_| RecognizerError::NoRuntime)?;
        check_dimensions(image)?;

        // Resizing happens on the blocking pool with inference.
        let image = image.clone();
        let recognizer = self.clone();
        runtime.spawn_blocking(move || {
            let result = recognizer.recognize(&image);
            if let Err(ref e) = result {
                tracing::debug!("Recognition failed: {}", e);
            }
            completion(result);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{detection::detect_animals, error::VisionAnimalDetectionError};
    use image::{ImageBuffer, Rgb};
    use ndarray::Array3;
    use std::sync::atomic::AtomicBool;

    fn test_labels() -> LabelSet {
        LabelSet::new(
            vec!["person".to_string(), "cat".to_string(), "dog".to_string()],
            &["cat".to_string(), "dog".to_string()],
        )
        .unwrap()
    }

    fn test_settings() -> DecodeSettings {
        DecodeSettings {
            input_size: 640,
            min_probability: 0.25,
            iou_threshold: 0.7,
            max_labels: 5,
        }
    }

    fn sessionless_recognizer() -> OrtAnimalRecognizer {
        OrtAnimalRecognizer {
            sessions: Arc::new(vec![]),
            counter: Arc::new(AtomicUsize::new(0)),
            labels: Arc::new(test_labels()),
            settings: test_settings(),
        }
    }

    fn tracking_completion(fired: &Arc<AtomicBool>) -> CompletionHandler {
        let fired = fired.clone();
        Box::new(move |_| fired.store(true, Ordering::SeqCst))
    }

    #[test]
    fn test_perform_without_runtime() {
        let recognizer = sessionless_recognizer();
        let fired = Arc::new(AtomicBool::new(false));

        let result = recognizer.perform(
            &DynamicImage::new_rgb8(8, 8),
            tracking_completion(&fired),
        );

        assert!(matches!(result, Err(RecognizerError::NoRuntime)));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_perform_rejects_empty_image() {
        let recognizer = sessionless_recognizer();
        let fired = Arc::new(AtomicBool::new(false));

        let result = recognizer.perform(
            &DynamicImage::new_rgb8(0, 0),
            tracking_completion(&fired),
        );

        assert!(matches!(result, Err(RecognizerError::InvalidImage(_))));
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_detect_empty_image_is_submission_error() {
        let recognizer = sessionless_recognizer();

        let result = detect_animals(&recognizer, &DynamicImage::new_rgb8(0, 0)).await;

        assert!(matches!(
            result,
            Err(VisionAnimalDetectionError::VisionError(
                RecognizerError::InvalidImage(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_preprocessing_runs_in_completion_path() {
        let recognizer = sessionless_recognizer();

        let result = detect_animals(&recognizer, &DynamicImage::new_rgb8(8, 8)).await;

        assert!(matches!(
            result,
            Err(VisionAnimalDetectionError::VisionError(
                RecognizerError::Inference(ref msg)
            )) if msg == "no ONNX sessions available"
        ));
    }

    fn set_candidate(output: &mut Array3<f32>, index: usize, bbox: [f32; 4], scores: [f32; 3]) {
        for (feature, value) in bbox.iter().chain(scores.iter()).enumerate() {
            output[[0, feature, index]] = *value;
        }
    }

    #[test]
    fn test_transform_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 50, Rgb([255, 0, 0]));
        let image = DynamicImage::ImageRgb8(img);

        let input = transform_image(&image, 64).unwrap();

        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert_eq!(input[[0, 1, 10, 10]], 0.0);
        assert_eq!(input[[0, 2, 10, 10]], 0.0);
    }

    #[test]
    fn test_transform_empty_image() {
        let image = DynamicImage::new_rgb8(0, 0);

        let result = transform_image(&image, 64);

        assert!(matches!(result, Err(RecognizerError::InvalidImage(_))));
    }

    #[test]
    fn test_decode_output() {
        let mut output = Array3::<f32>::zeros((1, 7, 5));
        // cat and dog over the same region
        set_candidate(&mut output, 0, [320., 320., 64., 64.], [0.1, 0.6, 0.7]);
        // near-duplicate of the first, lower score
        set_candidate(&mut output, 1, [322., 320., 64., 64.], [0.0, 0.5, 0.1]);
        // person only
        set_candidate(&mut output, 2, [100., 100., 50., 50.], [0.9, 0.0, 0.0]);
        // separate cat, highest score
        set_candidate(&mut output, 3, [64., 64., 128., 128.], [0.0, 0.95, 0.0]);
        // below threshold
        set_candidate(&mut output, 4, [500., 500., 20., 20.], [0.0, 0.2, 0.1]);

        let observations =
            decode_output(output.into_dyn().view(), &test_labels(), &test_settings()).unwrap();

        assert_eq!(observations.len(), 2);

        assert_eq!(
            observations[0].labels,
            vec![RecognizedLabel::new("cat", 0.95)]
        );
        let bbox = observations[0].bounding_box;
        assert!((bbox.x - 0.0).abs() < 1e-6);
        assert!((bbox.y - 0.0).abs() < 1e-6);
        assert!((bbox.width - 0.2).abs() < 1e-6);
        assert!((bbox.height - 0.2).abs() < 1e-6);

        assert_eq!(
            observations[1].labels,
            vec![
                RecognizedLabel::new("dog", 0.7),
                RecognizedLabel::new("cat", 0.6)
            ]
        );
        let bbox = observations[1].bounding_box;
        assert!((bbox.x - 0.45).abs() < 1e-6);
        assert!((bbox.y - 0.45).abs() < 1e-6);
        assert!((bbox.width - 0.1).abs() < 1e-6);
        assert!((bbox.height - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_decode_output_max_labels_and_clamp() {
        let mut output = Array3::<f32>::zeros((1, 7, 1));
        set_candidate(&mut output, 0, [620., 10., 80., 40.], [0.0, 0.4, 0.8]);
        let settings = DecodeSettings {
            max_labels: 1,
            ..test_settings()
        };

        let observations =
            decode_output(output.into_dyn().view(), &test_labels(), &settings).unwrap();

        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].labels, vec![RecognizedLabel::new("dog", 0.8)]);
        let bbox = observations[0].bounding_box;
        assert!((bbox.x - 580. / 640.).abs() < 1e-6);
        assert!((bbox.y - 0.0).abs() < 1e-6);
        assert!((bbox.x + bbox.width - 1.0).abs() < 1e-6);
        assert!((bbox.height - 30. / 640.).abs() < 1e-6);
    }

    #[test]
    fn test_decode_output_shape_mismatch() {
        let output = Array3::<f32>::zeros((1, 84, 10));

        let result = decode_output(output.into_dyn().view(), &test_labels(), &test_settings());

        assert!(matches!(result, Err(RecognizerError::Inference(_))));
    }

    #[test]
    fn test_decode_output_wrong_rank() {
        let output = ndarray::Array2::<f32>::zeros((7, 10));

        let result = decode_output(output.into_dyn().view(), &test_labels(), &test_settings());

        assert!(matches!(result, Err(RecognizerError::Inference(_))));
    }

    #[test]
    fn test_non_max_suppression_keeps_distinct_regions() {
        let make = |x: f32, confidence: f32| Observation {
            bounding_box: BoundingBox::new(x, 0.0, 0.2, 0.2),
            labels: vec![RecognizedLabel::new("cat", confidence)],
        };

        let kept = non_max_suppression(vec![make(0.0, 0.5), make(0.5, 0.9), make(0.01, 0.6)], 0.7);

        let xs: Vec<f32> = kept.iter().map(|o| o.bounding_box.x).collect();
        assert_eq!(xs, vec![0.5, 0.01]);
    }
}
