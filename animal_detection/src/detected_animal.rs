use crate::recognizer::Observation;
use std::fmt;

/// Rectangle normalized to the image dimensions, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.) * self.height.max(0.)
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        w.max(0.) * h.max(0.)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0. {
            return 0.;
        }
        intersection / union
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedAnimal {
    pub label: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

impl DetectedAnimal {
    /// Keeps the top-ranked label of the observation, `None` when it has no labels.
    pub fn from_observation(observation: Observation) -> Option<Self> {
        let top_label = observation.labels.into_iter().next()?;
        Some(Self {
            label: top_label.identifier,
            confidence: top_label.confidence,
            bounding_box: observation.bounding_box,
        })
    }
}

impl fmt::Display for DetectedAnimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.2}) at [{:.3}, {:.3}, {:.3}, {:.3}]",
            self.label,
            self.confidence,
            self.bounding_box.x,
            self.bounding_box.y,
            self.bounding_box.width,
            self.bounding_box.height
        )
    }
}
