use crate::config::{LabelsConfig, Validatable};
use std::{
    collections::HashSet,
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels: {0}")]
    Io(#[from] io::Error),
    #[error("Labels file contains no class names")]
    Empty,
    #[error("Animal label `{0}` is not a class of the model")]
    UnknownAnimal(String),
}

/// Class names of the model in output order, and which of them are animals.
#[derive(Debug, Clone)]
pub struct LabelSet {
    names: Vec<String>,
    animals: HashSet<usize>,
}

impl LabelSet {
    pub fn new(names: Vec<String>, animal_names: &[String]) -> Result<Self, LabelsError> {
        if names.is_empty() {
            return Err(LabelsError::Empty);
        }

        let animals = animal_names
            .iter()
            .map(|animal| {
                names
                    .iter()
                    .position(|name| name.eq_ignore_ascii_case(animal.trim()))
                    .ok_or_else(|| LabelsError::UnknownAnimal(animal.clone()))
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(Self { names, animals })
    }

    pub fn from_config(labels_cfg: &LabelsConfig) -> Result<Self, LabelsError> {
        let names = load_class_labels(&labels_cfg.get_path())?;
        Self::new(names, &labels_cfg.animals)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    pub fn is_animal(&self, class_id: usize) -> bool {
        self.animals.contains(&class_id)
    }
}

pub fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    parse_class_labels(io::BufReader::new(file))
}

/// One class per line. Only the first comma-separated field is the name, so
/// `name,r,g,b` colour label files load as well.
fn parse_class_labels<R: BufRead>(reader: R) -> io::Result<Vec<String>> {
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let label = line.split(',').next().unwrap_or_default().trim();
        if label.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid line format: {}", line),
            ));
        }
        labels.push(label.to_string());
    }

    Ok(labels)
}
