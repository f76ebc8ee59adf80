use std::path::Path;
use std::sync::{Arc, Mutex};

use ndarray::Array4;
use ort::logging::LogLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{TensorRef, ValueType};
use sha2::{Digest, Sha256};

use super::labels::LABELS;
use super::preprocess::INPUT_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("failed to load model from {path}: {message}")]
    Load { path: String, message: String },
    #[error("model artifact checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("model input {name:?} has shape {shape:?}, expected float32 (1, 224, 224, 3)")]
    InputMismatch { name: String, shape: Vec<i64> },
    #[error("model emits {actual} classes but the label table has {expected}")]
    LabelCountMismatch { actual: usize, expected: usize },
    #[error("inference execution failed: {0}")]
    Execution(#[from] ort::Error),
    #[error("model output malformed: {0}")]
    Output(String),
}

/// Wraps the loaded ONNX session. Loaded once per process; `run` serializes
/// access through the mutex so concurrent requests never race the runtime.
#[derive(Clone)]
pub struct Classifier {
    session: Arc<Mutex<Session>>,
    input_name: String,
    output_name: String,
}

fn input_shape_is_canonical(shape: &[i64]) -> bool {
    let size = i64::from(INPUT_SIZE);
    shape.len() == 4
        && (shape[0] == 1 || shape[0] < 0)
        && shape[1] == size
        && shape[2] == size
        && shape[3] == 3
}

impl Classifier {
    /// Loads the versioned model artifact and validates its declared contract:
    /// optional sha256 pin, float32 `(N, 224, 224, 3)` input, and an output
    /// class count matching the label table.
    pub fn load(
        model_path: impl AsRef<Path>,
        expected_sha256: Option<&str>,
    ) -> Result<Self, ClassifierError> {
        let path = model_path.as_ref();

        if let Some(expected) = expected_sha256 {
            let bytes = std::fs::read(path).map_err(|e| ClassifierError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ClassifierError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let session = Session::builder()?
            .with_log_level(LogLevel::Error)?
            .commit_from_file(path)
            .map_err(|e| ClassifierError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let (input_name, input_shape) = {
            let input = session.inputs.first().ok_or_else(|| ClassifierError::Load {
                path: path.display().to_string(),
                message: "model declares no input tensors".to_string(),
            })?;
            let shape = match &input.input_type {
                ValueType::Tensor { ty, shape, .. }
                    if matches!(ty, TensorElementType::Float32) =>
                {
                    shape.iter().copied().collect::<Vec<i64>>()
                }
                _ => Vec::new(),
            };
            (input.name.clone(), shape)
        };
        if !input_shape_is_canonical(&input_shape) {
            return Err(ClassifierError::InputMismatch {
                name: input_name,
                shape: input_shape,
            });
        }

        let (output_name, output_shape) = {
            let output = session
                .outputs
                .first()
                .ok_or_else(|| ClassifierError::Load {
                    path: path.display().to_string(),
                    message: "model declares no output tensors".to_string(),
                })?;
            let shape = match &output.output_type {
                ValueType::Tensor { shape, .. } => shape.iter().copied().collect::<Vec<i64>>(),
                _ => Vec::new(),
            };
            (output.name.clone(), shape)
        };
        // A dynamic class dimension is re-checked on every `run`.
        if let Some(&classes) = output_shape.last() {
            if classes > 0 && classes as usize != LABELS.len() {
                return Err(ClassifierError::LabelCountMismatch {
                    actual: classes as usize,
                    expected: LABELS.len(),
                });
            }
        }

        log::info!(
            "loaded classifier from {} (input {:?} {:?}, {} classes)",
            path.display(),
            input_name,
            input_shape,
            LABELS.len()
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            input_name,
            output_name,
        })
    }

    /// Pure numeric map from canonical tensor to score vector. First output
    /// tensor, first batch row.
    pub fn run(&self, tensor: &Array4<f32>) -> Result<Vec<f32>, ClassifierError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::Output("classifier session lock poisoned".to_string()))?;

        let input_tensor = TensorRef::from_array_view(tensor.view())?;
        let inputs = ort::inputs![self.input_name.as_str() => input_tensor];
        let outputs = session.run(inputs)?;

        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let row_len = shape
            .last()
            .map(|&d| d as usize)
            .filter(|&d| d > 0)
            .ok_or_else(|| {
                ClassifierError::Output(format!("unexpected output shape {shape:?}"))
            })?;
        let scores = data
            .get(..row_len)
            .ok_or_else(|| {
                ClassifierError::Output(format!(
                    "output holds {} values, expected at least {row_len}",
                    data.len()
                ))
            })?
            .to_vec();
        if scores.len() != LABELS.len() {
            return Err(ClassifierError::LabelCountMismatch {
                actual: scores.len(),
                expected: LABELS.len(),
            });
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_input_shapes_are_accepted() {
        assert!(input_shape_is_canonical(&[1, 224, 224, 3]));
        assert!(input_shape_is_canonical(&[-1, 224, 224, 3]));
    }

    #[test]
    fn non_canonical_input_shapes_are_rejected() {
        assert!(!input_shape_is_canonical(&[1, 3, 224, 224]));
        assert!(!input_shape_is_canonical(&[1, 224, 224]));
        assert!(!input_shape_is_canonical(&[2, 224, 224, 3]));
        assert!(!input_shape_is_canonical(&[]));
    }

    #[test]
    fn missing_artifact_fails_checksum_read() {
        let result = Classifier::load("/nonexistent/model.onnx", Some("00"));
        assert!(matches!(result, Err(ClassifierError::Load { .. })));
    }
}
