use serde::Serialize;
use shared::{PredictionResponse, PreprocessedOn};

use super::classifier::{Classifier, ClassifierError};
use super::labels::LABELS;
use super::preprocess::{self, PreprocessError};

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("{0}")]
    Preprocess(#[from] PreprocessError),
    #[error("{0}")]
    Classifier(#[from] ClassifierError),
}

impl PredictionError {
    /// Decode failures are caller errors; everything else points at the
    /// normalizer or the runtime and is logged as unexpected.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PredictionError::Preprocess(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    pub preprocessed_on: PreprocessedOn,
}

/// Sole entry point the web layer depends on: normalize, run the session,
/// take the argmax. Constructed once in `main` and injected into handlers.
pub struct Predictor {
    classifier: Classifier,
}

impl Predictor {
    pub fn new(classifier: Classifier) -> Self {
        Self { classifier }
    }

    /// Every failure surfaces as the error variant; nothing panics.
    pub fn predict(&self, bytes: &[u8]) -> Result<Prediction, PredictionError> {
        let (tensor, provenance) = preprocess::normalize(bytes)?;
        let scores = self.classifier.run(&tensor)?;
        let index = argmax(&scores).ok_or_else(|| {
            ClassifierError::Output("model returned an empty score vector".to_string())
        })?;
        let label = LABELS.get(index).ok_or_else(|| {
            ClassifierError::Output(format!("winning index {index} outside label table"))
        })?;
        Ok(Prediction {
            label: (*label).to_string(),
            confidence: round_confidence(scores[index]),
            preprocessed_on: provenance,
        })
    }

    /// Runs each upload independently and sequentially. The first failure
    /// aborts the whole batch and is returned alone; callers must persist
    /// nothing for a failed batch.
    pub fn predict_batch(
        &self,
        files: &[(String, Vec<u8>)],
    ) -> Result<Vec<PredictionResponse>, PredictionError> {
        run_batch(files, |bytes| self.predict(bytes))
    }
}

fn run_batch<F>(
    files: &[(String, Vec<u8>)],
    mut predict: F,
) -> Result<Vec<PredictionResponse>, PredictionError>
where
    F: FnMut(&[u8]) -> Result<Prediction, PredictionError>,
{
    let mut results = Vec::with_capacity(files.len());
    for (filename, bytes) in files {
        let prediction = predict(bytes)?;
        results.push(PredictionResponse {
            filename: filename.clone(),
            predicted_class: prediction.label,
            confidence_score: prediction.confidence,
            preprocessed_on: prediction.preprocessed_on,
        });
    }
    Ok(results)
}

/// First maximal index, NumPy argmax semantics.
fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best = 0;
    let mut best_score = *scores.first()?;
    for (index, &score) in scores.iter().enumerate().skip(1) {
        if score > best_score {
            best = index;
            best_score = score;
        }
    }
    Some(best)
}

/// Confidence is reported rounded to exactly four decimal digits.
fn round_confidence(value: f32) -> f32 {
    (value * 10_000.0).round() / 10_000.0
}
