use serde::{Deserialize, Serialize};

/// Where an uploaded image was normalized before inference.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessedOn {
    /// The client uploaded an already-normalized 224x224 float image.
    Mobile,
    /// The server resized and scaled a raw photo.
    Backend,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PredictionResponse {
    pub filename: String,
    pub predicted_class: String,
    pub confidence_score: f32,
    pub preprocessed_on: PreprocessedOn,
}
