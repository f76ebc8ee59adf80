//! Image normalization and inference pipeline.
//!
//! `preprocess` turns arbitrary upload bytes into the canonical
//! `(1, 224, 224, 3)` float32 tensor, `classifier` wraps the ONNX session,
//! and `predictor` combines the two into the single `predict` entry point
//! the web layer calls.

pub mod classifier;
pub mod labels;
pub mod predictor;
pub mod preprocess;
