//! Change classification: compares the stored and fetched text of one
//! section and decides how much the change matters legally.

mod classifier;

pub use classifier::{ClassificationError, DiffClassifier, edit_ratio};
