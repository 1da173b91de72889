//! Training pipeline for a dynamically-gated expert transformer over ARC-AGI
//! grids.
//!
//! Every attention and feed-forward layer carries a pool of experts behind a
//! similarity-threshold gate with a straight-through estimator, a fallback
//! top-k override, and epoch-boundary regeneration of expert slots that never
//! activated. The training loop adds augmented-consistency and gate-shaping
//! auxiliary losses on top of pad-masked cross-entropy.

pub mod augment;
pub mod config;
pub mod data;
pub mod model;
pub mod observer;
pub mod sampling;
pub mod tokenizer;
pub mod train;

pub use config::Config;
pub use model::DynOnnModel;
pub use sampling::SamplingStrategy;
pub use tokenizer::ArcTokenizer;
pub use train::Trainer;
