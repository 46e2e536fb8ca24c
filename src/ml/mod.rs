pub mod inference;
pub mod ml_model;
pub mod training;

pub use inference::InferenceEngine;
pub use ml_model::{
    init_backbone, load_and_normalize_image, normalize_image, EfficientNet, EfficientNetBackbone,
    EfficientNetConfig, EfficientNetVariant, DEFAULT_IMAGE_SIZE,
};
pub use training::{
    save_checkpoint, train_model, GestureBatch, GestureBatcher, GestureDataset, GestureItem,
    TrainOptions, TrainingReport,
};
