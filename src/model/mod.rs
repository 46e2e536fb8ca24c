pub mod class_map;
pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use class_map::{ClassMap, ClassMapError, CLASS_MAP_FILE};
pub use config::{
    AppConfig, AugmentSettings, CaptureSettings, ClientSettings, DatasetSettings, DeviceType,
    ModelSettings, ServerSettings, TrainingSettings,
};
pub use model_metadata::ModelMetadata;
pub use model_storage::{load_bundle, load_checkpoint, save_bundle, LoadedCheckpoint};
