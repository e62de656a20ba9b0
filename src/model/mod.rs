pub mod model_metadata;
pub mod model_storage;
pub mod label_catalog;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{save_model_with_metadata, load_metadata, load_model_with_metadata};
pub use label_catalog::LabelCatalog;
pub use config::{AppConfig, DeviceType, InitMode, ModelSettings, ServerSettings, DEFAULT_NUM_CLASSES};
