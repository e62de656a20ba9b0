pub mod ml_model;
pub mod preprocess;
pub mod device;
pub mod inference;
pub mod loader;
pub mod import;

pub use ml_model::{FoodClassifier, ModelConfig, ARCHITECTURE, BASE_NUM_CLASSES, IMAGE_SIZE, NUM_FEATURES};
pub use preprocess::{preprocess_bytes, preprocess_rgb, PreprocessedImage, IMAGENET_MEAN, IMAGENET_STD};
pub use device::{select_device, ComputeDevice};
pub use inference::{Inference, InferenceEngine};
pub use loader::{build_model, initialize_model, load_weights, save_weights, LoadedModel, WeightsStatus};
pub use import::{import_timm_weights, timm_key_patterns};
