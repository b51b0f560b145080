//! Core library for modelwire: declarative classification models that are
//! trained once, persisted with their training context and served one
//! instance at a time.

pub mod cache;
pub mod classifier;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod instances;
pub mod model;
pub mod persist;
pub mod report;
pub mod scope;
pub mod serving;
pub mod settings;
pub mod training;
pub mod workbench;

pub use cache::CacheCell;
pub use cache::TrainTestInstances;
pub use cache::cross_fold_instances;
pub use cache::train_test_instances;
pub use classifier::ClassifierBlob;
pub use classifier::ClassifierEngine;
pub use classifier::NaiveBayesEngine;
pub use classifier::TrainedClassifier;
pub use error::ModelError;
pub use evaluation::ConfusionMatrix;
pub use evaluation::Evaluation;
pub use instances::InstanceSet;
pub use model::ClassFeatureMeta;
pub use model::Context;
pub use model::FeatureMap;
pub use model::FeatureMetas;
pub use model::FeatureType;
pub use model::ModelConfig;
pub use model::ReturnKey;
pub use model::ReturnKeys;
pub use model::SetType;
pub use persist::ModelArtifact;
pub use persist::read_model;
pub use persist::write_model;
pub use report::ReportSection;
pub use report::ReportSections;
pub use serving::Model;
pub use serving::PredictionTable;
pub use serving::ResultMap;
pub use serving::classify;
pub use serving::predict;
pub use serving::prime_model;
pub use settings::AppPaths;
pub use settings::AppSettings;
pub use settings::ResolvedModel;
pub use settings::SettingsBundle;
pub use settings::load_or_initialize_settings;
pub use training::TrainingSource;
pub use training::evaluate_feature_sets;
pub use training::train_model;
pub use workbench::Protocol;
pub use workbench::Workbench;
