use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Context;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::classifier::NaiveBayesEngine;
use crate::evaluation::Evaluation;
use crate::model::ModelConfig;
use crate::model::SetType;
use crate::persist;
use crate::report;
use crate::report::ReportSections;
use crate::serving;
use crate::serving::Model;
use crate::serving::PredictionTable;
use crate::serving::ResultMap;
use crate::settings::AppPaths;
use crate::settings::AppSettings;
use crate::settings::ResolvedModel;
use crate::settings::SettingsBundle;
use crate::settings::load_or_initialize_settings;
use crate::training;
use crate::training::FeatureSetResult;
use crate::training::TrainingSource;

/// How a training or evaluation run splits its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Cross validate on the combined corpus with the model's fold count.
    CrossFold,
    #[default]
    TrainTest,
}

/// Files and scores produced by [`Workbench::train`].
#[derive(Debug, Clone, Serialize)]
pub struct TrainOutcome {
    pub model: String,
    pub model_file: PathBuf,
    pub dump_file: PathBuf,
    pub confusion_matrix_file: PathBuf,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictOutcome {
    pub table: PredictionTable,
    pub predictions_file: PathBuf,
}

/// Drives configured models end to end: training, persistence, serving and
/// reporting. Runtime configurations are built once per model so their
/// instance caches survive across calls.
#[derive(Debug)]
pub struct Workbench {
    bundle: SettingsBundle,
    engine: NaiveBayesEngine,
    configs: Mutex<HashMap<String, Arc<ModelConfig>>>,
}

impl Workbench {
    /// Load settings from disk (creating defaults if needed).
    pub fn load(app_name: impl AsRef<str>) -> Result<Self> {
        Ok(Self::from_bundle(load_or_initialize_settings(app_name)?))
    }

    pub fn from_bundle(bundle: SettingsBundle) -> Self {
        Self {
            bundle,
            engine: NaiveBayesEngine::default(),
            configs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_engine(mut self, engine: NaiveBayesEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn settings(&self) -> &AppSettings {
        &self.bundle.settings
    }

    pub fn paths(&self) -> &AppPaths {
        &self.bundle.paths
    }

    pub fn resolve_model(&self, name: &str) -> Result<ResolvedModel> {
        self.bundle.settings.resolve_model(name, &self.bundle.paths)
    }

    /// The shared runtime configuration for `name`.
    pub fn model_config(&self, name: &str) -> Result<Arc<ModelConfig>> {
        let mut configs = self.configs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = configs.get(name) {
            return Ok(Arc::clone(config));
        }
        let config = self.resolve_model(name)?.to_model_config()?;
        configs.insert(name.to_string(), Arc::clone(&config));
        Ok(config)
    }

    fn source(&self, resolved: &ResolvedModel, protocol: Protocol) -> TrainingSource {
        match protocol {
            Protocol::CrossFold => TrainingSource::cross_fold(resolved.folds),
            Protocol::TrainTest => TrainingSource::TrainTest,
        }
    }

    /// Train, persist and report on `name`.
    pub fn train(&self, name: &str, protocol: Protocol) -> Result<TrainOutcome> {
        let resolved = self.resolve_model(name)?;
        let config = self.model_config(name)?;
        let source = self.source(&resolved, protocol);

        let artifact = training::train_model(&config, &self.engine, source)
            .with_context(|| format!("failed to train model '{name}'"))?;
        let evaluation = artifact
            .performance
            .clone()
            .with_context(|| format!("training '{name}' produced no evaluation"))?;

        let model_file = persist::write_model(&resolved.model_dir, &artifact)?;
        let model = serving::prime_model(&config, &self.engine, artifact)?;
        let dump_file = report::write_model_dump(&resolved.report_dir, &model, resolved.report)?;
        let confusion_matrix_file =
            report::write_confusion_matrix(&resolved.report_dir, name, &evaluation.confusion)?;

        Ok(TrainOutcome {
            model: name.to_string(),
            model_file,
            dump_file,
            confusion_matrix_file,
            evaluation,
        })
    }

    pub fn evaluate(&self, name: &str, protocol: Protocol) -> Result<Evaluation> {
        let resolved = self.resolve_model(name)?;
        let config = self.model_config(name)?;
        Ok(training::evaluate(
            &config,
            &self.engine,
            self.source(&resolved, protocol),
        )?)
    }

    /// Evaluate every combination of a configured feature set group.
    pub fn sweep(&self, name: &str, group: &str, protocol: Protocol) -> Result<Vec<FeatureSetResult>> {
        let resolved = self.resolve_model(name)?;
        let config = self.model_config(name)?;
        Ok(training::evaluate_feature_sets(
            &config,
            &self.engine,
            group,
            self.source(&resolved, protocol),
        )?)
    }

    /// Read and prime the persisted model for `name`.
    pub fn load_model(&self, name: &str) -> Result<Model> {
        let resolved = self.resolve_model(name)?;
        let config = self.model_config(name)?;
        Model::load(&config, &self.engine, &resolved.model_file())
            .with_context(|| format!("model '{name}' has not been trained yet"))
    }

    pub fn classify(&self, name: &str, inputs: &[Value]) -> Result<ResultMap> {
        let model = self.load_model(name)?;
        Ok(serving::classify(&model, inputs)?)
    }

    /// Predict `set` (or the given inputs) and write the predictions CSV.
    pub fn predict(
        &self,
        name: &str,
        set: SetType,
        inputs: Option<&[Vec<Value>]>,
    ) -> Result<PredictOutcome> {
        let resolved = self.resolve_model(name)?;
        let model = self.load_model(name)?;
        let table = serving::predict(&model, set, inputs)?;
        let predictions_file = report::write_predictions(&resolved.report_dir, &table)?;
        Ok(PredictOutcome {
            table,
            predictions_file,
        })
    }

    /// Render the persisted model, using the configured sections unless
    /// `sections` is given.
    pub fn describe(&self, name: &str, sections: Option<ReportSections>) -> Result<String> {
        let resolved = self.resolve_model(name)?;
        let model = self.load_model(name)?;
        Ok(report::render_model_dump(
            &model,
            sections.unwrap_or(resolved.report),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::parse_settings;
    use crate::settings::test_env;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn workbench(root: &TempDir) -> Workbench {
        let dir = root.path();
        fs::write(
            dir.join("train.jsonl"),
            [
                r#"{"count": 3, "flag": true, "label": "yes"}"#,
                r#"{"count": 4, "flag": true, "label": "yes"}"#,
                r#"{"count": 1, "flag": false, "label": "no"}"#,
                r#"{"count": 0, "flag": false, "label": "no"}"#,
            ]
            .join("\n"),
        )
        .unwrap();
        fs::write(
            dir.join("test.jsonl"),
            "{\"count\": 5, \"flag\": true, \"label\": \"yes\"}\n\
             {\"count\": 1, \"flag\": false, \"label\": \"no\"}\n",
        )
        .unwrap();

        let settings = parse_settings(
            r#"
                [defaults]
                folds = 3

                [models.toy]
                train = "train.jsonl"
                test = "test.jsonl"
                features = { count = "numeric", flag = "boolean" }
                class = { key = "label", values = ["yes", "no"] }
                feature_sets = { basic = [["count"], ["flag"]] }
            "#,
        )
        .unwrap();
        let paths = AppPaths {
            app_name: "modelwire-test".to_string(),
            config_dir: dir.to_path_buf(),
            config_file: dir.join("config.toml"),
            data_dir: dir.join("data"),
            state_dir: dir.join("state"),
            cache_dir: dir.join("state/cache"),
            model_dir: dir.join("models"),
            report_dir: dir.join("reports"),
        };
        Workbench::from_bundle(SettingsBundle { settings, paths })
    }

    #[test]
    fn train_writes_model_dump_and_confusion_matrix() {
        let tmp = TempDir::new().unwrap();
        let bench = workbench(&tmp);

        let outcome = bench.train("toy", Protocol::TrainTest).unwrap();
        assert_eq!(outcome.model_file, tmp.path().join("models/toy-classifier.dat"));
        assert!(outcome.model_file.exists());
        assert!(outcome.dump_file.exists());
        assert!(outcome.confusion_matrix_file.exists());
        assert_eq!(outcome.evaluation.total, 2);
    }

    #[test]
    fn classify_and_predict_use_the_persisted_model() {
        let tmp = TempDir::new().unwrap();
        let bench = workbench(&tmp);
        bench.train("toy", Protocol::CrossFold).unwrap();

        let result = bench
            .classify("toy", &[json!({"count": 4, "flag": true})])
            .unwrap();
        assert_eq!(result.label.as_deref(), Some("yes"));

        let outcome = bench.predict("toy", SetType::Test, None).unwrap();
        assert_eq!(outcome.table.len(), 2);
        assert!(outcome.predictions_file.exists());

        let dump = bench
            .describe("toy", Some(ReportSections::none()))
            .unwrap();
        assert!(dump.starts_with("model: toy"));
    }

    #[test]
    fn untrained_models_cannot_be_served() {
        let tmp = TempDir::new().unwrap();
        let bench = workbench(&tmp);
        let err = bench.classify("toy", &[json!({"count": 1})]).unwrap_err();
        assert!(format!("{err:#}").contains("has not been trained"), "{err:#}");
    }

    #[test]
    fn configs_are_shared_between_calls() {
        let tmp = TempDir::new().unwrap();
        let bench = workbench(&tmp);
        let first = bench.model_config("toy").unwrap();
        bench.evaluate("toy", Protocol::TrainTest).unwrap();
        assert!(Arc::ptr_eq(&first, &bench.model_config("toy").unwrap()));
        assert!(first.train_test_cache().unwrap().is_filled());

        let ranked = bench.sweep("toy", "basic", Protocol::TrainTest).unwrap();
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn default_sample_model_trains_out_of_the_box() {
        let _guard = test_env::lock();
        let tmp = TempDir::new().unwrap();
        test_env::isolate_xdg(tmp.path());

        let bench = Workbench::load("modelwire-sample").unwrap();
        let outcome = bench.train("weather", Protocol::TrainTest).unwrap();
        assert_eq!(outcome.evaluation.total, 4);
        assert!(outcome.model_file.starts_with(tmp.path()));

        let ranked = bench.sweep("weather", "climate", Protocol::CrossFold).unwrap();
        assert_eq!(ranked.len(), 3);
    }
}
