//! Primed models and the single-instance classification pipeline.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::classifier::ClassifierEngine;
use crate::classifier::TrainedClassifier;
use crate::error::ModelError;
use crate::error::Result;
use crate::instances;
use crate::instances::InstanceSet;
use crate::model::Context;
use crate::model::FeatureMap;
use crate::model::ModelConfig;
use crate::model::ReturnKey;
use crate::model::ReturnKeys;
use crate::model::SetType;
use crate::persist;
use crate::persist::ModelArtifact;
use crate::scope;

pub const PRED_LABEL: &str = "pred-label";
pub const CORRECT_LABEL: &str = "correct-label";
pub const CORRECT: &str = "correct?";
pub const CONFIDENCE: &str = "confidence";
/// Gold label placeholder for rows without a class value.
pub const NO_CLASS_LABEL: &str = "<no class label>";

/// Outcome of classifying one instance. Only requested keys are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMap {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributions: Option<IndexMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureMap>,
}

impl ResultMap {
    /// Probability assigned to the predicted label.
    pub fn confidence(&self) -> Option<f64> {
        let label = self.label.as_ref()?;
        self.distributions.as_ref()?.get(label).copied()
    }
}

#[derive(Debug, Clone)]
struct PrimedState {
    classifier: Arc<dyn TrainedClassifier>,
    template: InstanceSet,
}

/// A persisted model bound to its configuration, ready to classify once
/// primed.
#[derive(Debug, Clone)]
pub struct Model {
    config: Arc<ModelConfig>,
    artifact: ModelArtifact,
    primed: Option<PrimedState>,
}

impl Model {
    pub fn new(config: Arc<ModelConfig>, artifact: ModelArtifact) -> Self {
        Self {
            config,
            artifact,
            primed: None,
        }
    }

    /// Read `path` (failing if it does not exist) and prime the result.
    pub fn load(
        config: &Arc<ModelConfig>,
        engine: &dyn ClassifierEngine,
        path: &Path,
    ) -> Result<Self> {
        let artifact = persist::read_model(config, path, true)?;
        prime_model(config, engine, artifact)
    }

    pub fn name(&self) -> &str {
        &self.artifact.name
    }

    pub fn config(&self) -> &Arc<ModelConfig> {
        &self.config
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn into_artifact(self) -> ModelArtifact {
        self.artifact
    }

    pub fn context(&self) -> Option<&Context> {
        self.artifact.context.as_ref()
    }

    pub fn is_primed(&self) -> bool {
        self.primed.is_some()
    }

    pub fn template(&self) -> Option<&InstanceSet> {
        self.primed.as_ref().map(|primed| &primed.template)
    }

    pub fn classifier(&self) -> Option<&Arc<dyn TrainedClassifier>> {
        self.primed.as_ref().map(|primed| &primed.classifier)
    }

    /// Restore the classifier through `engine` and rebuild the instance
    /// template from the persisted schema. Re-priming replaces the previous
    /// state with an identical one.
    pub fn prime(&mut self, engine: &dyn ClassifierEngine) -> Result<()> {
        let blob = self
            .artifact
            .classifier
            .as_ref()
            .ok_or_else(|| ModelError::ModelNotFound {
                path: persist::model_file(Path::new(""), &self.artifact.name),
            })?;

        let classifier = engine.restore(blob)?;
        let template = scope::with_config(Arc::clone(&self.config), || {
            self.artifact.instance_template()
        })?;
        log::debug!(
            "primed model '{}' with {} attributes",
            self.artifact.name,
            template.attributes().len()
        );
        self.primed = Some(PrimedState {
            classifier,
            template,
        });
        Ok(())
    }

    fn primed(&self) -> Result<&PrimedState> {
        self.primed.as_ref().ok_or_else(|| ModelError::ModelNotPrimed {
            name: self.artifact.name.clone(),
        })
    }
}

/// Bind `artifact` to `config` and prime it.
pub fn prime_model(
    config: &Arc<ModelConfig>,
    engine: &dyn ClassifierEngine,
    artifact: ModelArtifact,
) -> Result<Model> {
    let mut model = Model::new(Arc::clone(config), artifact);
    model.prime(engine)?;
    Ok(model)
}

/// Generate features for `inputs` and classify them.
pub fn classify(model: &Model, inputs: &[Value]) -> Result<ResultMap> {
    model.primed()?;
    let config = Arc::clone(model.config());
    scope::with_config(Arc::clone(&config), || {
        let features = config.features(inputs, model.context())?;
        classify_features(model, features)
    })
}

/// Classify an already generated feature map.
pub fn classify_features(model: &Model, features: FeatureMap) -> Result<ResultMap> {
    let config = Arc::clone(model.config());
    scope::with_config(Arc::clone(&config), || {
        let mut result = run_classifier(model, &features, config.return_keys())?;
        if config.return_keys().contains(ReturnKey::Features) {
            result.features = Some(features);
        }
        config.transform_result(result)
    })
}

fn run_classifier(model: &Model, features: &FeatureMap, keys: &ReturnKeys) -> Result<ResultMap> {
    let primed = model.primed()?;
    let mut instance = primed.template.clone();
    let class_index = instance.class_index();

    let cells = instance
        .attributes()
        .iter()
        .enumerate()
        .filter(|(index, _)| Some(*index) != class_index)
        .filter_map(|(index, attribute)| {
            features
                .get(&attribute.name)
                .map(|value| instances::coerce(attribute, value).map(|cell| (index, cell)))
        })
        .collect::<Result<Vec<_>>>()?;
    for (index, cell) in cells {
        instance.set_cell(0, index, cell)?;
    }

    primed.classifier.classify(&instance, 0, keys)
}

/// Rows of predictions with gold labels and displayed features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionTable {
    pub columns: Vec<String>,
    pub model: String,
    pub data: Vec<IndexMap<String, Value>>,
}

impl PredictionTable {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn correct_count(&self) -> usize {
        self.data
            .iter()
            .filter(|row| row.get(CORRECT) == Some(&Value::Bool(true)))
            .count()
    }
}

/// Classify either caller supplied inputs (through the feature generator)
/// or the bulk feature sets of `set`.
pub fn predict(
    model: &Model,
    set: SetType,
    feature_sets: Option<&[Vec<Value>]>,
) -> Result<PredictionTable> {
    model.primed()?;
    let config = Arc::clone(model.config());

    scope::with_config(Arc::clone(&config), || {
        let rows = match feature_sets {
            Some(inputs) => inputs
                .iter()
                .map(|input| config.features(input, model.context()))
                .collect::<Result<Vec<_>>>()?,
            None => config.feature_sets(set)?,
        };

        let display = config.display_features(&model.artifact().feature_metadata);
        let mut columns: Vec<String> = [PRED_LABEL, CORRECT_LABEL, CORRECT, CONFIDENCE]
            .into_iter()
            .map(str::to_string)
            .collect();
        columns.extend(display.iter().cloned());

        let keys = ReturnKeys::new([ReturnKey::Label, ReturnKey::Distributions]);
        let class_key = &model.artifact().classify_attrib;
        let mut data = Vec::with_capacity(rows.len());

        for features in &rows {
            let result = run_classifier(model, features, &keys)?;
            let predicted = result.label.clone().ok_or_else(|| {
                ModelError::engine(
                    model.classifier().map_or("unknown", |c| c.engine_name()),
                    "no label returned",
                )
            })?;
            let gold = features
                .get(class_key)
                .and_then(label_of)
                .unwrap_or_else(|| NO_CLASS_LABEL.to_string());
            log::debug!("predicted '{predicted}' for gold '{gold}'");

            let mut row = IndexMap::new();
            row.insert(PRED_LABEL.to_string(), json!(predicted));
            row.insert(CORRECT_LABEL.to_string(), json!(gold));
            row.insert(CORRECT.to_string(), json!(predicted == gold));
            row.insert(CONFIDENCE.to_string(), json!(result.confidence()));
            for key in &display {
                row.insert(key.clone(), features.get(key).cloned().unwrap_or(Value::Null));
            }
            data.push(row);
        }

        Ok(PredictionTable {
            columns,
            model: model.name().to_string(),
            data,
        })
    })
}

fn label_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
