//! Training, evaluation and feature-set sweeps over cached instances.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::cache;
use crate::cache::TrainTestInstances;
use crate::classifier::ClassifierEngine;
use crate::error::Result;
use crate::evaluation::Evaluation;
use crate::instances::InstanceSet;
use crate::model::ModelConfig;
use crate::persist::ModelArtifact;
use crate::scope;

pub const DEFAULT_FOLDS: usize = 10;

/// Which cached instances a training run uses and how it is evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrainingSource {
    /// The train-test corpus, evaluated with k-fold cross validation.
    CrossFold { folds: usize },
    /// Separate train and test corpora; the final classifier is fitted on
    /// their concatenation.
    #[default]
    TrainTest,
}

impl TrainingSource {
    pub fn cross_fold(folds: usize) -> Self {
        Self::CrossFold { folds }
    }
}

enum Materialized {
    CrossFold {
        set: Arc<InstanceSet>,
        folds: usize,
    },
    TrainTest(Arc<TrainTestInstances>),
}

impl Materialized {
    fn load(config: &Arc<ModelConfig>, source: TrainingSource) -> Result<Self> {
        Ok(match source {
            TrainingSource::CrossFold { folds } => Self::CrossFold {
                set: cache::cross_fold_instances(config)?,
                folds,
            },
            TrainingSource::TrainTest => Self::TrainTest(cache::train_test_instances(config)?),
        })
    }

    fn full(&self) -> &InstanceSet {
        match self {
            Self::CrossFold { set, .. } => set.as_ref(),
            Self::TrainTest(sets) => &sets.train_test,
        }
    }

    fn evaluate(
        &self,
        engine: &dyn ClassifierEngine,
        keep: Option<&[String]>,
    ) -> Result<Evaluation> {
        match self {
            Self::CrossFold { set, folds } => {
                let projected = project(set, keep)?;
                engine.cross_validate(&projected, *folds)
            }
            Self::TrainTest(sets) => {
                let train = project(&sets.train, keep)?;
                let test = project(&sets.test, keep)?;
                engine.evaluate_train_test(&train, &test)
            }
        }
    }
}

fn project<'a>(set: &'a InstanceSet, keep: Option<&[String]>) -> Result<Cow<'a, InstanceSet>> {
    match keep {
        Some(features) => Ok(Cow::Owned(set.select(features)?)),
        None => Ok(Cow::Borrowed(set)),
    }
}

/// Materialize instances, evaluate, fit the final classifier and capture
/// everything serving needs into an artifact.
pub fn train_model(
    config: &Arc<ModelConfig>,
    engine: &dyn ClassifierEngine,
    source: TrainingSource,
) -> Result<ModelArtifact> {
    scope::with_config(Arc::clone(config), || {
        let context = config.training_context()?;
        let metas = config.feature_metas(context.as_ref())?;
        let class_meta = config.class_feature_meta();

        let data = Materialized::load(config, source)?;
        let evaluation = data.evaluate(engine, None)?;
        log::info!(
            "model '{}' evaluated at accuracy {:.4} over {} instances",
            config.name(),
            evaluation.accuracy,
            evaluation.total
        );

        let full = data.full();
        let classifier = engine.train(full)?;
        log::info!(
            "trained '{}' with engine '{}' on {} instances",
            config.name(),
            engine.name(),
            full.len()
        );

        Ok(ModelArtifact::builder()
            .name(config.name())
            .classifier(classifier.to_blob()?)
            .attributes(full.attribute_names())
            .classify_attrib(class_meta.key)
            .class_values(class_meta.values)
            .feature_metadata(metas)
            .maybe_context(context)
            .performance(evaluation)
            .build())
    })
}

/// Evaluate without producing an artifact.
pub fn evaluate(
    config: &Arc<ModelConfig>,
    engine: &dyn ClassifierEngine,
    source: TrainingSource,
) -> Result<Evaluation> {
    scope::with_config(Arc::clone(config), || {
        Materialized::load(config, source)?.evaluate(engine, None)
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSetResult {
    pub features: Vec<String>,
    pub evaluation: Evaluation,
}

/// Evaluate every feature combination of `group` on projected instances,
/// best accuracy first. Ties keep their configured order.
pub fn evaluate_feature_sets(
    config: &Arc<ModelConfig>,
    engine: &dyn ClassifierEngine,
    group: &str,
    source: TrainingSource,
) -> Result<Vec<FeatureSetResult>> {
    let combos = config.feature_set_group(group)?.to_vec();
    scope::with_config(Arc::clone(config), || {
        let data = Materialized::load(config, source)?;
        let mut results = combos
            .into_iter()
            .map(|features| {
                let evaluation = data.evaluate(engine, Some(&features))?;
                log::info!(
                    "feature set {features:?} of '{}': accuracy {:.4}",
                    config.name(),
                    evaluation.accuracy
                );
                Ok(FeatureSetResult {
                    features,
                    evaluation,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        results.sort_by(|a, b| b.evaluation.accuracy.total_cmp(&a.evaluation.accuracy));
        Ok(results)
    })
}
