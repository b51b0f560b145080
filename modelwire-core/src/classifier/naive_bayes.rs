use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::sync::Arc;

use bon::Builder;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use super::ClassifierBlob;
use super::ClassifierEngine;
use super::TrainedClassifier;
use crate::error::ModelError;
use crate::error::Result;
use crate::instances::AttributeKind;
use crate::instances::Cell;
use crate::instances::InstanceSet;
use crate::model::ReturnKey;
use crate::model::ReturnKeys;
use crate::serving::ResultMap;

pub const ENGINE_NAME: &str = "naive-bayes";

/// Lowest log density a single numeric attribute can contribute. Values far
/// outside every fitted distribution would otherwise overflow to `-inf` for
/// all classes at once.
const MIN_LOG_DENSITY: f64 = -1.0e6;

/// Reference engine: Gaussian likelihoods for numeric attributes and
/// Laplace-smoothed frequencies for nominal and text attributes.
#[derive(Debug, Clone, Builder)]
pub struct NaiveBayesEngine {
    /// Laplace smoothing added to every count.
    #[builder(default = 1.0)]
    alpha: f64,
    /// Lower bound for per-class variances.
    #[builder(default = 1e-3)]
    min_variance: f64,
}

impl Default for NaiveBayesEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClassifierEngine for NaiveBayesEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn train(&self, instances: &InstanceSet) -> Result<Arc<dyn TrainedClassifier>> {
        let model = NaiveBayesModel::fit(instances, self.alpha, self.min_variance)?;
        log::debug!(
            "trained naive bayes on {} rows of '{}'",
            model.class_counts.iter().sum::<usize>(),
            instances.name()
        );
        Ok(Arc::new(model))
    }

    fn restore(&self, blob: &ClassifierBlob) -> Result<Arc<dyn TrainedClassifier>> {
        if blob.engine != ENGINE_NAME {
            return Err(ModelError::engine(
                ENGINE_NAME,
                format!("cannot restore a classifier written by '{}'", blob.engine),
            ));
        }
        let model: NaiveBayesModel = serde_json::from_slice(&blob.bytes)
            .map_err(|err| ModelError::engine(ENGINE_NAME, err))?;
        Ok(Arc::new(model))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    class_attribute: String,
    labels: Vec<String>,
    class_counts: Vec<usize>,
    features: Vec<FeatureModel>,
    alpha: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FeatureModel {
    name: String,
    likelihood: Likelihood,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Likelihood {
    Gaussian {
        per_class: Vec<Gaussian>,
        pooled: Gaussian,
    },
    Categorical {
        domain: Vec<String>,
        per_class: Vec<IndexMap<String, usize>>,
        totals: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Gaussian {
    count: usize,
    mean: f64,
    variance: f64,
}

impl Gaussian {
    fn fit(values: &[f64], min_variance: f64) -> Self {
        if values.is_empty() {
            return Self {
                count: 0,
                mean: 0.0,
                variance: 1.0,
            };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        Self {
            count: values.len(),
            mean,
            variance: variance.max(min_variance),
        }
    }

    fn log_density(&self, x: f64) -> f64 {
        let density =
            -0.5 * ((x - self.mean).powi(2) / self.variance + (2.0 * PI * self.variance).ln());
        // f64::max drops NaN in favour of the floor.
        density.max(MIN_LOG_DENSITY)
    }
}

impl NaiveBayesModel {
    fn fit(instances: &InstanceSet, alpha: f64, min_variance: f64) -> Result<Self> {
        let class_index = instances.class_index().ok_or_else(|| {
            ModelError::engine(
                ENGINE_NAME,
                format!("'{}' has no class attribute", instances.name()),
            )
        })?;
        let labels = instances.class_labels()?.to_vec();

        let labelled: Vec<(usize, &[Cell])> = instances
            .rows()
            .iter()
            .filter_map(|row| {
                let label = row[class_index].as_label()?;
                let class = labels.iter().position(|known| known == label)?;
                Some((class, row.as_slice()))
            })
            .collect();
        if labelled.is_empty() {
            return Err(ModelError::engine(
                ENGINE_NAME,
                format!("'{}' has no labelled rows to train on", instances.name()),
            ));
        }

        let mut class_counts = vec![0; labels.len()];
        for (class, _) in &labelled {
            class_counts[*class] += 1;
        }

        let features = instances
            .attributes()
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != class_index)
            .map(|(index, attribute)| {
                let likelihood = match &attribute.kind {
                    AttributeKind::Numeric => {
                        fit_gaussian(&labelled, index, labels.len(), min_variance)
                    }
                    AttributeKind::Nominal(values) => {
                        fit_categorical(&labelled, index, labels.len(), values.clone())
                    }
                    AttributeKind::Text => {
                        let observed: BTreeSet<String> = labelled
                            .iter()
                            .filter_map(|(_, row)| row[index].as_label().map(str::to_string))
                            .collect();
                        fit_categorical(&labelled, index, labels.len(), observed.into_iter().collect())
                    }
                };
                FeatureModel {
                    name: attribute.name.clone(),
                    likelihood,
                }
            })
            .collect();

        Ok(Self {
            class_attribute: instances.attributes()[class_index].name.clone(),
            labels,
            class_counts,
            features,
            alpha,
        })
    }

    /// Normalised class posterior for one row.
    fn posterior(&self, instances: &InstanceSet, row: usize) -> Result<Vec<f64>> {
        let cells = instances.rows().get(row).ok_or_else(|| {
            ModelError::engine(
                ENGINE_NAME,
                format!("row {row} is out of range for '{}'", instances.name()),
            )
        })?;

        let total = self.class_counts.iter().sum::<usize>() as f64;
        let classes = self.labels.len() as f64;
        let mut scores: Vec<f64> = self
            .class_counts
            .iter()
            .map(|&count| ((count as f64 + self.alpha) / (total + self.alpha * classes)).ln())
            .collect();

        for feature in &self.features {
            let Some(index) = instances.attribute_index(&feature.name) else {
                continue;
            };
            match (&feature.likelihood, &cells[index]) {
                (_, Cell::Missing) => {}
                (Likelihood::Gaussian { per_class, pooled }, Cell::Number(x)) => {
                    for (score, gaussian) in scores.iter_mut().zip(per_class) {
                        let gaussian = if gaussian.count == 0 { pooled } else { gaussian };
                        *score += gaussian.log_density(*x);
                    }
                }
                (
                    Likelihood::Categorical {
                        domain,
                        per_class,
                        totals,
                    },
                    Cell::Label(value),
                ) => {
                    let buckets = domain.len() as f64 + 1.0;
                    for (class, score) in scores.iter_mut().enumerate() {
                        let seen = per_class[class].get(value).copied().unwrap_or(0) as f64;
                        *score += ((seen + self.alpha)
                            / (totals[class] as f64 + self.alpha * buckets))
                            .ln();
                    }
                }
                (_, cell) => {
                    return Err(ModelError::engine(
                        ENGINE_NAME,
                        format!("attribute '{}' holds unexpected value {cell:?}", feature.name),
                    ));
                }
            }
        }

        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Ok(vec![1.0 / classes; scores.len()]);
        }
        let weights: Vec<f64> = scores.iter().map(|score| (score - max).exp()).collect();
        let sum: f64 = weights.iter().sum();
        Ok(weights.into_iter().map(|weight| weight / sum).collect())
    }
}

fn fit_gaussian(
    labelled: &[(usize, &[Cell])],
    index: usize,
    classes: usize,
    min_variance: f64,
) -> Likelihood {
    let mut by_class = vec![Vec::new(); classes];
    for (class, row) in labelled {
        if let Some(value) = row[index].as_number() {
            by_class[*class].push(value);
        }
    }
    let all: Vec<f64> = by_class.iter().flatten().copied().collect();
    Likelihood::Gaussian {
        per_class: by_class
            .iter()
            .map(|values| Gaussian::fit(values, min_variance))
            .collect(),
        pooled: Gaussian::fit(&all, min_variance),
    }
}

fn fit_categorical(
    labelled: &[(usize, &[Cell])],
    index: usize,
    classes: usize,
    domain: Vec<String>,
) -> Likelihood {
    let mut per_class: Vec<IndexMap<String, usize>> = vec![IndexMap::new(); classes];
    let mut totals = vec![0; classes];
    for (class, row) in labelled {
        if let Some(value) = row[index].as_label() {
            *per_class[*class].entry(value.to_string()).or_insert(0) += 1;
            totals[*class] += 1;
        }
    }
    Likelihood::Categorical {
        domain,
        per_class,
        totals,
    }
}

impl TrainedClassifier for NaiveBayesModel {
    fn engine_name(&self) -> &str {
        ENGINE_NAME
    }

    fn classify(
        &self,
        instances: &InstanceSet,
        row: usize,
        keys: &ReturnKeys,
    ) -> Result<ResultMap> {
        let posterior = self.posterior(instances, row)?;
        let mut best = 0;
        for (class, probability) in posterior.iter().enumerate() {
            if *probability > posterior[best] {
                best = class;
            }
        }

        let mut result = ResultMap::default();
        if keys.contains(ReturnKey::Label) {
            result.label = Some(self.labels[best].clone());
        }
        if keys.contains(ReturnKey::Distributions) {
            result.distributions = Some(self.labels.iter().cloned().zip(posterior).collect());
        }
        Ok(result)
    }

    fn to_blob(&self) -> Result<ClassifierBlob> {
        let bytes = serde_json::to_vec(self).map_err(|err| ModelError::engine(ENGINE_NAME, err))?;
        Ok(ClassifierBlob {
            engine: ENGINE_NAME.to_string(),
            bytes,
        })
    }

    fn describe(&self) -> String {
        let total: usize = self.class_counts.iter().sum();
        let priors = self
            .labels
            .iter()
            .zip(&self.class_counts)
            .map(|(label, count)| format!("{label} {count}/{total}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut lines = vec![
            format!("naive bayes over class '{}'", self.class_attribute),
            format!("class counts: {priors}"),
        ];
        for feature in &self.features {
            match &feature.likelihood {
                Likelihood::Gaussian { per_class, .. } => {
                    lines.push(format!("{}: gaussian", feature.name));
                    for (label, gaussian) in self.labels.iter().zip(per_class) {
                        lines.push(format!(
                            "  {label}: mean {:.4}, variance {:.4}, n {}",
                            gaussian.mean, gaussian.variance, gaussian.count
                        ));
                    }
                }
                Likelihood::Categorical {
                    domain, per_class, ..
                } => {
                    lines.push(format!("{}: categorical over {domain:?}", feature.name));
                    for (label, counts) in self.labels.iter().zip(per_class) {
                        let counts = counts
                            .iter()
                            .map(|(value, count)| format!("{value}={count}"))
                            .collect::<Vec<_>>()
                            .join(" ");
                        lines.push(format!("  {label}: {counts}"));
                    }
                }
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances;
    use crate::model::SetType;
    use crate::model::fixtures;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn toy_set(set: SetType) -> InstanceSet {
        instances::build(
            set.as_str(),
            &fixtures::toy_rows(set),
            &fixtures::toy_metas(),
            &fixtures::toy_class(),
            false,
        )
        .unwrap()
    }

    fn query(features: serde_json::Value) -> InstanceSet {
        instances::build(
            "query",
            &[fixtures::row(features)],
            &fixtures::toy_metas(),
            &fixtures::toy_class(),
            true,
        )
        .unwrap()
    }

    #[test]
    fn huge_numeric_values_keep_a_normalised_posterior() {
        let classifier = NaiveBayesEngine::default().train(&toy_set(SetType::Train)).unwrap();
        let result = classifier
            .classify(&query(json!({"count": 1e200, "flag": true})), 0, &ReturnKeys::default())
            .unwrap();

        let distributions = result.distributions.unwrap();
        assert!(distributions.values().all(|p| p.is_finite()), "{distributions:?}");
        assert_relative_eq!(distributions.values().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert_eq!(result.label.as_deref(), Some("yes"));
    }

    #[test]
    fn separates_the_toy_classes() {
        let classifier = NaiveBayesEngine::default().train(&toy_set(SetType::Train)).unwrap();
        let keys = ReturnKeys::default();

        let yes = classifier.classify(&query(json!({"count": 4, "flag": true})), 0, &keys).unwrap();
        assert_eq!(yes.label.as_deref(), Some("yes"));

        let no = classifier.classify(&query(json!({"count": 0, "flag": false})), 0, &keys).unwrap();
        assert_eq!(no.label.as_deref(), Some("no"));

        let distributions = no.distributions.unwrap();
        assert_eq!(distributions.keys().collect::<Vec<_>>(), vec!["yes", "no"]);
        assert_relative_eq!(distributions.values().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn only_requested_keys_are_filled() {
        let classifier = NaiveBayesEngine::default().train(&toy_set(SetType::Train)).unwrap();
        let result = classifier
            .classify(&query(json!({"count": 3})), 0, &ReturnKeys::label_only())
            .unwrap();
        assert!(result.label.is_some());
        assert!(result.distributions.is_none());
        assert!(result.features.is_none());
    }

    #[test]
    fn all_missing_row_falls_back_to_priors() {
        let classifier = NaiveBayesEngine::default().train(&toy_set(SetType::Train)).unwrap();
        let result = classifier
            .classify(&query(json!({})), 0, &ReturnKeys::default())
            .unwrap();
        let distributions = result.distributions.unwrap();
        assert_relative_eq!(distributions["yes"], 0.5, epsilon = 1e-9);
        assert_relative_eq!(distributions["no"], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn restored_classifier_predicts_the_same() {
        let engine = NaiveBayesEngine::builder().alpha(0.5).build();
        let trained = engine.train(&toy_set(SetType::Train)).unwrap();
        let restored = engine.restore(&trained.to_blob().unwrap()).unwrap();

        let probe = query(json!({"count": 2, "flag": true}));
        let keys = ReturnKeys::default();
        assert_eq!(
            trained.classify(&probe, 0, &keys).unwrap(),
            restored.classify(&probe, 0, &keys).unwrap()
        );
        assert_eq!(trained.describe(), restored.describe());
    }

    #[test]
    fn foreign_blobs_are_rejected() {
        let blob = ClassifierBlob {
            engine: "svm".to_string(),
            bytes: Vec::new(),
        };
        assert!(matches!(
            NaiveBayesEngine::default().restore(&blob),
            Err(ModelError::Engine { .. })
        ));
    }

    #[test]
    fn training_needs_labelled_rows() {
        let unlabelled = instances::build(
            "unlabelled",
            &[fixtures::row(json!({"count": 1}))],
            &fixtures::toy_metas(),
            &fixtures::toy_class(),
            true,
        )
        .unwrap();
        assert!(NaiveBayesEngine::default().train(&unlabelled).is_err());
    }

    #[test]
    fn default_evaluations_cover_every_labelled_row() {
        let engine = NaiveBayesEngine::default();
        let split = engine
            .evaluate_train_test(&toy_set(SetType::Train), &toy_set(SetType::Test))
            .unwrap();
        assert_eq!(split.total, 2);

        let folds = engine.cross_validate(&toy_set(SetType::TrainTest), 3).unwrap();
        assert_eq!(folds.total, 6);
        assert_eq!(folds.correct + folds.incorrect, 6);
    }

    #[test]
    fn cross_validation_needs_two_rows() {
        let engine = NaiveBayesEngine::default();
        let single = toy_set(SetType::Train).subset("single", [0]);
        assert!(engine.cross_validate(&single, 10).is_err());
    }

    #[test]
    fn description_mentions_every_feature() {
        let classifier = NaiveBayesEngine::default().train(&toy_set(SetType::Train)).unwrap();
        let description = classifier.describe();
        assert!(description.contains("class 'label'"));
        assert!(description.contains("count: gaussian"));
        assert!(description.contains("flag: categorical"));
    }
}
