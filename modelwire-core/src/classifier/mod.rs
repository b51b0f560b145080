//! Boundary to the classifier training engine.
//!
//! The pipeline never looks inside a trained classifier: it only asks an
//! engine to train or restore one, and asks the classifier to label rows and
//! serialize itself into an opaque [`ClassifierBlob`].

pub mod naive_bayes;

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ModelError;
use crate::error::Result;
use crate::evaluation;
use crate::evaluation::ConfusionMatrix;
use crate::evaluation::Evaluation;
use crate::instances::InstanceSet;
use crate::model::ReturnKeys;
use crate::serving::ResultMap;

pub use naive_bayes::NaiveBayesEngine;

/// Serialized classifier, tagged with the engine able to restore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierBlob {
    pub engine: String,
    pub bytes: Vec<u8>,
}

pub trait TrainedClassifier: Send + Sync + fmt::Debug {
    fn engine_name(&self) -> &str;

    /// Classify row `row` of `instances`, filling only the requested keys.
    /// Feature echoing is left to the caller.
    fn classify(&self, instances: &InstanceSet, row: usize, keys: &ReturnKeys)
    -> Result<ResultMap>;

    fn to_blob(&self) -> Result<ClassifierBlob>;

    /// Human readable description for model dumps.
    fn describe(&self) -> String;
}

pub trait ClassifierEngine: Send + Sync {
    fn name(&self) -> &str;

    fn train(&self, instances: &InstanceSet) -> Result<Arc<dyn TrainedClassifier>>;

    fn restore(&self, blob: &ClassifierBlob) -> Result<Arc<dyn TrainedClassifier>>;

    fn evaluate_train_test(&self, train: &InstanceSet, test: &InstanceSet) -> Result<Evaluation> {
        let classifier = self.train(train)?;
        evaluation::score(classifier.as_ref(), test)
    }

    /// K-fold cross validation. Row `i` is tested in fold `i % folds`.
    fn cross_validate(&self, instances: &InstanceSet, folds: usize) -> Result<Evaluation> {
        let folds = folds.min(instances.len());
        if folds < 2 {
            return Err(ModelError::engine(
                self.name(),
                format!(
                    "cross validation needs at least two folds, '{}' allows {folds}",
                    instances.name()
                ),
            ));
        }

        let mut confusion = ConfusionMatrix::new(instances.class_labels()?.to_vec());
        for fold in 0..folds {
            let train = instances.subset(
                format!("{}-fold-{fold}-train", instances.name()),
                (0..instances.len()).filter(|row| row % folds != fold),
            );
            let test = instances.subset(
                format!("{}-fold-{fold}-test", instances.name()),
                (0..instances.len()).filter(|row| row % folds == fold),
            );
            let classifier = self.train(&train)?;
            evaluation::tally(classifier.as_ref(), &test, &mut confusion)?;
            log::debug!("finished fold {}/{folds} of '{}'", fold + 1, instances.name());
        }

        Ok(Evaluation::from_confusion(confusion))
    }
}
