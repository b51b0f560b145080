//! Confusion matrices and summary metrics for classifier runs.

use serde::Deserialize;
use serde::Serialize;

use crate::classifier::TrainedClassifier;
use crate::error::ModelError;
use crate::error::Result;
use crate::instances::InstanceSet;
use crate::model::ReturnKeys;

/// Counts indexed as `counts[actual][predicted]` over an ordered label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    labels: Vec<String>,
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(labels: Vec<String>) -> Self {
        let size = labels.len();
        Self {
            labels,
            counts: vec![vec![0; size]; size],
        }
    }

    pub fn from_labels<P, A>(labels: Vec<String>, predicted: &[P], actual: &[A]) -> Result<Self>
    where
        P: AsRef<str>,
        A: AsRef<str>,
    {
        if predicted.len() != actual.len() {
            return Err(ModelError::SchemaMismatch(format!(
                "{} predictions for {} gold labels",
                predicted.len(),
                actual.len()
            )));
        }
        let mut matrix = Self::new(labels);
        for (predicted, actual) in predicted.iter().zip(actual) {
            matrix.record(actual.as_ref(), predicted.as_ref())?;
        }
        Ok(matrix)
    }

    pub fn record(&mut self, actual: &str, predicted: &str) -> Result<()> {
        let row = self.index_of(actual)?;
        let column = self.index_of(predicted)?;
        self.counts[row][column] += 1;
        Ok(())
    }

    fn index_of(&self, label: &str) -> Result<usize> {
        self.labels
            .iter()
            .position(|known| known == label)
            .ok_or_else(|| ModelError::UnknownLabel {
                label: label.to_string(),
            })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn counts(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn count(&self, actual: &str, predicted: &str) -> Option<usize> {
        let row = self.labels.iter().position(|l| l == actual)?;
        let column = self.labels.iter().position(|l| l == predicted)?;
        Some(self.counts[row][column])
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.labels.len()).map(|i| self.counts[i][i]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    fn actual_total(&self, index: usize) -> usize {
        self.counts[index].iter().sum()
    }

    fn predicted_total(&self, index: usize) -> usize {
        self.counts.iter().map(|row| row[index]).sum()
    }

    pub fn class_metrics(&self) -> Vec<ClassMetrics> {
        self.labels
            .iter()
            .enumerate()
            .map(|(index, label)| {
                let hits = self.counts[index][index];
                let precision = ratio(hits, self.predicted_total(index));
                let recall = ratio(hits, self.actual_total(index));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label: label.clone(),
                    precision,
                    recall,
                    f1,
                    support: self.actual_total(index),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Summary of one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub accuracy: f64,
    pub correct: usize,
    pub incorrect: usize,
    pub total: usize,
    pub confusion: ConfusionMatrix,
    pub classes: Vec<ClassMetrics>,
}

impl Evaluation {
    pub fn from_confusion(confusion: ConfusionMatrix) -> Self {
        let total = confusion.total();
        let correct = confusion.correct();
        Self {
            accuracy: confusion.accuracy(),
            correct,
            incorrect: total - correct,
            total,
            classes: confusion.class_metrics(),
            confusion,
        }
    }

    /// Lines for the metrics section of a model dump.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("accuracy: {:.4}", self.accuracy),
            format!(
                "correct: {} / incorrect: {} / total: {}",
                self.correct, self.incorrect, self.total
            ),
        ];
        for class in &self.classes {
            lines.push(format!(
                "{}: precision {:.4}, recall {:.4}, f1 {:.4}, support {}",
                class.label, class.precision, class.recall, class.f1, class.support
            ));
        }
        lines
    }
}

/// Classify every labelled row of `instances` and tally the outcome.
/// Rows without a gold label are skipped.
pub fn score(classifier: &dyn TrainedClassifier, instances: &InstanceSet) -> Result<Evaluation> {
    let mut confusion = ConfusionMatrix::new(instances.class_labels()?.to_vec());
    tally(classifier, instances, &mut confusion)?;
    Ok(Evaluation::from_confusion(confusion))
}

/// Add the outcome of classifying every labelled row of `instances` to
/// `confusion`.
pub fn tally(
    classifier: &dyn TrainedClassifier,
    instances: &InstanceSet,
    confusion: &mut ConfusionMatrix,
) -> Result<()> {
    let keys = ReturnKeys::label_only();
    for row in 0..instances.len() {
        let Some(actual) = instances.class_value(row) else {
            continue;
        };
        let result = classifier.classify(instances, row, &keys)?;
        let predicted = result
            .label
            .ok_or_else(|| ModelError::engine(classifier.engine_name(), "no label returned"))?;
        confusion.record(actual, &predicted)?;
    }
    Ok(())
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn labels() -> Vec<String> {
        vec!["yes".to_string(), "no".to_string()]
    }

    #[test]
    fn counts_actual_rows_against_predicted_columns() {
        let matrix = ConfusionMatrix::from_labels(
            labels(),
            &["yes", "yes", "no", "no"],
            &["yes", "no", "no", "no"],
        )
        .unwrap();

        assert_eq!(matrix.counts().to_vec(), vec![vec![1, 0], vec![1, 2]]);
        assert_eq!(matrix.count("no", "yes"), Some(1));
        assert_eq!(matrix.total(), 4);
        assert_eq!(matrix.correct(), 3);
        assert_relative_eq!(matrix.accuracy(), 0.75);
    }

    #[test]
    fn unknown_labels_are_rejected() {
        let err = ConfusionMatrix::from_labels(labels(), &["maybe"], &["yes"]).unwrap_err();
        assert!(matches!(err, ModelError::UnknownLabel { ref label } if label == "maybe"));
    }

    #[test]
    fn per_class_metrics_follow_the_matrix() {
        let matrix = ConfusionMatrix::from_labels(
            labels(),
            &["yes", "yes", "no", "no"],
            &["yes", "no", "no", "no"],
        )
        .unwrap();
        let evaluation = Evaluation::from_confusion(matrix);

        assert_eq!(evaluation.incorrect, 1);
        let yes = &evaluation.classes[0];
        assert_relative_eq!(yes.precision, 0.5);
        assert_relative_eq!(yes.recall, 1.0);
        assert_relative_eq!(yes.f1, 2.0 / 3.0);
        let no = &evaluation.classes[1];
        assert_relative_eq!(no.precision, 1.0);
        assert_relative_eq!(no.recall, 2.0 / 3.0);
        assert_eq!(no.support, 3);
    }

    #[test]
    fn empty_matrix_has_zero_accuracy() {
        let evaluation = Evaluation::from_confusion(ConfusionMatrix::new(labels()));
        assert_eq!(evaluation.total, 0);
        assert_relative_eq!(evaluation.accuracy, 0.0);
        assert!(evaluation.summary_lines()[0].starts_with("accuracy: 0.0000"));
    }
}
