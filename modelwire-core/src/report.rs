//! Human readable model dumps and CSV reports written next to a model.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ModelError;
use crate::error::Result;
use crate::evaluation::ConfusionMatrix;
use crate::instances::AttributeKind;
use crate::model::FeatureType;
use crate::persist;
use crate::serving::Model;
use crate::serving::PredictionTable;

/// Trailing header cell of the confusion matrix CSV.
pub const PREDICTS_COLUMN: &str = "predicts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportSection {
    Metrics,
    Attributes,
    Features,
    Classifier,
    Context,
}

impl FromStr for ReportSection {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "metrics" => Ok(Self::Metrics),
            "attributes" => Ok(Self::Attributes),
            "features" => Ok(Self::Features),
            "classifier" => Ok(Self::Classifier),
            "context" => Ok(Self::Context),
            other => Err(anyhow!("unknown report section '{other}'")),
        }
    }
}

/// Which sections a model dump includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSections {
    pub metrics: bool,
    pub attributes: bool,
    pub features: bool,
    pub classifier: bool,
    pub context: bool,
}

impl ReportSections {
    pub fn none() -> Self {
        Self {
            metrics: false,
            attributes: false,
            features: false,
            classifier: false,
            context: false,
        }
    }

    pub fn only(sections: &[ReportSection]) -> Self {
        sections.iter().copied().collect()
    }

    pub fn enabled(&self, section: ReportSection) -> bool {
        match section {
            ReportSection::Metrics => self.metrics,
            ReportSection::Attributes => self.attributes,
            ReportSection::Features => self.features,
            ReportSection::Classifier => self.classifier,
            ReportSection::Context => self.context,
        }
    }
}

impl Default for ReportSections {
    fn default() -> Self {
        Self {
            metrics: true,
            attributes: true,
            features: true,
            classifier: true,
            context: true,
        }
    }
}

impl FromIterator<ReportSection> for ReportSections {
    fn from_iter<T: IntoIterator<Item = ReportSection>>(iter: T) -> Self {
        let mut sections = Self::none();
        for section in iter {
            match section {
                ReportSection::Metrics => sections.metrics = true,
                ReportSection::Attributes => sections.attributes = true,
                ReportSection::Features => sections.features = true,
                ReportSection::Classifier => sections.classifier = true,
                ReportSection::Context => sections.context = true,
            }
        }
        sections
    }
}

pub fn render_model_dump(model: &Model, sections: ReportSections) -> String {
    let artifact = model.artifact();
    let mut out = format!(
        "model: {}\ncreated: {}\nclass attribute: {} {:?}\n",
        artifact.name,
        artifact.created.to_rfc3339(),
        artifact.classify_attrib,
        artifact.class_values
    );

    if sections.metrics {
        out.push_str("\n== metrics ==\n");
        match artifact.performance.as_ref() {
            Some(evaluation) => {
                for line in evaluation.summary_lines() {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            None => out.push_str("(not evaluated)\n"),
        }
    }

    if sections.attributes {
        out.push_str("\n== attributes ==\n");
        match model.template() {
            Some(template) => {
                for (index, attribute) in template.attributes().iter().enumerate() {
                    let kind = match &attribute.kind {
                        AttributeKind::Text => "text".to_string(),
                        AttributeKind::Numeric => "numeric".to_string(),
                        AttributeKind::Nominal(values) => format!("nominal {{{}}}", values.join(", ")),
                    };
                    let marker = if Some(index) == template.class_index() {
                        " (class)"
                    } else {
                        ""
                    };
                    out.push_str(&format!("{}: {kind}{marker}\n", attribute.name));
                }
            }
            None => out.push_str(&format!("{}\n", artifact.attributes.join(", "))),
        }
    }

    if sections.features {
        out.push_str("\n== features ==\n");
        for (name, feature) in &artifact.feature_metadata {
            let kind = match feature {
                FeatureType::String => "string".to_string(),
                FeatureType::Boolean => "boolean".to_string(),
                FeatureType::Numeric => "numeric".to_string(),
                FeatureType::Enum(values) => format!("enum {values:?}"),
            };
            out.push_str(&format!("{name}: {kind}\n"));
        }
    }

    if sections.classifier {
        out.push_str("\n== classifier ==\n");
        match model.classifier() {
            Some(classifier) => {
                out.push_str(&classifier.describe());
                out.push('\n');
            }
            None => out.push_str("(not primed)\n"),
        }
    }

    if sections.context {
        out.push_str("\n== context ==\n");
        match artifact.context.as_ref() {
            Some(context) => {
                let rendered =
                    serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
                out.push_str(&rendered);
                out.push('\n');
            }
            None => out.push_str("(none)\n"),
        }
    }

    out
}

/// Write `<dir>/<name>-model.txt`.
pub fn write_model_dump(dir: &Path, model: &Model, sections: ReportSections) -> Result<PathBuf> {
    persist::ensure_dir(dir)?;
    let path = persist::dump_file(dir, model.name());
    fs::write(&path, render_model_dump(model, sections))
        .map_err(|source| ModelError::io(&path, source))?;
    log::info!("wrote model dump for '{}' to {}", model.name(), path.display());
    Ok(path)
}

/// Write `<dir>/<model>-predictions.csv` with one row per prediction.
pub fn write_predictions(dir: &Path, table: &PredictionTable) -> Result<PathBuf> {
    persist::ensure_dir(dir)?;
    let path = persist::predictions_file(dir, &table.model);
    let mut rows = Vec::with_capacity(table.len() + 1);
    rows.push(table.columns.clone());
    for row in &table.data {
        rows.push(
            table
                .columns
                .iter()
                .map(|column| row.get(column).map(render_cell).unwrap_or_default())
                .collect(),
        );
    }
    write_csv(&path, &rows)?;
    log::info!("wrote {} predictions to {}", table.len(), path.display());
    Ok(path)
}

/// Write `<dir>/<name>-confusion-matrix.csv`: one count column per label
/// plus a trailing column naming the actual class of each row.
pub fn write_confusion_matrix(dir: &Path, name: &str, matrix: &ConfusionMatrix) -> Result<PathBuf> {
    persist::ensure_dir(dir)?;
    let path = persist::confusion_matrix_file(dir, name);
    write_csv(&path, &confusion_matrix_rows(matrix))?;
    log::info!("wrote confusion matrix for '{name}' to {}", path.display());
    Ok(path)
}

pub fn confusion_matrix_rows(matrix: &ConfusionMatrix) -> Vec<Vec<String>> {
    let mut header = matrix.labels().to_vec();
    header.push(PREDICTS_COLUMN.to_string());

    let mut rows = vec![header];
    for (label, counts) in matrix.labels().iter().zip(matrix.counts()) {
        let mut row: Vec<String> = counts.iter().map(ToString::to_string).collect();
        row.push(label.clone());
        rows.push(row);
    }
    rows
}

fn write_csv(path: &Path, rows: &[Vec<String>]) -> Result<()> {
    let csv_error = |source| ModelError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    for row in rows {
        writer.write_record(row).map_err(csv_error)?;
    }
    writer.flush().map_err(|source| ModelError::io(path, source))
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
