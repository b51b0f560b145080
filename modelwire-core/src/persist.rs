//! Persisted model artifacts and the file names derived from a model name.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use bon::Builder;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::classifier::ClassifierBlob;
use crate::error::ModelError;
use crate::error::Result;
use crate::evaluation::Evaluation;
use crate::instances;
use crate::instances::InstanceSet;
use crate::model::ClassFeatureMeta;
use crate::model::Context;
use crate::model::FeatureMap;
use crate::model::FeatureMetas;
use crate::model::ModelConfig;
use crate::scope;

pub const CLASSIFIER_SUFFIX: &str = "-classifier.dat";
pub const DUMP_SUFFIX: &str = "-model.txt";
pub const PREDICTIONS_SUFFIX: &str = "-predictions.csv";
pub const CONFUSION_MATRIX_SUFFIX: &str = "-confusion-matrix.csv";

/// Everything needed to rebuild a serving model: the opaque classifier, the
/// instance schema it was fitted on and the training context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct ModelArtifact {
    #[builder(into)]
    pub name: String,
    pub classifier: Option<ClassifierBlob>,
    /// Attribute names in fitting order, class attribute included.
    #[builder(default)]
    pub attributes: Vec<String>,
    #[builder(into)]
    pub classify_attrib: String,
    #[builder(default)]
    pub class_values: Vec<String>,
    #[builder(default)]
    pub feature_metadata: FeatureMetas,
    pub context: Option<Context>,
    pub performance: Option<Evaluation>,
    #[builder(default = Utc::now())]
    pub created: DateTime<Utc>,
}

impl ModelArtifact {
    /// Stand-in for a model that has not been trained yet.
    pub fn placeholder(config: &ModelConfig) -> Self {
        let class_meta = config.class_feature_meta();
        Self::builder()
            .name(config.name())
            .classify_attrib(class_meta.key)
            .class_values(class_meta.values)
            .build()
    }

    pub fn is_placeholder(&self) -> bool {
        self.classifier.is_none()
    }

    /// One row with every attribute unset, laid out exactly like the
    /// instances the classifier was fitted on.
    pub fn instance_template(&self) -> Result<InstanceSet> {
        let ordered = self
            .attributes
            .iter()
            .filter(|name| **name != self.classify_attrib)
            .map(|name| {
                self.feature_metadata
                    .get(name)
                    .map(|feature| (name.clone(), feature.clone()))
                    .ok_or_else(|| {
                        ModelError::SchemaMismatch(format!(
                            "attribute '{name}' of model '{}' has no feature metadata",
                            self.name
                        ))
                    })
            })
            .collect::<Result<FeatureMetas>>()?;
        let class_meta = ClassFeatureMeta {
            key: self.classify_attrib.clone(),
            values: self.class_values.clone(),
        };

        let blank = [FeatureMap::new()];
        let template = instances::build(&self.name, &blank, &ordered, &class_meta, true)?;
        if template.attribute_names() != self.attributes {
            return Err(ModelError::SchemaMismatch(format!(
                "model '{}' lists attributes {:?} but its template has {:?}",
                self.name,
                self.attributes,
                template.attribute_names()
            )));
        }
        Ok(template)
    }
}

pub fn model_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{CLASSIFIER_SUFFIX}"))
}

pub fn dump_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{DUMP_SUFFIX}"))
}

pub fn predictions_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{PREDICTIONS_SUFFIX}"))
}

pub fn confusion_matrix_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{CONFUSION_MATRIX_SUFFIX}"))
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| ModelError::io(dir, source))
}

/// Write `artifact` to `<dir>/<name>-classifier.dat`.
pub fn write_model(dir: &Path, artifact: &ModelArtifact) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let path = model_file(dir, &artifact.name);
    let bytes = serde_json::to_vec_pretty(artifact).map_err(|source| ModelError::Serialization {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, bytes).map_err(|source| ModelError::io(&path, source))?;
    log::info!("wrote model '{}' to {}", artifact.name, path.display());
    Ok(path)
}

/// Read a persisted artifact and thaw its context.
///
/// A missing file fails with [`ModelError::ModelNotFound`] when
/// `fail_if_not_exists` is set, otherwise a placeholder is returned.
pub fn read_model(
    config: &Arc<ModelConfig>,
    path: &Path,
    fail_if_not_exists: bool,
) -> Result<ModelArtifact> {
    if !path.exists() {
        if fail_if_not_exists {
            return Err(ModelError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        log::debug!(
            "no model file at {}, using a placeholder for '{}'",
            path.display(),
            config.name()
        );
        return Ok(ModelArtifact::placeholder(config));
    }

    let bytes = fs::read(path).map_err(|source| ModelError::io(path, source))?;
    let mut artifact: ModelArtifact =
        serde_json::from_slice(&bytes).map_err(|source| ModelError::Serialization {
            path: path.to_path_buf(),
            source,
        })?;

    match artifact.context.take() {
        Some(context) if is_empty_context(&context) => artifact.context = Some(context),
        Some(context) => {
            let thawed = scope::with_config(Arc::clone(config), || config.thaw_context(context))?;
            artifact.context = Some(thawed);
        }
        None if config.has_thaw() => log::warn!(
            "model '{}' has a thaw hook but {} carries no context",
            config.name(),
            path.display()
        ),
        None => {}
    }

    log::info!("read model '{}' from {}", artifact.name, path.display());
    Ok(artifact)
}

fn is_empty_context(context: &Context) -> bool {
    match context {
        Context::Null => true,
        Context::Object(map) => map.is_empty(),
        Context::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureType;
    use crate::model::fixtures;
    use serde_json::json;
    use tempfile::TempDir;

    fn trained_artifact() -> ModelArtifact {
        ModelArtifact::builder()
            .name("toy")
            .classifier(ClassifierBlob {
                engine: "naive-bayes".to_string(),
                bytes: b"{}".to_vec(),
            })
            .attributes(vec!["count".into(), "flag".into(), "label".into()])
            .classify_attrib("label")
            .class_values(vec!["yes".into(), "no".into()])
            .feature_metadata(fixtures::toy_metas())
            .context(json!({"vocabulary": ["a", "b"]}))
            .build()
    }

    #[test]
    fn derived_file_names() {
        let dir = Path::new("/models");
        assert_eq!(model_file(dir, "toy"), Path::new("/models/toy-classifier.dat"));
        assert_eq!(dump_file(dir, "toy"), Path::new("/models/toy-model.txt"));
        assert_eq!(predictions_file(dir, "toy"), Path::new("/models/toy-predictions.csv"));
        assert_eq!(
            confusion_matrix_file(dir, "toy"),
            Path::new("/models/toy-confusion-matrix.csv")
        );
    }

    #[test]
    fn missing_file_fails_fast_or_yields_placeholder() {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(fixtures::toy_config("toy"));
        let path = model_file(tmp.path(), "toy");

        assert!(matches!(
            read_model(&config, &path, true),
            Err(ModelError::ModelNotFound { .. })
        ));

        let placeholder = read_model(&config, &path, false).unwrap();
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.classify_attrib, "label");
        assert_eq!(placeholder.context, None);
    }

    #[test]
    fn thaw_hook_rewrites_the_persisted_context() {
        let tmp = TempDir::new().unwrap();
        let path = write_model(tmp.path(), &trained_artifact()).unwrap();
        let config = Arc::new(
            fixtures::toy_builder("toy")
                .thaw(|context: Context| {
                    let active = scope::current_config()?;
                    Ok::<_, anyhow::Error>(json!({"thawed_by": active.name(), "inner": context}))
                })
                .build()
                .unwrap(),
        );

        let artifact = read_model(&config, &path, true).unwrap();
        assert_eq!(
            artifact.context,
            Some(json!({"thawed_by": "toy", "inner": {"vocabulary": ["a", "b"]}}))
        );
    }

    #[test]
    fn round_trip_without_thaw_keeps_the_schema() {
        let tmp = TempDir::new().unwrap();
        let artifact = trained_artifact();
        let path = write_model(tmp.path(), &artifact).unwrap();
        let config = Arc::new(fixtures::toy_config("toy"));

        let read = read_model(&config, &path, true).unwrap();
        assert_eq!(read.attributes, artifact.attributes);
        assert_eq!(read.classify_attrib, artifact.classify_attrib);
        assert_eq!(read.feature_metadata, artifact.feature_metadata);
        assert_eq!(read.class_values, artifact.class_values);
        assert_eq!(read.context, artifact.context);
    }

    #[test]
    fn empty_contexts_are_not_thawed() {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(
            fixtures::toy_builder("toy")
                .thaw(|_: Context| Ok::<_, anyhow::Error>(json!({"thawed": true})))
                .build()
                .unwrap(),
        );

        for empty in [json!({}), json!([])] {
            let mut artifact = trained_artifact();
            artifact.context = Some(empty.clone());
            let path = write_model(tmp.path(), &artifact).unwrap();
            assert_eq!(read_model(&config, &path, true).unwrap().context, Some(empty));
        }
    }

    #[test]
    fn corrupt_files_report_their_path() {
        let tmp = TempDir::new().unwrap();
        let path = model_file(tmp.path(), "toy");
        fs::write(&path, "not json").unwrap();
        let config = Arc::new(fixtures::toy_config("toy"));

        match read_model(&config, &path, true) {
            Err(ModelError::Serialization { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn template_follows_persisted_attribute_order() {
        let mut artifact = trained_artifact();
        artifact.attributes = vec!["flag".into(), "count".into(), "label".into()];

        let template = artifact.instance_template().unwrap();
        assert_eq!(template.attribute_names(), vec!["flag", "count", "label"]);
        assert_eq!(template.class_index(), Some(2));
        assert_eq!(template.len(), 1);
        assert!(template.rows()[0].iter().all(|cell| cell.is_missing()));
    }

    #[test]
    fn template_requires_metadata_for_every_attribute() {
        let mut artifact = trained_artifact();
        artifact.feature_metadata.shift_remove("flag");
        assert!(matches!(
            artifact.instance_template(),
            Err(ModelError::SchemaMismatch(_))
        ));

        let mut reordered = trained_artifact();
        reordered.attributes = vec!["label".into(), "count".into(), "flag".into()];
        reordered
            .feature_metadata
            .insert("extra".into(), FeatureType::Numeric);
        assert!(reordered.instance_template().is_err());
    }
}
