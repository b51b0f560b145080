//! On-disk settings: XDG paths, layered TOML/environment configuration and
//! the declarative model definitions the CLI trains and serves.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use config::Config as ConfigLoader;
use config::Environment;
use config::File;
use config::FileFormat;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::dataset;
use crate::model::ClassFeatureMeta;
use crate::model::FeatureMap;
use crate::model::FeatureMetas;
use crate::model::ModelConfig;
use crate::model::ReturnKey;
use crate::model::ReturnKeys;
use crate::model::SetType;
use crate::model::feature_map_from_value;
use crate::report::ReportSection;
use crate::report::ReportSections;
use crate::training::DEFAULT_FOLDS;

/// Written to disk the first time the tool runs.
pub const DEFAULT_SETTINGS_TEMPLATE: &str = include_str!("../templates/config.toml");

/// Datasets of the sample model in the default settings, relative to the
/// config directory.
const SAMPLE_DATASETS: [(&str, &str); 2] = [
    (
        "datasets/weather/train.jsonl",
        include_str!("../templates/weather/train.jsonl"),
    ),
    (
        "datasets/weather/test.jsonl",
        include_str!("../templates/weather/test.jsonl"),
    ),
];

#[derive(Debug, Clone)]
pub struct SettingsBundle {
    pub settings: AppSettings,
    pub paths: AppPaths,
}

/// Resolve and load the settings for `app_name`, creating the config file
/// from [`DEFAULT_SETTINGS_TEMPLATE`] when it does not exist yet.
///
/// Environment variables prefixed with the upper-cased app name override
/// file values, with `__` separating nested keys.
pub fn load_or_initialize_settings(app_name: impl AsRef<str>) -> Result<SettingsBundle> {
    let app_name = app_name.as_ref();
    let mut paths = AppPaths::discover(app_name)?;
    paths.ensure_config_dir()?;

    if !paths.config_file.exists() {
        fs::write(&paths.config_file, DEFAULT_SETTINGS_TEMPLATE).with_context(|| {
            format!(
                "failed to write default settings to {}",
                paths.config_file.display()
            )
        })?;
        log::info!("created default settings at {}", paths.config_file.display());
        write_sample_datasets(&paths.config_dir)?;
    }

    let builder = ConfigLoader::builder()
        .add_source(File::from(paths.config_file.clone()))
        .add_source(
            Environment::with_prefix(&env_prefix(app_name))
                .separator("__")
                .try_parsing(true),
        );

    let mut settings: AppSettings = builder
        .build()
        .with_context(|| {
            format!(
                "failed to parse settings at {}",
                paths.config_file.display()
            )
        })?
        .try_deserialize()
        .context("failed to deserialize settings")?;

    paths = paths.apply_storage_overrides(&settings.storage)?;
    paths.ensure_runtime_dirs()?;

    settings.normalize()?;

    Ok(SettingsBundle { settings, paths })
}

fn write_sample_datasets(config_dir: &Path) -> Result<()> {
    for (relative, rows) in SAMPLE_DATASETS {
        let path = config_dir.join(relative);
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dataset directory {}", parent.display()))?;
        }
        fs::write(&path, rows)
            .with_context(|| format!("failed to write sample dataset {}", path.display()))?;
    }
    Ok(())
}

/// Parse settings from TOML text without touching the filesystem or the
/// environment.
pub fn parse_settings(toml: &str) -> Result<AppSettings> {
    let mut settings: AppSettings = ConfigLoader::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()
        .context("failed to parse settings")?
        .try_deserialize()
        .context("failed to deserialize settings")?;
    settings.normalize()?;
    Ok(settings)
}

fn env_prefix(app_name: &str) -> String {
    app_name
        .chars()
        .map(|ch| if ch == '-' { '_' } else { ch })
        .collect::<String>()
        .to_ascii_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub app_name: String,
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Where `<name>-classifier.dat` files live.
    pub model_dir: PathBuf,
    /// Where dumps, predictions and confusion matrices are written.
    pub report_dir: PathBuf,
}

impl AppPaths {
    /// Per-app directories under the XDG base directories. Unset or empty
    /// variables fall back to the usual locations under `$HOME`, and the
    /// cache lives in the state directory unless `XDG_CACHE_HOME` is set.
    pub fn discover(app_name: impl Into<String>) -> Result<Self> {
        let app_name = app_name.into();
        let home = home_dir().context("unable to determine home directory for XDG resolution")?;
        let base = |var: &str, fallback: &str| env_dir(var).unwrap_or_else(|| home.join(fallback));

        let config_dir = base("XDG_CONFIG_HOME", ".config").join(&app_name);
        let data_dir = base("XDG_DATA_HOME", ".local/share").join(&app_name);
        let state_root = base("XDG_STATE_HOME", ".local/state");
        let cache_dir = env_dir("XDG_CACHE_HOME")
            .unwrap_or_else(|| state_root.join("cache"))
            .join(&app_name);
        let state_dir = state_root.join(&app_name);

        Ok(Self {
            config_file: config_dir.join("config.toml"),
            model_dir: data_dir.join("models"),
            report_dir: state_dir.join("reports"),
            app_name,
            config_dir,
            data_dir,
            state_dir,
            cache_dir,
        })
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.config_dir).with_context(|| {
            format!(
                "failed to create config directory {}",
                self.config_dir.display()
            )
        })
    }

    pub fn ensure_runtime_dirs(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.state_dir,
            &self.cache_dir,
            &self.model_dir,
            &self.report_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create runtime directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Apply `[storage]` overrides. Directories derived from the data and
    /// state roots follow those roots unless overridden themselves.
    pub fn apply_storage_overrides(&self, storage: &StorageSettings) -> Result<Self> {
        let pick = |value: &Option<String>, fallback: PathBuf| match value {
            Some(value) => resolve_path_value(value, &self.config_dir),
            None => Ok(fallback),
        };

        let data_dir = pick(&storage.data_dir, self.data_dir.clone())?;
        let state_dir = pick(&storage.state_dir, self.state_dir.clone())?;
        Ok(Self {
            cache_dir: pick(&storage.cache_dir, state_dir.join("cache"))?,
            model_dir: pick(&storage.model_dir, data_dir.join("models"))?,
            report_dir: pick(&storage.report_dir, state_dir.join("reports"))?,
            data_dir,
            state_dir,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub defaults: ModelSettings,
    pub models: HashMap<String, ModelDefinition>,
}

impl AppSettings {
    /// Reject model definitions that could never produce a valid schema.
    pub fn normalize(&mut self) -> Result<()> {
        for (name, definition) in &self.models {
            if definition.class.key.trim().is_empty() {
                bail!("model '{name}' must name its class attribute");
            }
            if definition.class.values.is_empty() {
                bail!("model '{name}' must list at least one class value");
            }
            if definition.features.is_empty() {
                bail!("model '{name}' must declare at least one feature");
            }
            if definition.features.contains_key(&definition.class.key) {
                bail!(
                    "model '{name}' declares its class attribute '{}' as a feature",
                    definition.class.key
                );
            }
            if definition.settings.folds == Some(1) || definition.settings.folds == Some(0) {
                bail!("model '{name}' needs at least two cross validation folds");
            }
        }
        if matches!(self.defaults.folds, Some(0) | Some(1)) {
            bail!("cross validation needs at least two folds");
        }
        Ok(())
    }

    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn resolve_model(&self, name: &str, paths: &AppPaths) -> Result<ResolvedModel> {
        let definition = self.models.get(name).ok_or_else(|| {
            anyhow!(
                "model '{name}' is not configured (known models: {})",
                self.model_names().join(", ")
            )
        })?;
        let settings = merge_model_settings(&self.defaults, Some(&definition.settings));

        let resolve = |value: &Option<String>| {
            value
                .as_deref()
                .map(|value| resolve_path_value(value, &paths.config_dir))
                .transpose()
        };

        Ok(ResolvedModel {
            name: name.to_string(),
            description: definition.description.clone(),
            features: definition.features.clone(),
            class: definition.class.clone(),
            datasets: DatasetPaths {
                train: resolve(&definition.train)?,
                test: resolve(&definition.test)?,
                data: resolve(&definition.data)?,
            },
            feature_sets: definition.feature_sets.clone(),
            return_keys: settings
                .return_keys
                .map(ReturnKeys::new)
                .unwrap_or_default(),
            folds: settings.folds.unwrap_or(DEFAULT_FOLDS),
            report: settings
                .report
                .map(ReportSections::from_iter)
                .unwrap_or_default(),
            display_features: settings.display_features,
            model_dir: paths.model_dir.clone(),
            report_dir: paths.report_dir.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub model_dir: Option<String>,
    pub report_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
}

/// Per-model knobs. Every field is optional so a model only overrides what
/// differs from `[defaults]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub return_keys: Option<Vec<ReturnKey>>,
    pub folds: Option<usize>,
    pub report: Option<Vec<ReportSection>>,
    pub display_features: Option<Vec<String>>,
}

fn merge_model_settings(base: &ModelSettings, overrides: Option<&ModelSettings>) -> ModelSettings {
    let mut merged = base.clone();

    if let Some(overrides) = overrides {
        if overrides.return_keys.is_some() {
            merged.return_keys = overrides.return_keys.clone();
        }
        if overrides.folds.is_some() {
            merged.folds = overrides.folds;
        }
        if overrides.report.is_some() {
            merged.report = overrides.report.clone();
        }
        if overrides.display_features.is_some() {
            merged.display_features = overrides.display_features.clone();
        }
    }

    merged
}

/// A model whose features are read verbatim from JSON datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub description: Option<String>,
    pub features: FeatureMetas,
    pub class: ClassFeatureMeta,
    #[serde(default)]
    pub train: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    /// Combined corpus; when unset the train-test set is train then test.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub feature_sets: IndexMap<String, Vec<Vec<String>>>,
    #[serde(default)]
    pub settings: ModelSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatasetPaths {
    pub train: Option<PathBuf>,
    pub test: Option<PathBuf>,
    pub data: Option<PathBuf>,
}

impl DatasetPaths {
    pub fn load(&self, set: SetType) -> Result<Vec<FeatureMap>> {
        match set {
            SetType::Train => load_required(self.train.as_deref(), set),
            SetType::Test => load_required(self.test.as_deref(), set),
            SetType::TrainTest => match self.data.as_deref() {
                Some(path) => dataset::load_feature_maps(path),
                None => {
                    let mut rows = self.load(SetType::Train)?;
                    rows.extend(self.load(SetType::Test)?);
                    Ok(rows)
                }
            },
        }
    }
}

fn load_required(path: Option<&Path>, set: SetType) -> Result<Vec<FeatureMap>> {
    let path = path.ok_or_else(|| anyhow!("no {set} dataset is configured"))?;
    let rows = dataset::load_feature_maps(path)?;
    log::debug!("loaded {} {set} rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// A model definition merged with the defaults, paths resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub name: String,
    pub description: Option<String>,
    pub features: FeatureMetas,
    pub class: ClassFeatureMeta,
    pub datasets: DatasetPaths,
    pub feature_sets: IndexMap<String, Vec<Vec<String>>>,
    pub return_keys: ReturnKeys,
    pub folds: usize,
    pub report: ReportSections,
    pub display_features: Option<Vec<String>>,
    pub model_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl ResolvedModel {
    pub fn model_file(&self) -> PathBuf {
        crate::persist::model_file(&self.model_dir, &self.name)
    }

    /// Build the runtime configuration. Bulk feature sets come from the
    /// configured datasets and ad hoc inputs must each be one JSON object
    /// already holding the feature values.
    pub fn to_model_config(&self) -> Result<Arc<ModelConfig>> {
        let datasets = self.datasets.clone();
        let mut builder = ModelConfig::builder(self.name.clone())
            .create_feature_sets(move |set| datasets.load(set))
            .create_features(|inputs, _| match inputs {
                [single] => feature_map_from_value(single),
                other => bail!("expected one JSON object per input, got {} values", other.len()),
            })
            .static_feature_metas(self.features.clone())
            .class_feature(self.class.clone())
            .return_keys(self.return_keys.clone())
            .with_caches();

        for (group, combos) in &self.feature_sets {
            builder = builder.feature_set_group(group.clone(), combos.clone());
        }
        if let Some(display) = self.display_features.clone() {
            builder = builder.display_features(display);
        }

        Ok(Arc::new(builder.build()?))
    }
}

fn env_dir(var: &str) -> Option<PathBuf> {
    env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Expand `~` and environment variables, then resolve relative paths
/// against `base_dir`.
pub fn resolve_path_value(value: &str, base_dir: &Path) -> Result<PathBuf> {
    let path = PathBuf::from(expand_path(value)?);
    if path.is_absolute() {
        Ok(path.components().collect())
    } else {
        Ok(base_dir.join(path))
    }
}

fn expand_path(value: &str) -> Result<String> {
    let home = home_dir().and_then(|path| path.to_str().map(str::to_string));
    shellexpand::full_with_context(value, || home.as_deref(), lookup_var)
        .map(|expanded| expanded.into_owned())
        .map_err(|error| anyhow!("failed to expand '{value}': {error}"))
}

fn lookup_var(name: &str) -> std::result::Result<Option<String>, env::VarError> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(error) => Err(error),
    }
}

fn home_dir() -> Option<PathBuf> {
    env_dir("HOME").or_else(|| env_dir("USERPROFILE"))
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::MutexGuard;
    use std::sync::OnceLock;

    pub fn set_env_path(var: &str, value: &Path) {
        // Mutating the process environment is unsafe since Rust 1.88; callers
        // hold `lock()` for the duration of the test.
        unsafe { env::set_var(var, value) };
    }

    pub fn remove_env(var: &str) {
        unsafe { env::remove_var(var) };
    }

    pub fn lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Point every XDG base directory into `root`.
    pub fn isolate_xdg(root: &Path) {
        set_env_path("XDG_CONFIG_HOME", &root.join("config"));
        set_env_path("XDG_DATA_HOME", &root.join("data"));
        set_env_path("XDG_STATE_HOME", &root.join("state"));
        remove_env("XDG_CACHE_HOME");
    }
}
