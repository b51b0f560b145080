//! Model descriptions: feature metadata, return keys and the immutable
//! [`ModelConfig`] every pipeline stage is driven by.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::cache::CacheCell;
use crate::cache::InstanceCell;
use crate::cache::TrainTestCell;
use crate::error::ModelError;
use crate::error::Result;
use crate::serving::ResultMap;

/// Shared statistics computed once from the training corpus.
pub type Context = Value;

/// One instance worth of raw feature values keyed by feature name.
pub type FeatureMap = IndexMap<String, Value>;

/// Ordered feature name to type mapping. Order defines attribute order.
pub type FeatureMetas = IndexMap<String, FeatureType>;

pub type CreateFeatureSetsFn = Arc<dyn Fn(SetType) -> anyhow::Result<Vec<FeatureMap>> + Send + Sync>;
pub type CreateFeaturesFn =
    Arc<dyn Fn(&[Value], Option<&Context>) -> anyhow::Result<FeatureMap> + Send + Sync>;
pub type FeatureMetasFn = Arc<dyn Fn(Option<&Context>) -> anyhow::Result<FeatureMetas> + Send + Sync>;
pub type ClassFeatureMetaFn = Arc<dyn Fn() -> ClassFeatureMeta + Send + Sync>;
pub type ContextFn = Arc<dyn Fn() -> anyhow::Result<Context> + Send + Sync>;
pub type ResultTransformFn = Arc<dyn Fn(ResultMap) -> anyhow::Result<ResultMap> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureType {
    String,
    Boolean,
    Numeric,
    Enum(Vec<String>),
}

/// The class attribute: its key in feature maps and its ordered label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassFeatureMeta {
    pub key: String,
    pub values: Vec<String>,
}

impl ClassFeatureMeta {
    pub fn new<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Which slice of the corpus a bulk feature set request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetType {
    Train,
    Test,
    TrainTest,
}

impl SetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
            Self::TrainTest => "train-test",
        }
    }
}

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            "train-test" | "train_test" | "traintest" => Ok(Self::TrainTest),
            other => Err(anyhow!("unknown set type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReturnKey {
    Label,
    Distributions,
    Features,
}

/// The keys a classification result should carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnKeys(BTreeSet<ReturnKey>);

impl ReturnKeys {
    pub fn new(keys: impl IntoIterator<Item = ReturnKey>) -> Self {
        Self(keys.into_iter().collect())
    }

    pub fn label_only() -> Self {
        Self::new([ReturnKey::Label])
    }

    pub fn all() -> Self {
        Self::new([ReturnKey::Label, ReturnKey::Distributions, ReturnKey::Features])
    }

    pub fn contains(&self, key: ReturnKey) -> bool {
        self.0.contains(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = ReturnKey> + '_ {
        self.0.iter().copied()
    }
}

impl Default for ReturnKeys {
    fn default() -> Self {
        Self::new([ReturnKey::Label, ReturnKey::Distributions])
    }
}

impl FromIterator<ReturnKey> for ReturnKeys {
    fn from_iter<T: IntoIterator<Item = ReturnKey>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Post-reload transformation of a persisted context.
pub trait ContextThaw: Send + Sync {
    fn thaw(&self, context: Context) -> anyhow::Result<Context>;
}

impl<F> ContextThaw for F
where
    F: Fn(Context) -> anyhow::Result<Context> + Send + Sync,
{
    fn thaw(&self, context: Context) -> anyhow::Result<Context> {
        self(context)
    }
}

/// Interpret a single JSON input as a feature map.
pub fn feature_map_from_value(value: &Value) -> anyhow::Result<FeatureMap> {
    match value {
        Value::Object(object) => Ok(object
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()),
        other => Err(anyhow!("expected a JSON object of features, got {other}")),
    }
}

/// Immutable description of one model. Built once, shared as `Arc`.
pub struct ModelConfig {
    name: String,
    create_feature_sets: Option<CreateFeatureSetsFn>,
    create_features: Option<CreateFeaturesFn>,
    feature_metas: FeatureMetasFn,
    class_feature_meta: ClassFeatureMetaFn,
    context_fn: Option<ContextFn>,
    thaw: Option<Arc<dyn ContextThaw>>,
    return_keys: ReturnKeys,
    cross_fold_cache: Option<Arc<InstanceCell>>,
    train_test_cache: Option<Arc<TrainTestCell>>,
    feature_sets_set: IndexMap<String, Vec<Vec<String>>>,
    display_features: Option<Vec<String>>,
    result_transform: Option<ResultTransformFn>,
    context: CacheCell<Context>,
}

impl ModelConfig {
    pub fn builder(name: impl Into<String>) -> ModelConfigBuilder {
        ModelConfigBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_keys(&self) -> &ReturnKeys {
        &self.return_keys
    }

    pub fn cross_fold_cache(&self) -> Option<&Arc<InstanceCell>> {
        self.cross_fold_cache.as_ref()
    }

    pub fn train_test_cache(&self) -> Option<&Arc<TrainTestCell>> {
        self.train_test_cache.as_ref()
    }

    pub fn has_context_fn(&self) -> bool {
        self.context_fn.is_some()
    }

    pub fn has_thaw(&self) -> bool {
        self.thaw.is_some()
    }

    pub fn feature_sets_set(&self) -> &IndexMap<String, Vec<Vec<String>>> {
        &self.feature_sets_set
    }

    pub fn feature_sets(&self, set: SetType) -> Result<Vec<FeatureMap>> {
        let generator =
            self.create_feature_sets
                .as_ref()
                .ok_or_else(|| ModelError::NoFeatureSetGenerator {
                    model: self.name.clone(),
                })?;
        log::debug!("generating {set} feature sets for model '{}'", self.name);
        generator(set).map_err(|err| ModelError::callback("feature set", err))
    }

    pub fn features(&self, inputs: &[Value], context: Option<&Context>) -> Result<FeatureMap> {
        let generator =
            self.create_features
                .as_ref()
                .ok_or_else(|| ModelError::NoFeatureGenerator {
                    model: self.name.clone(),
                })?;
        generator(inputs, context).map_err(|err| ModelError::callback("feature", err))
    }

    pub fn feature_metas(&self, context: Option<&Context>) -> Result<FeatureMetas> {
        (self.feature_metas)(context).map_err(|err| ModelError::callback("feature metadata", err))
    }

    pub fn class_feature_meta(&self) -> ClassFeatureMeta {
        (self.class_feature_meta)()
    }

    /// The training context, computed on first use and memoized.
    pub fn training_context(&self) -> Result<Option<Context>> {
        let Some(context_fn) = self.context_fn.as_ref() else {
            return Ok(None);
        };
        let context = self.context.get_or_try_fill(|| {
            log::debug!("computing training context for model '{}'", self.name);
            context_fn().map_err(|err| ModelError::callback("context", err))
        })?;
        Ok(Some(Context::clone(&context)))
    }

    pub fn thaw_context(&self, context: Context) -> Result<Context> {
        match self.thaw.as_ref() {
            Some(thaw) => thaw
                .thaw(context)
                .map_err(|err| ModelError::callback("context thaw", err)),
            None => Ok(context),
        }
    }

    pub fn transform_result(&self, result: ResultMap) -> Result<ResultMap> {
        match self.result_transform.as_ref() {
            Some(transform) => {
                transform(result).map_err(|err| ModelError::callback("result transform", err))
            }
            None => Ok(result),
        }
    }

    /// Feature keys shown next to predictions. Defaults to every feature in
    /// `metas` other than the class attribute.
    pub fn display_features(&self, metas: &FeatureMetas) -> Vec<String> {
        if let Some(keys) = self.display_features.as_ref() {
            return keys.clone();
        }
        let class_key = self.class_feature_meta().key;
        metas
            .keys()
            .filter(|key| **key != class_key)
            .cloned()
            .collect()
    }

    pub fn feature_set_group(&self, group: &str) -> Result<&[Vec<String>]> {
        self.feature_sets_set
            .get(group)
            .map(Vec::as_slice)
            .ok_or_else(|| ModelError::UnknownFeatureSetGroup {
                model: self.name.clone(),
                group: group.to_string(),
            })
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("create_feature_sets", &self.create_feature_sets.is_some())
            .field("create_features", &self.create_features.is_some())
            .field("context_fn", &self.context_fn.is_some())
            .field("thaw", &self.thaw.is_some())
            .field("return_keys", &self.return_keys)
            .field("cross_fold_cache", &self.cross_fold_cache)
            .field("train_test_cache", &self.train_test_cache)
            .field("feature_sets_set", &self.feature_sets_set)
            .field("display_features", &self.display_features)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ModelConfig`]. The feature metadata and class metadata
/// callbacks are required.
pub struct ModelConfigBuilder {
    name: String,
    create_feature_sets: Option<CreateFeatureSetsFn>,
    create_features: Option<CreateFeaturesFn>,
    feature_metas: Option<FeatureMetasFn>,
    class_feature_meta: Option<ClassFeatureMetaFn>,
    context_fn: Option<ContextFn>,
    thaw: Option<Arc<dyn ContextThaw>>,
    return_keys: ReturnKeys,
    cross_fold_cache: Option<Arc<InstanceCell>>,
    train_test_cache: Option<Arc<TrainTestCell>>,
    feature_sets_set: IndexMap<String, Vec<Vec<String>>>,
    display_features: Option<Vec<String>>,
    result_transform: Option<ResultTransformFn>,
}

impl ModelConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create_feature_sets: None,
            create_features: None,
            feature_metas: None,
            class_feature_meta: None,
            context_fn: None,
            thaw: None,
            return_keys: ReturnKeys::default(),
            cross_fold_cache: None,
            train_test_cache: None,
            feature_sets_set: IndexMap::new(),
            display_features: None,
            result_transform: None,
        }
    }

    pub fn create_feature_sets<F>(mut self, generator: F) -> Self
    where
        F: Fn(SetType) -> anyhow::Result<Vec<FeatureMap>> + Send + Sync + 'static,
    {
        self.create_feature_sets = Some(Arc::new(generator));
        self
    }

    pub fn create_features<F>(mut self, generator: F) -> Self
    where
        F: Fn(&[Value], Option<&Context>) -> anyhow::Result<FeatureMap> + Send + Sync + 'static,
    {
        self.create_features = Some(Arc::new(generator));
        self
    }

    pub fn feature_metas<F>(mut self, metas: F) -> Self
    where
        F: Fn(Option<&Context>) -> anyhow::Result<FeatureMetas> + Send + Sync + 'static,
    {
        self.feature_metas = Some(Arc::new(metas));
        self
    }

    /// Feature metadata that does not depend on the context.
    pub fn static_feature_metas(self, metas: FeatureMetas) -> Self {
        self.feature_metas(move |_| Ok(metas.clone()))
    }

    pub fn class_feature_meta<F>(mut self, meta: F) -> Self
    where
        F: Fn() -> ClassFeatureMeta + Send + Sync + 'static,
    {
        self.class_feature_meta = Some(Arc::new(meta));
        self
    }

    pub fn class_feature(self, meta: ClassFeatureMeta) -> Self {
        self.class_feature_meta(move || meta.clone())
    }

    pub fn context_fn<F>(mut self, context_fn: F) -> Self
    where
        F: Fn() -> anyhow::Result<Context> + Send + Sync + 'static,
    {
        self.context_fn = Some(Arc::new(context_fn));
        self
    }

    pub fn thaw(mut self, thaw: impl ContextThaw + 'static) -> Self {
        self.thaw = Some(Arc::new(thaw));
        self
    }

    pub fn return_keys(mut self, keys: ReturnKeys) -> Self {
        self.return_keys = keys;
        self
    }

    pub fn cross_fold_cache(mut self, cell: Arc<InstanceCell>) -> Self {
        self.cross_fold_cache = Some(cell);
        self
    }

    pub fn train_test_cache(mut self, cell: Arc<TrainTestCell>) -> Self {
        self.train_test_cache = Some(cell);
        self
    }

    /// Attach fresh, empty cells for both cache slots.
    pub fn with_caches(self) -> Self {
        self.cross_fold_cache(Arc::default())
            .train_test_cache(Arc::default())
    }

    pub fn feature_set_group(mut self, group: impl Into<String>, combos: Vec<Vec<String>>) -> Self {
        self.feature_sets_set.insert(group.into(), combos);
        self
    }

    pub fn display_features(mut self, keys: Vec<String>) -> Self {
        self.display_features = Some(keys);
        self
    }

    pub fn result_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(ResultMap) -> anyhow::Result<ResultMap> + Send + Sync + 'static,
    {
        self.result_transform = Some(Arc::new(transform));
        self
    }

    pub fn build(self) -> Result<ModelConfig> {
        let feature_metas = self
            .feature_metas
            .ok_or_else(|| ModelError::IncompleteConfig {
                model: self.name.clone(),
                missing: "feature metadata",
            })?;
        let class_feature_meta =
            self.class_feature_meta
                .ok_or_else(|| ModelError::IncompleteConfig {
                    model: self.name.clone(),
                    missing: "class feature metadata",
                })?;

        Ok(ModelConfig {
            name: self.name,
            create_feature_sets: self.create_feature_sets,
            create_features: self.create_features,
            feature_metas,
            class_feature_meta,
            context_fn: self.context_fn,
            thaw: self.thaw,
            return_keys: self.return_keys,
            cross_fold_cache: self.cross_fold_cache,
            train_test_cache: self.train_test_cache,
            feature_sets_set: self.feature_sets_set,
            display_features: self.display_features,
            result_transform: self.result_transform,
            context: CacheCell::new(),
        })
    }
}
