//! Caller-owned compute-once cells and the two cached instance slots.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::error::CacheSlot;
use crate::error::ModelError;
use crate::error::Result;
use crate::instances;
use crate::instances::InstanceSet;
use crate::model::FeatureMap;
use crate::model::ModelConfig;
use crate::model::SetType;
use crate::scope;

/// Synchronized fill-if-absent cell.
///
/// The fill closure runs while the lock is held, so concurrent callers block
/// and all observe the value produced by the single successful fill.
pub struct CacheCell<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> CacheCell<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    pub fn is_filled(&self) -> bool {
        self.lock().is_some()
    }

    /// Empty the cell so the next access regenerates its value.
    pub fn reset(&self) -> Option<Arc<T>> {
        self.lock().take()
    }

    pub fn get_or_try_fill<E>(
        &self,
        fill: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<Arc<T>, E> {
        let mut slot = self.lock();
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(fill()?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }
}

impl<T> Default for CacheCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CacheCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCell")
            .field("filled", &self.is_filled())
            .finish()
    }
}

/// Train and test instances plus their concatenation, cached as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainTestInstances {
    pub train: InstanceSet,
    pub test: InstanceSet,
    pub train_test: InstanceSet,
}

pub type InstanceCell = CacheCell<InstanceSet>;
pub type TrainTestCell = CacheCell<TrainTestInstances>;

/// Instances for cross validation, materialized at most once per fill.
pub fn cross_fold_instances(config: &Arc<ModelConfig>) -> Result<Arc<InstanceSet>> {
    let cell = config
        .cross_fold_cache()
        .ok_or_else(|| ModelError::CacheNotConfigured {
            model: config.name().to_string(),
            slot: CacheSlot::CrossFold,
        })?;

    scope::with_config(Arc::clone(config), || {
        cell.get_or_try_fill(|| {
            log::debug!("materializing cross-fold instances for '{}'", config.name());
            let rows = config.feature_sets(SetType::TrainTest)?;
            build_training_set(config, SetType::TrainTest, &rows)
        })
    })
}

/// Train, test and combined instances, materialized at most once per fill.
pub fn train_test_instances(config: &Arc<ModelConfig>) -> Result<Arc<TrainTestInstances>> {
    let cell = config
        .train_test_cache()
        .ok_or_else(|| ModelError::CacheNotConfigured {
            model: config.name().to_string(),
            slot: CacheSlot::TrainTest,
        })?;

    scope::with_config(Arc::clone(config), || {
        cell.get_or_try_fill(|| {
            log::debug!("materializing train/test instances for '{}'", config.name());
            let train_rows = config.feature_sets(SetType::Train)?;
            let test_rows = config.feature_sets(SetType::Test)?;
            let train = build_training_set(config, SetType::Train, &train_rows)?;
            let test = build_training_set(config, SetType::Test, &test_rows)?;
            let train_test =
                instances::append(&train, &test)?.with_name(SetType::TrainTest.as_str());
            Ok(TrainTestInstances {
                train,
                test,
                train_test,
            })
        })
    })
}

fn build_training_set(
    config: &ModelConfig,
    set: SetType,
    rows: &[FeatureMap],
) -> Result<InstanceSet> {
    let context = config.training_context()?;
    let metas = config.feature_metas(context.as_ref())?;
    let class_meta = config.class_feature_meta();
    let built = instances::build(set.as_str(), rows, &metas, &class_meta, false)?;
    log::debug!(
        "built {} instance set for '{}' with {} rows",
        set,
        config.name(),
        built.len()
    );
    Ok(built)
}
