use std::fs;
use std::sync::Arc;
use std::sync::Mutex;

use approx::assert_relative_eq;
use modelwire_core::ClassFeatureMeta;
use modelwire_core::FeatureMap;
use modelwire_core::FeatureMetas;
use modelwire_core::FeatureType;
use modelwire_core::Model;
use modelwire_core::ModelConfig;
use modelwire_core::ModelError;
use modelwire_core::NaiveBayesEngine;
use modelwire_core::ReportSections;
use modelwire_core::ReturnKey;
use modelwire_core::ReturnKeys;
use modelwire_core::SetType;
use modelwire_core::TrainingSource;
use modelwire_core::persist;
use modelwire_core::report;
use modelwire_core::scope;
use modelwire_core::serving;
use modelwire_core::training;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn review(stars: u64, words: u64, verdict: &str) -> Value {
    json!({"stars": stars, "words": words, "verdict": verdict})
}

fn corpus(set: SetType) -> Vec<Value> {
    let train = vec![
        review(5, 120, "keep"),
        review(4, 80, "keep"),
        review(5, 200, "keep"),
        review(1, 10, "drop"),
        review(2, 15, "drop"),
        review(1, 5, "drop"),
    ];
    let test = vec![review(4, 150, "keep"), review(1, 8, "drop")];
    match set {
        SetType::Train => train,
        SetType::Test => test,
        SetType::TrainTest => train.into_iter().chain(test).collect(),
    }
}

/// Turn a raw review into features. The training context carries the word
/// count threshold for the `long` feature.
fn review_features(raw: &Value, context: Option<&Value>) -> anyhow::Result<FeatureMap> {
    let threshold = context
        .and_then(|context| context["long_after"].as_u64())
        .unwrap_or(50);
    let mut features = FeatureMap::new();
    features.insert("stars".to_string(), raw["stars"].clone());
    if let Some(words) = raw["words"].as_u64() {
        features.insert("long".to_string(), json!(words > threshold));
    }
    if let Some(verdict) = raw.get("verdict") {
        features.insert("verdict".to_string(), verdict.clone());
    }
    Ok(features)
}

fn metas() -> FeatureMetas {
    FeatureMetas::from_iter([
        ("stars".to_string(), FeatureType::Numeric),
        ("long".to_string(), FeatureType::Boolean),
    ])
}

fn review_config(context_calls: Arc<Mutex<usize>>) -> Arc<ModelConfig> {
    let config = ModelConfig::builder("reviews")
        .create_feature_sets(|set| {
            let active = scope::current_config()?;
            let context = active.training_context()?;
            corpus(set)
                .iter()
                .map(|raw| review_features(raw, context.as_ref()))
                .collect()
        })
        .create_features(|inputs, context| match inputs {
            [raw] => review_features(raw, context),
            _ => anyhow::bail!("one review per call"),
        })
        .static_feature_metas(metas())
        .class_feature(ClassFeatureMeta::new("verdict", ["keep", "drop"]))
        .context_fn(move || {
            *context_calls.lock().unwrap() += 1;
            Ok(json!({"long_after": 50}))
        })
        .return_keys(ReturnKeys::all())
        .with_caches()
        .build()
        .unwrap();
    Arc::new(config)
}

#[test]
fn trained_models_round_trip_through_disk() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let calls = Arc::new(Mutex::new(0));
    let config = review_config(Arc::clone(&calls));
    let engine = NaiveBayesEngine::default();

    let artifact = training::train_model(&config, &engine, TrainingSource::TrainTest).unwrap();
    assert_eq!(*calls.lock().unwrap(), 1, "context is computed once per config");
    assert_eq!(artifact.context, Some(json!({"long_after": 50})));
    let path = persist::write_model(tmp.path(), &artifact).unwrap();

    let model = Model::load(&config, &engine, &path).unwrap();
    assert_eq!(model.artifact().attributes, vec!["stars", "long", "verdict"]);
    assert_eq!(model.artifact().classifier, artifact.classifier);
    assert_eq!(model.context(), Some(&json!({"long_after": 50})));
    let result = serving::classify(&model, &[json!({"stars": 5, "words": 300})]).unwrap();
    assert_eq!(result.label.as_deref(), Some("keep"));
    let distributions = result.distributions.as_ref().unwrap();
    assert_relative_eq!(distributions.values().sum::<f64>(), 1.0, epsilon = 1e-9);
    assert_eq!(
        result.features.as_ref().unwrap()["long"],
        json!(true),
        "features are generated with the persisted context"
    );
}

#[test]
fn priming_twice_gives_the_same_answers() {
    let config = review_config(Arc::default());
    let engine = NaiveBayesEngine::default();
    let artifact = training::train_model(&config, &engine, TrainingSource::TrainTest).unwrap();

    let mut model = serving::prime_model(&config, &engine, artifact).unwrap();
    let input = [json!({"stars": 2, "words": 12})];
    let first = serving::classify(&model, &input).unwrap();
    model.prime(&engine).unwrap();
    assert_eq!(serving::classify(&model, &input).unwrap(), first);
    assert_eq!(first.label.as_deref(), Some("drop"));
}

#[test]
fn absent_features_are_treated_as_missing() {
    let config = review_config(Arc::default());
    let engine = NaiveBayesEngine::default();
    let artifact = training::train_model(&config, &engine, TrainingSource::TrainTest).unwrap();
    let model = serving::prime_model(&config, &engine, artifact).unwrap();

    let result = serving::classify(&model, &[json!({"stars": 1})]).unwrap();
    assert_eq!(result.label.as_deref(), Some("drop"));
    assert!(!result.features.unwrap().contains_key("long"));
}

#[test]
fn values_outside_the_attribute_domain_are_rejected() {
    let config = review_config(Arc::default());
    let engine = NaiveBayesEngine::default();
    let artifact = training::train_model(&config, &engine, TrainingSource::TrainTest).unwrap();
    let model = serving::prime_model(&config, &engine, artifact).unwrap();

    let err = serving::classify(&model, &[json!({"stars": "many", "words": 3})]).unwrap_err();
    match err {
        ModelError::FeatureCoercion { attribute, .. } => assert_eq!(attribute, "stars"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn predictions_and_reports_land_next_to_the_model() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let config = review_config(Arc::default());
    let engine = NaiveBayesEngine::default();
    let artifact = training::train_model(&config, &engine, TrainingSource::cross_fold(3)).unwrap();
    let evaluation = artifact.performance.clone().unwrap();
    assert_eq!(evaluation.total, 8);
    let model = serving::prime_model(&config, &engine, artifact).unwrap();

    let inputs = vec![
        vec![review(5, 90, "keep")],
        vec![json!({"stars": 1, "words": 4})],
    ];
    let table = serving::predict(&model, SetType::Test, Some(inputs.as_slice())).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.data[0][serving::PRED_LABEL], json!("keep"));
    assert_eq!(table.data[0][serving::CORRECT], json!(true));
    assert_eq!(table.data[1][serving::CORRECT_LABEL], json!(serving::NO_CLASS_LABEL));

    let predictions = report::write_predictions(tmp.path(), &table).unwrap();
    let csv = fs::read_to_string(predictions).unwrap();
    assert!(csv.starts_with("pred-label,correct-label,correct?,confidence,stars,long\n"));

    let matrix = report::write_confusion_matrix(tmp.path(), "reviews", &evaluation.confusion).unwrap();
    let matrix = fs::read_to_string(matrix).unwrap();
    assert_eq!(matrix.lines().next(), Some("keep,drop,predicts"));
    assert_eq!(matrix.lines().count(), 3);

    let dump = report::write_model_dump(tmp.path(), &model, ReportSections::default()).unwrap();
    let dump = fs::read_to_string(dump).unwrap();
    assert!(dump.contains("== classifier =="));
    assert!(dump.contains("\"long_after\": 50"));
}

#[test]
fn label_only_results_skip_distributions() {
    let config = ModelConfig::builder("labels")
        .create_feature_sets(|set| {
            corpus(set)
                .iter()
                .map(|raw| review_features(raw, None))
                .collect()
        })
        .create_features(|inputs, context| review_features(&inputs[0], context))
        .static_feature_metas(metas())
        .class_feature(ClassFeatureMeta::new("verdict", ["keep", "drop"]))
        .return_keys(ReturnKeys::label_only())
        .with_caches()
        .build()
        .unwrap();
    let config = Arc::new(config);
    let engine = NaiveBayesEngine::default();
    let artifact = training::train_model(&config, &engine, TrainingSource::TrainTest).unwrap();
    let model = serving::prime_model(&config, &engine, artifact).unwrap();

    let result = serving::classify(&model, &[json!({"stars": 4, "words": 60})]).unwrap();
    assert!(config.return_keys().contains(ReturnKey::Label));
    assert_eq!(result.label.as_deref(), Some("keep"));
    assert_eq!(result.distributions, None);
    assert_eq!(result.features, None);
}
