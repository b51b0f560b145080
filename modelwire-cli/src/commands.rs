use anyhow::Context;
use anyhow::Result;
use modelwire_core::Evaluation;
use modelwire_core::Protocol;
use modelwire_core::ReportSections;
use modelwire_core::SetType;
use modelwire_core::Workbench;
use modelwire_core::dataset;
use serde_json::Value;
use std::io;
use std::io::Read;
use std::path::Path;

pub fn handle_info(bench: &Workbench) -> Result<()> {
    let paths = bench.paths();
    println!("Loaded configuration from {}", paths.config_file.display());
    println!("  Models:  {}", paths.model_dir.display());
    println!("  Reports: {}", paths.report_dir.display());

    let names = bench.settings().model_names();
    if names.is_empty() {
        println!("No models configured yet. Add one under [models.<name>].");
        return Ok(());
    }

    for name in names {
        let model = bench.resolve_model(name)?;
        let trained = if model.model_file().exists() {
            "trained"
        } else {
            "untrained"
        };
        println!(
            "\n{name} ({trained}): {} features, class '{}' {:?}",
            model.features.len(),
            model.class.key,
            model.class.values
        );
        if let Some(description) = model.description.as_deref() {
            println!("  {description}");
        }
        if !model.feature_sets.is_empty() {
            let groups: Vec<&str> = model.feature_sets.keys().map(String::as_str).collect();
            println!("  Feature set groups: {}", groups.join(", "));
        }
    }
    Ok(())
}

fn print_evaluation(evaluation: &Evaluation) {
    for line in evaluation.summary_lines() {
        println!("  {line}");
    }
}

pub fn handle_train(bench: &Workbench, model: &str, protocol: Protocol) -> Result<()> {
    println!("Training model '{model}'...");
    let outcome = bench.train(model, protocol)?;
    print_evaluation(&outcome.evaluation);
    println!("✓ Model written to {}", outcome.model_file.display());
    println!("  Dump: {}", outcome.dump_file.display());
    println!("  Confusion matrix: {}", outcome.confusion_matrix_file.display());
    Ok(())
}

pub fn handle_evaluate(bench: &Workbench, model: &str, protocol: Protocol, json: bool) -> Result<()> {
    let evaluation = bench.evaluate(model, protocol)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&evaluation)?);
    } else {
        println!("Evaluation of '{model}':");
        print_evaluation(&evaluation);
    }
    Ok(())
}

pub fn handle_sweep(bench: &Workbench, model: &str, group: &str, protocol: Protocol) -> Result<()> {
    let results = bench.sweep(model, group, protocol)?;

    println!("\n{}", "=".repeat(80));
    println!("Feature set group '{group}' of '{model}'");
    println!("{}", "=".repeat(80));
    for (rank, result) in results.iter().enumerate() {
        println!(
            "{:>3}. {:.4}  {}",
            rank + 1,
            result.evaluation.accuracy,
            result.features.join(", ")
        );
    }
    Ok(())
}

pub fn handle_classify(bench: &Workbench, model: &str, input: Option<&str>) -> Result<()> {
    let raw = match input {
        Some(text) => text.to_string(),
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read from stdin")?;
            buffer
        }
    };
    let value: Value = serde_json::from_str(raw.trim()).context("input is not valid JSON")?;

    let result = bench.classify(model, &[value])?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub fn handle_predict(
    bench: &Workbench,
    model: &str,
    set: SetType,
    inputs: Option<&Path>,
) -> Result<()> {
    let inputs = inputs
        .map(|path| -> Result<Vec<Vec<Value>>> {
            Ok(dataset::load_feature_maps(path)?
                .into_iter()
                .map(|features| vec![Value::Object(features.into_iter().collect())])
                .collect())
        })
        .transpose()?;

    let outcome = bench.predict(model, set, inputs.as_deref())?;
    let table = &outcome.table;
    println!(
        "Predicted {} rows of '{model}' ({} correct)",
        table.len(),
        table.correct_count()
    );
    println!("✓ Predictions written to {}", outcome.predictions_file.display());
    Ok(())
}

pub fn handle_describe(
    bench: &Workbench,
    model: &str,
    sections: Option<ReportSections>,
) -> Result<()> {
    print!("{}", bench.describe(model, sections)?);
    Ok(())
}

pub fn handle_dataset_convert(input: &Path, output: Option<&Path>) -> Result<()> {
    let rows = dataset::load_feature_maps(input)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension("jsonl"));
    if output == input {
        anyhow::bail!("refusing to overwrite {}", input.display());
    }

    let written = dataset::write_feature_maps_jsonl(&output, &rows)?;
    println!("✓ Wrote {written} feature maps to {}", output.display());
    Ok(())
}
