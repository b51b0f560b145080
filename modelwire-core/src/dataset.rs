use std::fs;
use std::io;
use std::io::BufRead;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use serde_json::Value;

use crate::model::FeatureMap;
use crate::model::feature_map_from_value;

/// Load feature maps from a path.
///
/// The path can be either:
/// - A directory containing `.json` files (one feature map per file, read in
///   file name order)
/// - A `.jsonl` file (one feature map per line)
/// - A `.json` file holding an array of feature maps or a single one
pub fn load_feature_maps(path: &Path) -> Result<Vec<FeatureMap>> {
    if !path.exists() {
        return Err(anyhow!("dataset path '{}' does not exist", path.display()));
    }

    if path.is_file() {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("jsonl") => load_from_jsonl(path),
            Some("json") => load_from_json_file(path),
            _ => Err(anyhow!("unsupported dataset file format: {}", path.display())),
        }
    } else {
        load_from_directory(path)
    }
}

fn load_from_directory(dir: &Path) -> Result<Vec<FeatureMap>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("unable to read dataset directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();

    let mut rows = Vec::with_capacity(files.len());
    for path in files {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read dataset file '{}'", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse dataset json '{}'", path.display()))?;
        rows.push(
            feature_map_from_value(&value)
                .with_context(|| format!("invalid feature map in '{}'", path.display()))?,
        );
    }
    Ok(rows)
}

fn load_from_jsonl(path: &Path) -> Result<Vec<FeatureMap>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open JSONL file '{}'", path.display()))?;
    let reader = io::BufReader::new(file);

    let mut rows = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} of '{}'", line_num + 1, path.display())
        })?;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: Value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse JSON at line {} of '{}'", line_num + 1, path.display())
        })?;
        rows.push(feature_map_from_value(&value).with_context(|| {
            format!("invalid feature map at line {} of '{}'", line_num + 1, path.display())
        })?);
    }

    Ok(rows)
}

fn load_from_json_file(path: &Path) -> Result<Vec<FeatureMap>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset file '{}'", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse dataset json '{}'", path.display()))?;

    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                feature_map_from_value(item).with_context(|| {
                    format!("invalid feature map at index {index} of '{}'", path.display())
                })
            })
            .collect(),
        single => Ok(vec![
            feature_map_from_value(&single)
                .with_context(|| format!("invalid feature map in '{}'", path.display()))?,
        ]),
    }
}

/// Write feature maps as JSONL, one object per line.
pub fn write_feature_maps_jsonl(path: &Path, rows: &[FeatureMap]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory '{}'", parent.display()))?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create JSONL file '{}'", path.display()))?;
    let mut writer = io::BufWriter::new(file);

    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writeln!(writer)?;
    }
    writer.flush()?;

    Ok(rows.len())
}
