//! Dotted `section.key=value` overrides applied onto a TOML value tree.
//!
//! Overrides are patched into the tree *before* deserialization so that
//! serde performs the final type checking. Values are coerced by parse
//! order (bool, integer, float, string); a value the section's struct
//! cannot accept is rejected when the patched tree deserializes.
//!
//! Missing intermediate tables are created along the override path, so a
//! serde-defaulted section the file omits entirely (`[trainer]`, say) can
//! still be overridden. Typo'd keys and unknown sections are caught when
//! the patched tree deserializes: every configuration struct denies
//! unknown fields.

use crate::error::{SluError, SluResult};

/// Apply each `path.to.key=value` override onto `root` in order.
pub fn apply_overrides(root: &mut toml::Value, raw_overrides: &[String]) -> SluResult<()> {
    for raw in raw_overrides {
        let (path, value) = parse_override(raw)?;
        apply_one(root, raw, &path, value)?;
    }
    Ok(())
}

/// Split one `a.b.c=value` string into its path segments and coerced value.
pub fn parse_override(raw: &str) -> SluResult<(Vec<String>, toml::Value)> {
    let (path, value) = raw.split_once('=').ok_or_else(|| {
        SluError::Config(format!("override `{}` is not of the form key=value", raw))
    })?;
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SluError::Config(format!(
            "override `{}` has an empty path segment",
            raw
        )));
    }
    Ok((segments, coerce(value)))
}

fn coerce(raw: &str) -> toml::Value {
    match raw {
        "true" => return toml::Value::Boolean(true),
        "false" => return toml::Value::Boolean(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

fn apply_one(
    root: &mut toml::Value,
    raw: &str,
    segments: &[String],
    value: toml::Value,
) -> SluResult<()> {
    let (key, parents) = segments.split_last().ok_or_else(|| {
        SluError::Config(format!("override `{}` has an empty path", raw))
    })?;

    let mut cursor = root;
    for parent in parents {
        let table = cursor.as_table_mut().ok_or_else(|| {
            SluError::Config(format!(
                "override `{}` path traverses a non-table value at `{}`",
                raw, parent
            ))
        })?;
        cursor = table
            .entry(parent.clone())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
    let table = cursor.as_table_mut().ok_or_else(|| {
        SluError::Config(format!(
            "override `{}` path does not resolve to a table",
            raw
        ))
    })?;
    table.insert(key.clone(), value);
    Ok(())
}
