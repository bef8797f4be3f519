//! Input field normalisation.
//!
//! Builders describe inputs as loose CSV-ish text (`key,label,required,placeholder`
//! per line) or as already-structured fields submitted by the editor. Both
//! paths end up here so a pilot's input list always has unique,
//! identifier-safe keys and is never empty once `ensure_minimum_inputs` runs.

use crate::schema::InputField;
use std::collections::HashSet;

pub const DEFAULT_INPUT_KEY: &str = "field";
pub const SOURCE_TEXT_KEY: &str = "source_text";

const TRUTHY_TOKENS: [&str; 5] = ["true", "1", "yes", "y", "はい"];

pub fn default_source_field() -> InputField {
    InputField {
        key: SOURCE_TEXT_KEY.to_string(),
        label: "Source text".to_string(),
        required: true,
        placeholder: Some("Paste the text to work with".to_string()),
    }
}

pub fn normalize_input_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for ch in raw.to_lowercase().chars() {
        match ch {
            'a'..='z' | '0'..='9' | '_' => {
                if pending_separator {
                    key.push('_');
                    pending_separator = false;
                }
                key.push(ch);
            }
            '-' => pending_separator = true,
            c if c.is_whitespace() => pending_separator = true,
            _ => {}
        }
    }

    let trimmed = key.trim_matches('_');
    if trimmed.is_empty() {
        DEFAULT_INPUT_KEY.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn parse_input_fields(raw_csv: &str) -> Vec<InputField> {
    let rows = raw_csv
        .lines()
        .map(split_cells)
        .filter(|cells| cells.iter().any(|cell| !cell.is_empty()))
        .collect::<Vec<Vec<String>>>();

    let skip_header = rows
        .first()
        .and_then(|cells| cells.first())
        .map(|cell| cell.eq_ignore_ascii_case("key"))
        .unwrap_or(false);

    let fields = rows
        .iter()
        .skip(usize::from(skip_header))
        .map(|cells| field_from_cells(cells));

    dedupe_by_key(fields)
}

pub fn ensure_minimum_inputs(fields: Vec<InputField>) -> Vec<InputField> {
    if fields.is_empty() {
        vec![default_source_field()]
    } else {
        fields
    }
}

/// Editor-path normalisation: keys are re-normalised, duplicates dropped
/// (first wins), and an empty list falls back to the default source field.
pub fn normalize_inputs(inputs: Vec<InputField>) -> Vec<InputField> {
    let normalized = inputs.into_iter().map(|field| {
        let key = normalize_input_key(&field.key);
        let label = match field.label.trim() {
            "" => key.clone(),
            label => label.to_string(),
        };
        InputField {
            key,
            label,
            required: field.required,
            placeholder: field
                .placeholder
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        }
    });
    ensure_minimum_inputs(dedupe_by_key(normalized))
}

fn dedupe_by_key(fields: impl IntoIterator<Item = InputField>) -> Vec<InputField> {
    let mut seen = HashSet::new();
    fields
        .into_iter()
        .filter(|field| seen.insert(field.key.clone()))
        .collect()
}

fn split_cells(line: &str) -> Vec<String> {
    line.split(',')
        .map(|cell| cell.trim().trim_matches('"').trim().to_string())
        .collect()
}

fn field_from_cells(cells: &[String]) -> InputField {
    let non_empty = |index: usize| -> Option<&str> {
        cells
            .get(index)
            .map(|cell| cell.as_str())
            .filter(|cell| !cell.is_empty())
    };

    if cells.len() == 1 {
        let raw = cells[0].clone();
        return InputField {
            key: normalize_input_key(&raw),
            label: raw.clone(),
            required: true,
            placeholder: Some(raw),
        };
    }

    let raw_key = non_empty(0).unwrap_or_default();
    InputField {
        key: normalize_input_key(raw_key),
        label: non_empty(1).or(non_empty(0)).unwrap_or(DEFAULT_INPUT_KEY).to_string(),
        required: non_empty(2).map(is_truthy).unwrap_or(true),
        placeholder: non_empty(3).map(|p| p.to_string()),
    }
}

fn is_truthy(token: &str) -> bool {
    let lowered = token.trim().to_lowercase();
    TRUTHY_TOKENS.iter().any(|truthy| *truthy == lowered)
}
