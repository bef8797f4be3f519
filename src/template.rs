use crate::schema::InputField;
use std::collections::BTreeMap;

/// Replaces every `{{ identifier }}` token with its value, or the empty string
/// when the identifier has no value. Identifiers are `[A-Za-z0-9_]+`; anything
/// else between braces is left untouched.
pub fn render_template(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut cursor = template;

    while let Some(start) = cursor.find("{{") {
        rendered.push_str(&cursor[..start]);
        let after_open = &cursor[start + 2..];

        let Some(close_offset) = after_open.find("}}") else {
            rendered.push_str(&cursor[start..]);
            return rendered;
        };

        let token = after_open[..close_offset].trim();
        if is_identifier(token) {
            if let Some(value) = values.get(token) {
                rendered.push_str(value);
            }
            cursor = &after_open[close_offset + 2..];
        } else {
            // A longer brace run may still hide a token one character later.
            rendered.push('{');
            cursor = &cursor[start + 1..];
        }
    }

    rendered.push_str(cursor);
    rendered
}

pub fn placeholder_keys(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut cursor = template;
    while let Some(start) = cursor.find("{{") {
        let after_open = &cursor[start + 2..];
        let Some(close_offset) = after_open.find("}}") else {
            break;
        };
        let token = after_open[..close_offset].trim();
        if is_identifier(token) {
            if !keys.iter().any(|k| k == token) {
                keys.push(token.to_string());
            }
            cursor = &after_open[close_offset + 2..];
        } else {
            cursor = &cursor[start + 1..];
        }
    }
    keys
}

/// Template used when a pilot has no generation step to take one from.
pub fn synthesize_template(one_liner: &str, inputs: &[InputField]) -> String {
    let mut template = String::new();
    let task = one_liner.trim();
    if task.is_empty() {
        template.push_str("Complete the task using the inputs below.\n\n");
    } else {
        template.push_str(&format!("Task: {task}\n\n"));
    }
    template.push_str("Inputs:\n");
    for field in inputs {
        template.push_str(&format!("- {}: {{{{{}}}}}\n", field.label, field.key));
    }
    template
}

fn is_identifier(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
