//! `{}` placeholder substitution for message templates.
//!
//! Each `{}` consumes the next argument. `\{}` produces a literal `{}`
//! without consuming an argument, and `\\{}` produces a literal backslash
//! followed by the substituted argument. Placeholders left without an
//! argument stay as `{}`; surplus arguments are ignored.

use serde_json::Value;

const PLACEHOLDER: &str = "{}";

pub fn format_message(template: &str, args: &[Value]) -> String {
    if args.is_empty() && !template.contains('\\') {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len() + args.len() * 8);
    let mut args = args.iter();
    let mut rest = template;

    while let Some(pos) = rest.find(PLACEHOLDER) {
        let before = &rest[..pos];
        rest = &rest[pos + PLACEHOLDER.len()..];

        let escapes = before.len() - before.trim_end_matches('\\').len();
        if escapes % 2 == 1 {
            out.push_str(&before[..before.len() - 1]);
            out.push_str(PLACEHOLDER);
            continue;
        }

        match args.next() {
            Some(value) => {
                if escapes >= 2 {
                    out.push_str(&before[..before.len() - 1]);
                } else {
                    out.push_str(before);
                }
                push_value(&mut out, value);
            }
            None => {
                out.push_str(before);
                out.push_str(PLACEHOLDER);
            }
        }
    }

    out.push_str(rest);
    out
}

/// Render a single argument the way it should appear inside a message:
/// strings without quotes, everything else in its JSON form.
pub fn render_value(value: &Value) -> String {
    let mut s = String::new();
    push_value(&mut s, value);
    s
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}
