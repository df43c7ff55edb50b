// src/uniform_dump.rs
//! Human-readable uniform dumps.
//!
//! The file format is a JSON-like object, one property per line:
//!
//! ```text
//! {
//!     "color": [1, 0, 0, 1],
//!     "lights": [[1, 2, 3, 4], [5, 6, 7, 8]],
//!     "time": 0.5
//! }
//! ```
//!
//! With `flatten` every property is a single flat list; without it arrays of
//! vectors and matrices nest one list per element.

use std::fmt::Write as _;
use std::path::Path;

use crate::context::Context;
use crate::error::Result;
use crate::shader_prop::ShaderProp;

fn push_list(out: &mut String, values: &[f32]) {
    out.push('[');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{v}");
    }
    out.push(']');
}

/// Value text for one property.
pub fn format_value(prop: &ShaderProp, values: &[f32], flatten: bool) -> String {
    let mut out = String::new();
    let floats_per_element = (prop.size as usize / 4).max(1);

    if values.len() == 1 && prop.array_size <= 1 {
        let _ = write!(out, "{}", values[0]);
    } else if flatten || floats_per_element == 1 || prop.array_size <= 1 {
        push_list(&mut out, values);
    } else {
        out.push('[');
        for (i, element) in values.chunks(floats_per_element).enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            push_list(&mut out, element);
        }
        out.push(']');
    }
    out
}

/// Whole dump as text.
pub fn to_json_like(values: &[(ShaderProp, Vec<f32>)], flatten: bool) -> String {
    let mut out = String::from("{\n");
    for (i, (prop, floats)) in values.iter().enumerate() {
        let separator = if i + 1 < values.len() { "," } else { "" };
        let _ = writeln!(
            out,
            "    \"{}\": {}{}",
            escape(&prop.name),
            format_value(prop, floats, flatten),
            separator
        );
    }
    out.push('}');
    out.push('\n');
    out
}

/// One log line per property: name, offset, size and values.
pub fn summary_lines(values: &[(ShaderProp, Vec<f32>)]) -> Vec<String> {
    values
        .iter()
        .map(|(prop, floats)| {
            format!(
                "{} ({} x{}) offset {} size {}: {}",
                prop.name,
                prop.prop_type,
                prop.array_size,
                prop.offset,
                prop.byte_len(),
                format_value(prop, floats, true)
            )
        })
        .collect()
}

pub fn write_file(path: &Path, values: &[(ShaderProp, Vec<f32>)], flatten: bool) -> Result<()> {
    std::fs::write(path, to_json_like(values, flatten))
        .with_context(|| format!("writing uniform dump to {}", path.display()))
}

fn escape(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}
