//! Markup parser for Gantry build-graph scripts.
//!
//! Accepts a practical XML subset: an optional prolog, comments, nested
//! elements with double- or single-quoted attributes (five standard entities),
//! and ignorable whitespace between tags. Every parsed element carries the
//! file and line of its opening tag. The root element must be `BuildGraph`
//! declared in the Gantry namespace.

mod ast;
mod parser;

use std::path::Path;

use gantry_types::{GantryError, Result};

pub use ast::ScriptElement;

/// Namespace the root `BuildGraph` element must declare via `xmlns`.
pub const NAMESPACE: &str = "http://schemas.gantry.build/graph";

fn convert(raw: parser::RawElement, text: &str, file: &str) -> ScriptElement {
    let line = parser::offset_to_line(text, raw.offset);
    ScriptElement {
        name: raw.name,
        attributes: raw.attributes,
        children: raw
            .children
            .into_iter()
            .map(|c| convert(c, text, file))
            .collect(),
        location: gantry_types::SourceLocation::new(file, line),
    }
}

/// Parse a script document from text. `file` is used for source locations only.
pub fn parse(text: &str, file: &str) -> Result<ScriptElement> {
    let raw = parser::parse_document(text).map_err(|(offset, message)| GantryError::Parse {
        file: file.to_string(),
        line: parser::offset_to_line(text, offset),
        message,
    })?;

    let root = convert(raw, text, file);
    if root.name != "BuildGraph" {
        return Err(GantryError::Parse {
            file: file.to_string(),
            line: root.location.line,
            message: format!("root element must be 'BuildGraph', found '{}'", root.name),
        });
    }
    match root.attribute("xmlns") {
        Some(ns) if ns == NAMESPACE => {}
        Some(ns) => {
            return Err(GantryError::Parse {
                file: file.to_string(),
                line: root.location.line,
                message: format!("unexpected namespace '{ns}', expected '{NAMESPACE}'"),
            });
        }
        None => {
            return Err(GantryError::Parse {
                file: file.to_string(),
                line: root.location.line,
                message: format!("root element must declare xmlns='{NAMESPACE}'"),
            });
        }
    }
    Ok(root)
}

/// Read and parse a script file.
pub fn parse_file(path: &Path) -> Result<ScriptElement> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, &path.display().to_string())
}
