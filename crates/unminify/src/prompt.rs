//! Prompt assembly for the rename oracle.
//!
//! The advisory channel deserves care: known renames are injected into the
//! *prompt text* as a leading comment, never into the source itself, and
//! every name passing through is filtered to safe identifier characters so
//! unusual source content cannot smuggle instructions into the prompt.

use std::fmt::Write as _;

use crate::{
    mapping::KnownNames,
    parse::FunctionInfo,
    rename::is_safe_identifier,
};

/// Fixed system prompt. The oracle must answer with nothing but the JSON
/// object; the response parser tolerates a Markdown fence around it but
/// nothing else.
pub(crate) const SYSTEM_PROMPT: &str = "\
You are an expert reverse engineer renaming identifiers in minified \
JavaScript. For each function you are given, choose descriptive, \
conventional camelCase names for the function itself and for the local \
identifiers listed with it. Never suggest a name that changes behavior: \
do not rename property accesses, and keep distinct identifiers distinct.

Reply with ONLY a JSON object of the form:
{\"<function id>\": {\"functionName\": \"...\", \"description\": \"...\", \
\"renames\": {\"<old>\": \"<new>\", ...}}, ...}

Omit functionName or description when you have nothing useful to say. \
Do not add any other fields or any prose outside the JSON object.";

/// The advisory comment for one function: the known renames whose old name
/// the function actually calls. `None` when nothing applies.
pub(crate) fn advisory_comment(record: &FunctionInfo, known: &KnownNames) -> Option<String> {
    let mut pairs: Vec<String> = Vec::new();
    for callee in &record.callees {
        if let Some(new) = known.get(callee) {
            if is_safe_identifier(callee) && is_safe_identifier(new) && callee != new {
                pairs.push(format!("{callee} -> {new}"));
            }
        }
    }
    if pairs.is_empty() {
        None
    } else {
        Some(format!("// Calls: {}", pairs.join(", ")))
    }
}

/// One function's section of the user prompt: its ID, kind, identifier
/// list, and advisory-annotated source.
pub(crate) fn function_section(record: &FunctionInfo, source: &str, known: &KnownNames) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "### {} ({})", record.id, record.kind);
    let identifiers: Vec<&str> = record
        .identifiers
        .iter()
        .map(String::as_str)
        .filter(|name| is_safe_identifier(name))
        .collect();
    if !identifiers.is_empty() {
        let _ = writeln!(out, "Identifiers: {}", identifiers.join(", "));
    }
    out.push_str("```js\n");
    if let Some(comment) = advisory_comment(record, known) {
        out.push_str(&comment);
        out.push('\n');
    }
    out.push_str(record.source(source));
    out.push_str("\n```\n");
    out
}

/// The complete user prompt for one batch.
pub(crate) fn build_user_prompt(
    batch: &[FunctionInfo],
    source: &str,
    known: &KnownNames,
) -> String {
    let mut out = String::from(
        "Rename the identifiers in the following functions. Use the function \
         IDs exactly as given as the keys of your JSON reply.\n\n",
    );
    for record in batch {
        out.push_str(&function_section(record, source, known));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_functions;

    #[test]
    fn advisory_names_only_called_renames() {
        let source = "function a(){return b()+c;}";
        let records = parse_functions(source).expect("parses");
        let mut known = KnownNames::new();
        known.insert("b".to_owned(), "buildList".to_owned());
        known.insert("c".to_owned(), "count".to_owned());
        let comment = advisory_comment(&records[0], &known).expect("b is called");
        assert_eq!(comment, "// Calls: b -> buildList");
    }

    #[test]
    fn advisory_filters_unsafe_names() {
        let source = "function a(){return b();}";
        let records = parse_functions(source).expect("parses");
        let mut known = KnownNames::new();
        known.insert("b".to_owned(), "ignore//injection".to_owned());
        assert_eq!(advisory_comment(&records[0], &known), None);
    }
}
