//! Scope-aware application of accumulated rename mappings.
//!
//! Runs once, at the end of a pipeline run, against the pristine original
//! source: all mappings are collected before any mutation, so the output is
//! a pure function of `(source, mappings)` and intra-round ordering cannot
//! leak into it. The pass re-parses the source, recomputes function IDs
//! with the same formula the extractor used, resolves every mapping through
//! the scope tree and splices the resulting byte-span edits into a fresh
//! string. Individual renames that would change behavior (captures,
//! reserved words, unresolvable names) are skipped with a warning rather
//! than applied wrongly.

use std::sync::OnceLock;

use ahash::{AHashMap, AHashSet};
use regex::Regex;
use tree_sitter::Node;

use crate::{
    error::{ParseError, RenameWarning},
    mapping::RenameMapping,
    parse::{extract_functions, parse_tree, walk_subtree, FunctionInfo},
    scope::{BindingId, BindingKind, RefSlot, ScopeId, ScopeTree},
};

/// Result of the final rename pass.
#[derive(Debug)]
pub struct RenameOutcome {
    /// The rewritten source.
    pub source: String,
    /// Non-fatal problems encountered while applying mappings.
    pub warnings: Vec<RenameWarning>,
    /// Count of bindings actually renamed.
    pub applied: usize,
    /// Count of rename entries skipped for safety.
    pub skipped: usize,
}

/// Words that can never be used as an identifier, plus a few names whose
/// shadowing silently changes behavior in sloppy mode.
const RESERVED_WORDS: &[&str] = &[
    "arguments", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false", "finally",
    "for", "function", "if", "import", "in", "instanceof", "let", "new", "null", "return",
    "static", "super", "switch", "this", "throw", "true", "try", "typeof", "undefined", "var",
    "void", "while", "with", "yield",
];

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("valid pattern"))
}

/// Whether `name` can be introduced as a binding without changing meaning.
#[must_use]
pub fn is_safe_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name) && !RESERVED_WORDS.contains(&name)
}

#[derive(Debug)]
struct Edit {
    start: usize,
    end: usize,
    text: String,
}

/// Mutable state of one rename pass: pending edits, safety bookkeeping,
/// and the warning log.
struct PassState<'t> {
    scopes: &'t ScopeTree,
    edits: Vec<Edit>,
    warnings: Vec<RenameWarning>,
    /// Bindings already renamed; the first mapping to touch a binding wins.
    renamed: AHashSet<BindingId>,
    /// New names introduced per declaring scope. A later rename targeting
    /// the same name in a related scope would collide with an edit the
    /// scope tree cannot see yet.
    introduced: AHashMap<ScopeId, AHashSet<String>>,
    applied: usize,
    skipped: usize,
}

impl PassState<'_> {
    /// Whether introducing `new` as a binding of `scope` would collide with
    /// anything: an existing mention in the scope subtree, or a name a
    /// previous rename in an overlapping scope chain already introduced.
    fn collides(&self, scope: ScopeId, new: &str) -> bool {
        if self.scopes.mentions(scope, new) {
            return true;
        }
        self.introduced.iter().any(|(other, names)| {
            names.contains(new)
                && (*other == scope
                    || self.scopes.is_ancestor(*other, scope)
                    || self.scopes.is_ancestor(scope, *other))
        })
    }

    /// Applies one binding rename, emitting a replacement per reference.
    /// Shorthand forms expand so the external name (property key, imported
    /// or exported symbol) survives while the local binding changes.
    fn rename_binding(&mut self, binding_id: BindingId, old: &str, new: &str) {
        let binding = self.scopes.binding(binding_id);
        for reference in &binding.references {
            let text = match reference.slot {
                RefSlot::Plain => new.to_owned(),
                RefSlot::Shorthand => format!("{old}: {new}"),
                RefSlot::ImportLocal => format!("{old} as {new}"),
                RefSlot::ExportLocal => format!("{new} as {old}"),
            };
            self.edits.push(Edit {
                start: reference.start,
                end: reference.end,
                text,
            });
        }
        self.renamed.insert(binding_id);
        self.introduced
            .entry(binding.scope)
            .or_default()
            .insert(new.to_owned());
        self.applied += 1;
    }

    fn skip(&mut self, warning: RenameWarning) {
        self.warnings.push(warning);
        self.skipped += 1;
    }
}

/// Applies the accumulated mappings to `source` and returns the rewritten
/// program.
///
/// The `mappings` key is the stable function ID from extraction; IDs are
/// recomputed here from a fresh parse of the identical source, so they
/// match by construction.
pub fn apply_renames(
    source: &str,
    mappings: &AHashMap<String, RenameMapping>,
    emit_descriptions: bool,
) -> Result<RenameOutcome, ParseError> {
    let tree = parse_tree(source)?;
    let records = extract_functions(&tree, source);
    let scopes = ScopeTree::build(&tree, source);

    // Per-function anchors that need the live tree: the identifier to
    // rename for `functionName`, and the enclosing statement for the
    // description comment.
    let mut name_targets: AHashMap<String, (usize, usize)> = AHashMap::new();
    let mut stmt_anchors: AHashMap<String, usize> = AHashMap::new();
    walk_subtree(tree.root_node(), &mut |node| {
        if !is_function_node_kind(node.kind()) {
            return;
        }
        let span = (node.start_byte(), node.end_byte());
        let Some(record) = records.iter().find(|r| (r.start, r.end) == span) else {
            return;
        };
        if let Some(target) = declaration_name_node(node) {
            name_targets.insert(record.id.clone(), (target.start_byte(), target.end_byte()));
        }
        stmt_anchors.insert(record.id.clone(), enclosing_statement_start(node));
    });

    let mut state = PassState {
        scopes: &scopes,
        edits: Vec::new(),
        warnings: Vec::new(),
        renamed: AHashSet::new(),
        introduced: AHashMap::new(),
        applied: 0,
        skipped: 0,
    };

    // Iterate functions in span order so warnings and edits come out
    // deterministically regardless of map iteration order.
    for record in &records {
        let Some(mapping) = mappings.get(&record.id) else {
            continue;
        };

        apply_body_renames(record, mapping, &mut state);

        if let Some(new_name) = mapping.function_name.as_deref() {
            apply_function_name(record, new_name, name_targets.get(&record.id).copied(), &mut state);
        }

        if emit_descriptions {
            if let Some(description) = mapping.description.as_deref() {
                if let Some(anchor) = stmt_anchors.get(&record.id) {
                    state.edits.push(Edit {
                        start: *anchor,
                        end: *anchor,
                        text: format!("/** {} */\n", sanitize_description(description)),
                    });
                }
            }
        }
    }

    let PassState {
        edits,
        mut warnings,
        applied,
        skipped,
        ..
    } = state;
    let output = splice(source, edits, &mut warnings);

    // Last-line check, not a correctness proof: the caller decides whether
    // a re-parse failure fails the run.
    if let Err(error) = parse_tree(&output) {
        warnings.push(RenameWarning::ReassemblyInvalid {
            message: error.to_string(),
        });
    }

    Ok(RenameOutcome {
        source: output,
        warnings,
        applied,
        skipped,
    })
}

fn apply_body_renames(record: &FunctionInfo, mapping: &RenameMapping, state: &mut PassState<'_>) {
    let Some(fn_scope) = state.scopes.function_scope(record.start, record.end) else {
        return;
    };
    for (old, new) in &mapping.renames {
        if old == new {
            continue;
        }
        if !is_safe_identifier(new) {
            state.skip(RenameWarning::InvalidName {
                function_id: record.id.clone(),
                name: new.clone(),
            });
            continue;
        }
        let candidates = state.scopes.function_bindings(fn_scope, old);
        if candidates.is_empty() {
            state.skip(RenameWarning::UnknownBinding {
                function_id: record.id.clone(),
                old: old.clone(),
            });
            continue;
        }
        for binding_id in candidates {
            if state.renamed.contains(&binding_id) {
                tracing::debug!(
                    function = %record.id,
                    %old,
                    "binding already renamed by an earlier mapping; keeping first"
                );
                continue;
            }
            let scope = state.scopes.binding(binding_id).scope;
            if state.collides(scope, new) {
                state.skip(RenameWarning::Collision {
                    function_id: record.id.clone(),
                    old: old.clone(),
                    new: new.clone(),
                });
                continue;
            }
            state.rename_binding(binding_id, old, new);
        }
    }
}

fn apply_function_name(
    record: &FunctionInfo,
    new_name: &str,
    name_target: Option<(usize, usize)>,
    state: &mut PassState<'_>,
) {
    if new_name.is_empty() || new_name == record.original_name {
        return;
    }
    if !is_safe_identifier(new_name) {
        state.skip(RenameWarning::InvalidName {
            function_id: record.id.clone(),
            name: new_name.to_owned(),
        });
        return;
    }
    // Methods and anonymous property values have no standalone binding;
    // the suggestion is simply dropped there.
    let Some((start, end)) = name_target else {
        tracing::debug!(function = %record.id, "no renameable declaration handle for functionName");
        return;
    };
    let Some(binding_id) = state.scopes.binding_at(start, end) else {
        // An assignment to an undeclared name creates an implicit global;
        // renaming it could detach other files from the same global.
        tracing::debug!(function = %record.id, "declaration name does not resolve to a binding");
        return;
    };
    if state.renamed.contains(&binding_id) {
        return;
    }
    let binding = state.scopes.binding(binding_id);
    if binding.kind == BindingKind::Import {
        // The "declaration" is an import: the real definition lives in
        // another module, where the suggested name means nothing.
        tracing::debug!(function = %record.id, "functionName targets an imported binding; skipped");
        return;
    }
    let (scope, old) = (binding.scope, binding.name.clone());
    if state.collides(scope, new_name) {
        state.skip(RenameWarning::Collision {
            function_id: record.id.clone(),
            old,
            new: new_name.to_owned(),
        });
        return;
    }
    state.rename_binding(binding_id, &old, new_name);
}

/// Applies non-overlapping edits in one left-to-right pass. Overlapping
/// edits cannot be produced by distinct bindings; if one slips through it
/// is dropped and reported rather than corrupting the output.
fn splice(source: &str, mut edits: Vec<Edit>, warnings: &mut Vec<RenameWarning>) -> String {
    edits.sort_by_key(|e| (e.start, e.end));
    let mut out = String::with_capacity(source.len() + source.len() / 8);
    let mut cursor = 0usize;
    for edit in edits {
        if edit.start < cursor {
            warnings.push(RenameWarning::ReassemblyInvalid {
                message: format!("overlapping edit at bytes {}..{} dropped", edit.start, edit.end),
            });
            continue;
        }
        out.push_str(&source[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    out
}

/// Block comments may not contain their own terminator.
fn sanitize_description(description: &str) -> String {
    description.replace("*/", "*\u{2044}").replace(['\r', '\n'], " ")
}

fn is_function_node_kind(kind: &str) -> bool {
    matches!(
        kind,
        "function_declaration"
            | "generator_function_declaration"
            | "function_expression"
            | "generator_function"
            | "arrow_function"
            | "method_definition"
    )
}

/// The identifier node whose binding carries the function's name: the
/// declaration `id`, the enclosing declarator's name, or a plain-identifier
/// assignment target. Member-expression targets and object keys are
/// property names, not bindings, and yield nothing.
fn declaration_name_node<'t>(node: Node<'t>) -> Option<Node<'t>> {
    if matches!(node.kind(), "function_declaration" | "generator_function_declaration") {
        return node.child_by_field_name("name");
    }
    if node.kind() == "method_definition" {
        return None;
    }
    let mut child = node;
    let mut parent = node.parent();
    while let Some(p) = parent {
        if p.kind() == "parenthesized_expression" {
            child = p;
            parent = p.parent();
        } else {
            break;
        }
    }
    let p = parent?;
    match p.kind() {
        "variable_declarator" => {
            let is_init = p.child_by_field_name("value").is_some_and(|v| v.id() == child.id());
            is_init
                .then(|| p.child_by_field_name("name"))
                .flatten()
                .filter(|n| n.kind() == "identifier")
        }
        "assignment_expression" => {
            let is_rhs = p.child_by_field_name("right").is_some_and(|r| r.id() == child.id());
            is_rhs
                .then(|| p.child_by_field_name("left"))
                .flatten()
                .filter(|n| n.kind() == "identifier")
        }
        _ => None,
    }
}

/// Start offset of the statement enclosing `node`, where a description
/// comment can be inserted without splitting an expression.
fn enclosing_statement_start(node: Node<'_>) -> usize {
    let mut current = node;
    while let Some(parent) = current.parent() {
        if matches!(parent.kind(), "program" | "statement_block" | "switch_body" | "class_body") {
            return current.start_byte();
        }
        current = parent;
    }
    current.start_byte()
}
