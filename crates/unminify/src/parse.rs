//! JavaScript parsing and function extraction.
//!
//! Wraps the tree-sitter JavaScript grammar and produces the function
//! inventory the rest of the pipeline operates on: one [`FunctionInfo`]
//! record per function-like node, carrying value types only (IDs, byte
//! spans, names). No syntax-tree references escape this module, which is
//! what allows the final rename pass to re-parse the pristine source and
//! relocate every function by recomputing the same IDs.

use ahash::AHashSet;
use tree_sitter::{Node, Parser, Tree};

use crate::error::ParseError;

/// Syntactic kind of an extracted function.
///
/// Minified bundles mix all seven forms freely; the kind matters to the
/// renamer (methods have no standalone binding to rename) and to the prompt
/// builder (the oracle is told what shape each function has).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FunctionKind {
    /// `function f() {}` or `function* f() {}` at statement level.
    Declaration,
    /// `function () {}` / `function f() {}` in expression position.
    Expression,
    /// `() => {}` or `x => x`.
    Arrow,
    /// A class or object method.
    Method,
    /// A class `constructor()`.
    Constructor,
    /// A `get x()` accessor.
    Getter,
    /// A `set x(v)` accessor.
    Setter,
}

/// One declared parameter of a function.
///
/// Destructuring patterns collapse to an empty name; the rename engine
/// treats empty-name parameters as non-renameable (their inner identifiers
/// are still ordinary bindings and can be renamed through the scope engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    /// The parameter name, or empty for destructuring patterns.
    pub name: String,
    /// Whether the parameter has a default initializer (`x = e`).
    pub has_default: bool,
    /// Whether the parameter is a rest parameter (`...x`).
    pub is_rest: bool,
}

/// One parsed function with stable identity and call metadata.
///
/// The ID is `name_start_end` where `start`/`end` are byte offsets in the
/// original source. Because the source is never edited during a run, IDs
/// computed by the extractor remain valid for the final rename pass.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Stable identifier, `name_start_end`.
    pub id: String,
    /// Syntactic kind.
    pub kind: FunctionKind,
    /// Inferred original name; empty for anonymous forms with no handle.
    pub original_name: String,
    /// Start byte offset in the original source (inclusive).
    pub start: usize,
    /// End byte offset in the original source (exclusive).
    pub end: usize,
    /// Declared parameters in order.
    pub params: Vec<ParamInfo>,
    /// Whether the function is `async`.
    pub is_async: bool,
    /// Whether the function is a generator.
    pub is_generator: bool,
    /// ID of the innermost enclosing function, or `None` for roots.
    pub parent_id: Option<String>,
    /// IDs of directly nested functions, in span order.
    pub child_ids: Vec<String>,
    /// Names appearing in call position anywhere in the body, deduplicated
    /// in first-occurrence order.
    pub callees: Vec<String>,
    /// All referenced identifiers in the body (excluding member-access
    /// property names and non-computed object keys), deduplicated in
    /// first-occurrence order.
    pub identifiers: Vec<String>,
}

impl FunctionInfo {
    /// Formats the stable function ID from its parts.
    ///
    /// Both the extractor and the renamer go through this, so the two
    /// passes agree on identity by construction.
    #[must_use]
    pub fn format_id(name: &str, start: usize, end: usize) -> String {
        format!("{name}_{start}_{end}")
    }

    /// The function's source text.
    ///
    /// # Panics
    /// Panics if the span is out of bounds for `source`, which only happens
    /// when the record is paired with a different source string than the
    /// one it was extracted from.
    #[must_use]
    pub fn source<'s>(&self, source: &'s str) -> &'s str {
        &source[self.start..self.end]
    }
}

/// Parses JavaScript source into a syntax tree.
///
/// The grammar accepts both module and script forms with a single entry
/// point. A tree containing syntax errors is rejected: nothing downstream
/// can rename code it cannot fully resolve.
pub(crate) fn parse_tree(source: &str) -> Result<Tree, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_javascript::LANGUAGE.into())
        .map_err(|e| ParseError {
            offset: None,
            line: None,
            message: format!("failed to load JavaScript grammar: {e}"),
        })?;
    let tree = parser.parse(source, None).ok_or_else(|| ParseError {
        offset: None,
        line: None,
        message: "parser returned no tree".to_owned(),
    })?;
    if tree.root_node().has_error() {
        let (offset, line) = first_error_position(tree.root_node());
        return Err(ParseError {
            offset,
            line,
            message: "source is not valid JavaScript".to_owned(),
        });
    }
    Ok(tree)
}

/// Locates the first ERROR or MISSING node for error reporting.
fn first_error_position(root: Node<'_>) -> (Option<usize>, Option<usize>) {
    let mut found = None;
    walk_subtree(root, &mut |node| {
        if found.is_none() && (node.is_error() || node.is_missing()) {
            found = Some((node.start_byte(), node.start_position().row + 1));
        }
    });
    match found {
        Some((offset, line)) => (Some(offset), Some(line)),
        None => (None, None),
    }
}

/// Extracts the complete function inventory from `source`.
///
/// Records are returned in preorder (outer functions before the functions
/// they contain), with parent/child links resolved.
pub fn parse_functions(source: &str) -> Result<Vec<FunctionInfo>, ParseError> {
    let tree = parse_tree(source)?;
    Ok(extract_functions(&tree, source))
}

/// Extracts function records from an already-parsed tree.
///
/// Shared with the renamer, which re-parses the pristine source and needs
/// the identical inventory to relocate mappings by ID.
pub(crate) fn extract_functions(tree: &Tree, source: &str) -> Vec<FunctionInfo> {
    // Pass 1: allocate a record per function-like node.
    let mut nodes: Vec<Node<'_>> = Vec::new();
    walk_subtree(tree.root_node(), &mut |node| {
        if is_function_node(node.kind()) {
            nodes.push(node);
        }
    });

    let mut records: Vec<FunctionInfo> = Vec::with_capacity(nodes.len());
    for node in &nodes {
        records.push(extract_record(*node, source));
    }

    // Pass 2: callee names and referenced identifiers per function body.
    for (record, node) in records.iter_mut().zip(&nodes) {
        let (callees, identifiers) = collect_body_names(*node, source);
        record.callees = callees;
        record.identifiers = identifiers;
    }

    resolve_parents(&mut records);
    records
}

/// Whether a tree-sitter node kind is one of the seven function forms.
fn is_function_node(kind: &str) -> bool {
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

fn extract_record(node: Node<'_>, source: &str) -> FunctionInfo {
    let kind = classify(node, source);
    let original_name = infer_name(node, source);
    // Method records span the whole `method_definition` node, key included,
    // so replacement tooling sees the full method site.
    let start = node.start_byte();
    let end = node.end_byte();
    FunctionInfo {
        id: FunctionInfo::format_id(&original_name, start, end),
        kind,
        original_name,
        start,
        end,
        params: extract_params(node, source),
        is_async: has_token_child(node, "async"),
        is_generator: matches!(
            node.kind(),
            "generator_function_declaration" | "generator_function"
        ) || has_token_child(node, "*"),
        parent_id: None,
        child_ids: Vec::new(),
        callees: Vec::new(),
        identifiers: Vec::new(),
    }
}

fn classify(node: Node<'_>, source: &str) -> FunctionKind {
    match node.kind() {
        "function_declaration" | "generator_function_declaration" => FunctionKind::Declaration,
        "arrow_function" => FunctionKind::Arrow,
        "method_definition" => {
            if has_token_child(node, "get") {
                FunctionKind::Getter
            } else if has_token_child(node, "set") {
                FunctionKind::Setter
            } else if in_class_body(node) && node_field_text(node, "name", source) == Some("constructor") {
                FunctionKind::Constructor
            } else {
                FunctionKind::Method
            }
        }
        _ => FunctionKind::Expression,
    }
}

fn in_class_body(node: Node<'_>) -> bool {
    node.parent().is_some_and(|p| p.kind() == "class_body")
}

/// Checks for an anonymous token child such as `async`, `get`, `set` or `*`.
///
/// The token is only a marker when it is not the node's `name` field (so a
/// method actually named `get` is not misread as a getter).
fn has_token_child(node: Node<'_>, token: &str) -> bool {
    let name_field = node.child_by_field_name("name");
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.kind() == token && name_field.is_none_or(|n| n.id() != child.id()) {
            return true;
        }
        // Marker tokens only appear before the parameter list.
        if child.kind() == "formal_parameters" {
            break;
        }
    }
    false
}

fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

fn node_field_text<'s>(node: Node<'_>, field: &str, source: &'s str) -> Option<&'s str> {
    node.child_by_field_name(field).map(|n| node_text(n, source))
}

/// Infers the original name of a function, in priority order:
/// explicit declaration id, enclosing declarator, assignment target,
/// object-property key, method key, then empty.
fn infer_name(node: Node<'_>, source: &str) -> String {
    if matches!(node.kind(), "function_declaration" | "generator_function_declaration") {
        if let Some(name) = node_field_text(node, "name", source) {
            return name.to_owned();
        }
    }
    if node.kind() == "method_definition" {
        if let Some(key) = node.child_by_field_name("name") {
            if key.kind() == "property_identifier" {
                return node_text(key, source).to_owned();
            }
        }
        return String::new();
    }

    // Climb through parentheses so `const f = (function () {})` still
    // reaches its declarator.
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
    let Some(p) = parent else {
        return String::new();
    };

    match p.kind() {
        "variable_declarator" => {
            let is_init = p.child_by_field_name("value").is_some_and(|v| v.id() == child.id());
            if is_init {
                if let Some(name) = p.child_by_field_name("name") {
                    if name.kind() == "identifier" {
                        return node_text(name, source).to_owned();
                    }
                }
            }
            String::new()
        }
        "assignment_expression" => {
            let is_rhs = p.child_by_field_name("right").is_some_and(|r| r.id() == child.id());
            if !is_rhs {
                return String::new();
            }
            match p.child_by_field_name("left") {
                Some(left) if left.kind() == "identifier" => node_text(left, source).to_owned(),
                Some(left) if left.kind() == "member_expression" => {
                    match left.child_by_field_name("property") {
                        Some(prop) if prop.kind() == "property_identifier" => {
                            node_text(prop, source).to_owned()
                        }
                        _ => String::new(),
                    }
                }
                _ => String::new(),
            }
        }
        "pair" => {
            let is_value = p.child_by_field_name("value").is_some_and(|v| v.id() == child.id());
            if is_value {
                if let Some(key) = p.child_by_field_name("key") {
                    if key.kind() == "property_identifier" {
                        return node_text(key, source).to_owned();
                    }
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

fn extract_params(node: Node<'_>, source: &str) -> Vec<ParamInfo> {
    // Single-identifier arrow parameter: `x => x * 2`.
    if let Some(single) = node.child_by_field_name("parameter") {
        if single.kind() == "identifier" {
            return vec![ParamInfo {
                name: node_text(single, source).to_owned(),
                has_default: false,
                is_rest: false,
            }];
        }
    }
    let Some(params) = node.child_by_field_name("parameters") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut cursor = params.walk();
    for child in params.named_children(&mut cursor) {
        match child.kind() {
            "identifier" => out.push(ParamInfo {
                name: node_text(child, source).to_owned(),
                has_default: false,
                is_rest: false,
            }),
            "assignment_pattern" => {
                let name = child
                    .child_by_field_name("left")
                    .filter(|l| l.kind() == "identifier")
                    .map(|l| node_text(l, source).to_owned())
                    .unwrap_or_default();
                out.push(ParamInfo {
                    name,
                    has_default: true,
                    is_rest: false,
                });
            }
            "rest_pattern" => {
                let name = {
                    let mut inner = child.walk();
                    child
                        .named_children(&mut inner)
                        .find(|c| c.kind() == "identifier")
                        .map(|c| node_text(c, source).to_owned())
                        .unwrap_or_default()
                };
                out.push(ParamInfo {
                    name,
                    has_default: false,
                    is_rest: true,
                });
            }
            "object_pattern" | "array_pattern" => out.push(ParamInfo {
                name: String::new(),
                has_default: false,
                is_rest: false,
            }),
            _ => {}
        }
    }
    out
}

/// Collects callee names and referenced identifiers for one function body.
fn collect_body_names(node: Node<'_>, source: &str) -> (Vec<String>, Vec<String>) {
    let mut callees = Vec::new();
    let mut seen_callees: AHashSet<&str> = AHashSet::new();
    let mut identifiers = Vec::new();
    let mut seen_idents: AHashSet<&str> = AHashSet::new();

    walk_subtree(node, &mut |n| {
        match n.kind() {
            "call_expression" => {
                if let Some(name) = callee_name(n, source) {
                    if seen_callees.insert(name) {
                        callees.push(name.to_owned());
                    }
                }
            }
            // Plain identifier references and object-literal shorthand both
            // name a variable; property names and non-computed keys are
            // different node kinds and are skipped by construction.
            "identifier" | "shorthand_property_identifier" => {
                let text = node_text(n, source);
                if seen_idents.insert(text) {
                    identifiers.push(text.to_owned());
                }
            }
            _ => {}
        }
    });
    (callees, identifiers)
}

/// The name contributed by one call expression: the callee identifier for a
/// direct call, or the rightmost non-computed property for a member call.
/// Computed member calls contribute nothing.
fn callee_name<'s>(call: Node<'_>, source: &'s str) -> Option<&'s str> {
    let mut func = call.child_by_field_name("function")?;
    while func.kind() == "parenthesized_expression" {
        func = func.named_child(0)?;
    }
    match func.kind() {
        "identifier" => Some(node_text(func, source)),
        "member_expression" => {
            let prop = func.child_by_field_name("property")?;
            (prop.kind() == "property_identifier").then(|| node_text(prop, source))
        }
        _ => None,
    }
}

/// Links each record to its innermost strict container.
///
/// Quadratic on function count, which is bounded by source size; the
/// simplicity is worth more than the asymptotics here.
fn resolve_parents(records: &mut [FunctionInfo]) {
    let spans: Vec<(usize, usize, String)> = records
        .iter()
        .map(|r| (r.start, r.end, r.id.clone()))
        .collect();
    for i in 0..records.len() {
        let (start, end) = (records[i].start, records[i].end);
        let mut best: Option<usize> = None;
        for (j, (js, je, _)) in spans.iter().enumerate() {
            if i == j {
                continue;
            }
            let contains = *js <= start && end <= *je && (*js, *je) != (start, end);
            if contains {
                let tighter = match best {
                    Some(b) => {
                        let (bs, be) = (spans[b].0, spans[b].1);
                        *je - *js < be - bs
                    }
                    None => true,
                };
                if tighter {
                    best = Some(j);
                }
            }
        }
        if let Some(b) = best {
            records[i].parent_id = Some(spans[b].2.clone());
        }
    }
    // Invert for child lists, preserving span order.
    for i in 0..records.len() {
        let Some(parent_id) = records[i].parent_id.clone() else {
            continue;
        };
        let child_id = records[i].id.clone();
        if let Some(parent) = records.iter_mut().find(|r| r.id == parent_id) {
            parent.child_ids.push(child_id);
        }
    }
}

/// Iterative preorder walk; explicit stack so pathological nesting in
/// minified input cannot overflow the call stack.
pub(crate) fn walk_subtree<'t>(node: Node<'t>, visit: &mut impl FnMut(Node<'t>)) {
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        visit(n);
        let mut cursor = n.walk();
        let children: Vec<Node<'t>> = n.children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }
}
