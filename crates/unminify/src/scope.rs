//! Lexical scope analysis over the JavaScript syntax tree.
//!
//! Two passes, mirroring how name resolution has to work in the presence of
//! hoisting: pass one walks the tree collecting every binding into a scope
//! arena (`var` and function declarations hoist to the nearest function or
//! program scope, `let`/`const`/`class` bind where they appear, parameters
//! and a function expression's self-name bind in the function scope).
//! Pass two repeats the identical walk and resolves every identifier
//! reference to its declaring binding, or records it as free.
//!
//! The resulting [`ScopeTree`] is a value structure: byte spans only, no
//! syntax-tree references, so the renamer can hold it after the tree is
//! dropped.

use ahash::{AHashMap, AHashSet};
use tree_sitter::{Node, Tree};

/// Index of a scope in the arena.
pub(crate) type ScopeId = usize;
/// Index of a binding in the arena.
pub(crate) type BindingId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    Program,
    Function,
    Block,
    Catch,
    Class,
}

/// What introduced a binding. Drives hoisting and rename eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingKind {
    /// `var` declarator; hoisted to the nearest function or program scope.
    Var,
    /// `let` or `const` declarator; binds in the block where it appears.
    Lexical,
    /// Function declaration name; hoisted like `var`.
    FunctionDecl,
    /// Class declaration name; binds like `let`.
    ClassDecl,
    /// Function parameter (including destructured names).
    Param,
    /// Catch-clause parameter.
    CatchParam,
    /// A function or class expression's own name, visible only inside it.
    SelfName,
    /// Imported local name; binds in the program scope.
    Import,
}

/// How an occurrence is spelled at its site, which decides the replacement
/// text when the binding is renamed. Shorthand forms carry an external name
/// (a property key or a module export) that must survive the rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefSlot {
    /// An ordinary identifier; replaced with the new name as-is.
    Plain,
    /// Object-literal or destructuring shorthand `{a}`; expands to
    /// `a: new` so the property key is preserved.
    Shorthand,
    /// `import {a}` without alias; expands to `a as new` so the imported
    /// symbol stays `a`.
    ImportLocal,
    /// `export {a}` without alias; expands to `new as a` so the exported
    /// symbol stays `a`.
    ExportLocal,
}

/// One occurrence of a binding's name.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reference {
    pub start: usize,
    pub end: usize,
    pub slot: RefSlot,
}

#[derive(Debug)]
pub(crate) struct Binding {
    pub name: String,
    pub kind: BindingKind,
    pub scope: ScopeId,
    /// Every occurrence that resolves to this binding, declaration site
    /// included, in source order.
    pub references: Vec<Reference>,
}

#[derive(Debug)]
pub(crate) struct Scope {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    pub start: usize,
    pub end: usize,
    pub children: Vec<ScopeId>,
    /// Name to binding declared directly in this scope.
    pub bindings: AHashMap<String, BindingId>,
    /// Every name referenced directly in this scope, resolved or free.
    /// Collision checks consult this when validating a suggested new name.
    pub referenced: AHashSet<String>,
}

#[derive(Debug)]
pub(crate) struct ScopeTree {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    /// Reference span to the binding it resolves to.
    ref_index: AHashMap<(usize, usize), BindingId>,
    /// Function-node span to the function scope created for it.
    fn_scopes: AHashMap<(usize, usize), ScopeId>,
}

impl ScopeTree {
    /// Builds the scope tree for a parsed source.
    pub(crate) fn build(tree: &Tree, source: &str) -> Self {
        let mut builder = Builder {
            source,
            scopes: vec![Scope {
                parent: None,
                kind: ScopeKind::Program,
                start: tree.root_node().start_byte(),
                end: tree.root_node().end_byte(),
                children: Vec::new(),
                bindings: AHashMap::new(),
                referenced: AHashSet::new(),
            }],
            bindings: Vec::new(),
            ref_index: AHashMap::new(),
            fn_scopes: AHashMap::new(),
        };
        builder.collect_bindings(tree.root_node(), 0);
        builder.resolve_references(tree.root_node(), 0);
        ScopeTree {
            scopes: builder.scopes,
            bindings: builder.bindings,
            ref_index: builder.ref_index,
            fn_scopes: builder.fn_scopes,
        }
    }

    pub(crate) fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id]
    }

    /// The function scope created for a function node span, if any.
    pub(crate) fn function_scope(&self, start: usize, end: usize) -> Option<ScopeId> {
        self.fn_scopes.get(&(start, end)).copied()
    }

    /// The binding a specific reference span resolves to, if resolved.
    pub(crate) fn binding_at(&self, start: usize, end: usize) -> Option<BindingId> {
        self.ref_index.get(&(start, end)).copied()
    }

    /// Whether `name` is bound or referenced anywhere in the subtree rooted
    /// at `scope`. Used as the conservative collision check before a rename:
    /// if the suggested name is mentioned at all, the rename is skipped.
    pub(crate) fn mentions(&self, scope: ScopeId, name: &str) -> bool {
        let mut stack = vec![scope];
        while let Some(id) = stack.pop() {
            let s = &self.scopes[id];
            if s.bindings.contains_key(name) || s.referenced.contains(name) {
                return true;
            }
            stack.extend(&s.children);
        }
        false
    }

    /// The bindings of `name` that belong to a function's own lexical scope:
    /// bindings declared in the function scope itself or in block scopes
    /// under it, without crossing into nested functions, and not shadowed by
    /// another candidate further out. These are the targets for a `renames`
    /// entry on that function.
    pub(crate) fn function_bindings(&self, fn_scope: ScopeId, name: &str) -> Vec<BindingId> {
        let mut candidates: Vec<BindingId> = Vec::new();
        let mut stack = vec![fn_scope];
        while let Some(id) = stack.pop() {
            let s = &self.scopes[id];
            if id != fn_scope && matches!(s.kind, ScopeKind::Function) {
                continue;
            }
            if let Some(binding) = s.bindings.get(name) {
                candidates.push(*binding);
            }
            stack.extend(&s.children);
        }
        // Drop candidates shadowing another candidate: an inner declaration
        // of the same name stays untouched unless separately mapped.
        let candidate_scopes: Vec<ScopeId> =
            candidates.iter().map(|&c| self.bindings[c].scope).collect();
        candidates
            .iter()
            .copied()
            .filter(|&c| {
                let c_scope = self.bindings[c].scope;
                !candidate_scopes
                    .iter()
                    .any(|&other| other != c_scope && self.is_ancestor(other, c_scope))
            })
            .collect()
    }

    /// Whether `ancestor` lies strictly above `scope` in the tree.
    pub(crate) fn is_ancestor(&self, ancestor: ScopeId, mut scope: ScopeId) -> bool {
        while let Some(parent) = self.scopes[scope].parent {
            if parent == ancestor {
                return true;
            }
            scope = parent;
        }
        false
    }
}

struct Builder<'s> {
    source: &'s str,
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    ref_index: AHashMap<(usize, usize), BindingId>,
    fn_scopes: AHashMap<(usize, usize), ScopeId>,
}

/// Node kinds that open a function scope.
fn is_function_scope_node(kind: &str) -> bool {
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

/// Node kinds that open a block-like scope.
fn block_scope_kind(kind: &str) -> Option<ScopeKind> {
    match kind {
        "statement_block" | "for_statement" | "for_in_statement" | "switch_body" => {
            Some(ScopeKind::Block)
        }
        "catch_clause" => Some(ScopeKind::Catch),
        "class_body" | "class" => Some(ScopeKind::Class),
        _ => None,
    }
}

impl<'s> Builder<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn new_scope(&mut self, parent: ScopeId, kind: ScopeKind, node: Node<'_>) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope {
            parent: Some(parent),
            kind,
            start: node.start_byte(),
            end: node.end_byte(),
            children: Vec::new(),
            bindings: AHashMap::new(),
            referenced: AHashSet::new(),
        });
        self.scopes[parent].children.push(id);
        id
    }

    /// Introduces `name` into `scope`, reusing an existing binding on
    /// re-declaration (`var x` twice, or a parameter shadowed by `var`).
    fn bind(&mut self, scope: ScopeId, name: &str, kind: BindingKind) -> BindingId {
        if let Some(existing) = self.scopes[scope].bindings.get(name) {
            return *existing;
        }
        let id = self.bindings.len();
        self.bindings.push(Binding {
            name: name.to_owned(),
            kind,
            scope,
            references: Vec::new(),
        });
        self.scopes[scope].bindings.insert(name.to_owned(), id);
        id
    }

    /// The nearest enclosing function or program scope, for hoisting.
    fn hoist_target(&self, mut scope: ScopeId) -> ScopeId {
        loop {
            if matches!(self.scopes[scope].kind, ScopeKind::Function | ScopeKind::Program) {
                return scope;
            }
            match self.scopes[scope].parent {
                Some(parent) => scope = parent,
                None => return scope,
            }
        }
    }

    // ----- pass one: bindings -------------------------------------------

    fn collect_bindings(&mut self, node: Node<'_>, scope: ScopeId) {
        let mut inner_scope = scope;

        if is_function_scope_node(node.kind()) {
            inner_scope = self.new_scope(scope, ScopeKind::Function, node);
            self.fn_scopes
                .insert((node.start_byte(), node.end_byte()), inner_scope);
            // A named function expression's own name is visible only inside.
            if matches!(node.kind(), "function_expression" | "generator_function") {
                if let Some(name) = node.child_by_field_name("name") {
                    let text = self.text(name).to_owned();
                    self.bind(inner_scope, &text, BindingKind::SelfName);
                }
            }
            self.bind_parameters(node, inner_scope);
        } else if let Some(kind) = block_scope_kind(node.kind()) {
            inner_scope = self.new_scope(scope, kind, node);
            if node.kind() == "class" {
                if let Some(name) = node.child_by_field_name("name") {
                    let text = self.text(name).to_owned();
                    self.bind(inner_scope, &text, BindingKind::SelfName);
                }
            }
            if node.kind() == "catch_clause" {
                if let Some(param) = node.child_by_field_name("parameter") {
                    for ident in pattern_identifiers(param) {
                        let text = self.text(ident).to_owned();
                        self.bind(inner_scope, &text, BindingKind::CatchParam);
                    }
                }
            }
        }

        match node.kind() {
            "variable_declarator" => {
                let lexical = node
                    .parent()
                    .is_some_and(|p| p.kind() == "lexical_declaration");
                if let Some(name) = node.child_by_field_name("name") {
                    let (target, kind) = if lexical {
                        (inner_scope, BindingKind::Lexical)
                    } else {
                        (self.hoist_target(inner_scope), BindingKind::Var)
                    };
                    for ident in pattern_identifiers(name) {
                        let text = self.text(ident).to_owned();
                        self.bind(target, &text, kind);
                    }
                }
            }
            "function_declaration" | "generator_function_declaration" => {
                // Sloppy-mode hoisting: the name is visible from the nearest
                // function scope so calls before or outside the block still
                // resolve to the same binding.
                if let Some(name) = node.child_by_field_name("name") {
                    let text = self.text(name).to_owned();
                    let target = self.hoist_target(scope);
                    self.bind(target, &text, BindingKind::FunctionDecl);
                }
            }
            "class_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let text = self.text(name).to_owned();
                    self.bind(scope, &text, BindingKind::ClassDecl);
                }
            }
            "import_statement" => {
                self.bind_imports(node);
            }
            _ => {}
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            self.collect_bindings(child, inner_scope);
        }
    }

    fn bind_parameters(&mut self, node: Node<'_>, fn_scope: ScopeId) {
        if let Some(single) = node.child_by_field_name("parameter") {
            for ident in pattern_identifiers(single) {
                let text = self.text(ident).to_owned();
                self.bind(fn_scope, &text, BindingKind::Param);
            }
        }
        if let Some(params) = node.child_by_field_name("parameters") {
            for ident in pattern_identifiers(params) {
                let text = self.text(ident).to_owned();
                self.bind(fn_scope, &text, BindingKind::Param);
            }
        }
    }

    fn bind_imports(&mut self, node: Node<'_>) {
        // Imported locals always land in the program scope.
        let Some(clause) = node
            .named_children(&mut node.walk())
            .find(|c| c.kind() == "import_clause")
        else {
            return;
        };
        let mut locals: Vec<String> = Vec::new();
        let mut stack = vec![clause];
        while let Some(n) = stack.pop() {
            match n.kind() {
                "identifier" => locals.push(self.text(n).to_owned()),
                "import_specifier" => {
                    // `{a as b}` binds b; `{a}` binds a.
                    let local = n
                        .child_by_field_name("alias")
                        .or_else(|| n.child_by_field_name("name"));
                    if let Some(local) = local {
                        locals.push(self.text(local).to_owned());
                    }
                }
                _ => {
                    let mut cursor = n.walk();
                    let children: Vec<Node<'_>> = n.children(&mut cursor).collect();
                    stack.extend(children);
                }
            }
        }
        for name in locals {
            self.bind(0, &name, BindingKind::Import);
        }
    }

    // ----- pass two: references -----------------------------------------

    fn resolve_references(&mut self, node: Node<'_>, scope: ScopeId) {
        // Re-derive the scope entered in pass one; spans are unique per node
        // so the lookup is exact.
        let mut inner_scope = scope;
        if is_function_scope_node(node.kind()) || block_scope_kind(node.kind()).is_some() {
            let span = (node.start_byte(), node.end_byte());
            inner_scope = self
                .fn_scopes
                .get(&span)
                .copied()
                .or_else(|| self.find_child_scope(scope, span))
                .unwrap_or(scope);
        }

        match node.kind() {
            "identifier" => {
                if let Some(slot) = identifier_slot(node) {
                    self.record_reference(node, inner_scope, slot);
                }
            }
            "shorthand_property_identifier" | "shorthand_property_identifier_pattern" => {
                self.record_reference(node, inner_scope, RefSlot::Shorthand);
            }
            _ => {}
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            self.resolve_references(child, inner_scope);
        }
    }

    fn find_child_scope(&self, parent: ScopeId, span: (usize, usize)) -> Option<ScopeId> {
        self.scopes[parent]
            .children
            .iter()
            .copied()
            .find(|&c| (self.scopes[c].start, self.scopes[c].end) == span)
    }

    fn record_reference(&mut self, node: Node<'_>, scope: ScopeId, slot: RefSlot) {
        let name = self.text(node).to_owned();
        self.scopes[scope].referenced.insert(name.clone());
        if let Some(binding) = self.lookup(scope, &name) {
            let reference = Reference {
                start: node.start_byte(),
                end: node.end_byte(),
                slot,
            };
            self.bindings[binding].references.push(reference);
            self.ref_index
                .insert((node.start_byte(), node.end_byte()), binding);
        }
    }

    fn lookup(&self, scope: ScopeId, name: &str) -> Option<BindingId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if let Some(binding) = self.scopes[id].bindings.get(name) {
                return Some(*binding);
            }
            current = self.scopes[id].parent;
        }
        None
    }
}

/// Classifies an identifier occurrence, or `None` when the position names
/// an external symbol rather than a local variable. Property names, object
/// keys and labels are distinct node kinds and never reach this check.
fn identifier_slot(node: Node<'_>) -> Option<RefSlot> {
    let Some(parent) = node.parent() else {
        return Some(RefSlot::Plain);
    };
    match parent.kind() {
        "import_specifier" => {
            let aliased = parent.child_by_field_name("alias").is_some();
            let is_name = parent
                .child_by_field_name("name")
                .is_some_and(|n| n.id() == node.id());
            if is_name && aliased {
                // In `import {a as b}` the name half is the external symbol.
                None
            } else if is_name {
                Some(RefSlot::ImportLocal)
            } else {
                Some(RefSlot::Plain)
            }
        }
        "export_specifier" => {
            let aliased = parent.child_by_field_name("alias").is_some();
            let is_name = parent
                .child_by_field_name("name")
                .is_some_and(|n| n.id() == node.id());
            if !is_name {
                // In `export {a as b}` the alias is the external symbol.
                None
            } else if aliased {
                Some(RefSlot::Plain)
            } else {
                Some(RefSlot::ExportLocal)
            }
        }
        _ => Some(RefSlot::Plain),
    }
}

/// Collects the identifier nodes that introduce bindings inside a
/// declaration pattern: plain identifiers, destructuring shorthands, rest
/// and default patterns. Pattern *keys* (`{key: value}`) are property
/// names, not bindings, and are excluded by walking only value positions.
fn pattern_identifiers(pattern: Node<'_>) -> Vec<Node<'_>> {
    let mut out = Vec::new();
    let mut stack = vec![pattern];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "identifier" | "shorthand_property_identifier_pattern" => out.push(node),
            "pair_pattern" => {
                if let Some(value) = node.child_by_field_name("value") {
                    stack.push(value);
                }
            }
            "assignment_pattern" | "object_assignment_pattern" => {
                if let Some(left) = node.child_by_field_name("left") {
                    stack.push(left);
                }
            }
            "object_pattern" | "array_pattern" | "rest_pattern" | "formal_parameters" => {
                let mut cursor = node.walk();
                let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
                stack.extend(children);
            }
            _ => {}
        }
    }
    out.sort_by_key(tree_sitter::Node::start_byte);
    out
}
