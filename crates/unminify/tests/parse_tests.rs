use unminify::{parse_functions, FunctionKind};

#[test]
fn extracts_every_function_form() {
    let source = "\
function decl(a) { return a; }
const expr = function (b) { return b; };
const arrow = (c) => c * 2;
class Widget {
    constructor(size) { this.size = size; }
    get size2() { return this.size * 2; }
    set size2(v) { this.size = v / 2; }
    render(ctx) { return ctx; }
}
const obj = { handler(e) { return e; } };
";
    let records = parse_functions(source).expect("source parses");
    let kinds: Vec<FunctionKind> = records.iter().map(|r| r.kind).collect();
    assert!(kinds.contains(&FunctionKind::Declaration));
    assert!(kinds.contains(&FunctionKind::Expression));
    assert!(kinds.contains(&FunctionKind::Arrow));
    assert!(kinds.contains(&FunctionKind::Constructor));
    assert!(kinds.contains(&FunctionKind::Getter));
    assert!(kinds.contains(&FunctionKind::Setter));
    assert!(kinds.contains(&FunctionKind::Method), "object and class methods: {kinds:?}");
}

#[test]
fn infers_names_from_every_handle() {
    let source = "\
function named() {}
const fromDeclarator = function () {};
let assigned;
assigned = () => {};
window.onReady = function () {};
const config = { onLoad: function () {} };
";
    let records = parse_functions(source).expect("source parses");
    let names: Vec<&str> = records.iter().map(|r| r.original_name.as_str()).collect();
    assert!(names.contains(&"named"));
    assert!(names.contains(&"fromDeclarator"));
    assert!(names.contains(&"assigned"));
    assert!(names.contains(&"onReady"), "member assignment uses the property name: {names:?}");
    assert!(names.contains(&"onLoad"), "object pair key: {names:?}");
}

#[test]
fn anonymous_functions_have_empty_names_and_stable_ids() {
    let source = "[1, 2].map(function (v) { return v; });";
    let records = parse_functions(source).expect("source parses");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_name, "");
    let expected = format!("_{}_{}", records[0].start, records[0].end);
    assert_eq!(records[0].id, expected);
}

#[test]
fn parameter_metadata_covers_rest_default_and_patterns() {
    let source = "function f(a, b = 1, ...rest) {} function g({x, y}, [z]) {}";
    let records = parse_functions(source).expect("source parses");
    let f = records.iter().find(|r| r.original_name == "f").expect("f exists");
    assert_eq!(f.params.len(), 3);
    assert_eq!(f.params[0].name, "a");
    assert!(!f.params[0].has_default && !f.params[0].is_rest);
    assert_eq!(f.params[1].name, "b");
    assert!(f.params[1].has_default);
    assert_eq!(f.params[2].name, "rest");
    assert!(f.params[2].is_rest);

    let g = records.iter().find(|r| r.original_name == "g").expect("g exists");
    assert_eq!(g.params.len(), 2);
    assert!(
        g.params.iter().all(|p| p.name.is_empty()),
        "destructuring patterns collapse to empty names"
    );
}

#[test]
fn nesting_resolves_parent_and_children() {
    let source = "function outer() { function inner() { const leaf = () => 1; } }";
    let records = parse_functions(source).expect("source parses");
    let outer = records.iter().find(|r| r.original_name == "outer").expect("outer");
    let inner = records.iter().find(|r| r.original_name == "inner").expect("inner");
    let leaf = records.iter().find(|r| r.original_name == "leaf").expect("leaf");

    assert_eq!(outer.parent_id, None);
    assert_eq!(inner.parent_id.as_deref(), Some(outer.id.as_str()));
    assert_eq!(leaf.parent_id.as_deref(), Some(inner.id.as_str()));
    assert_eq!(outer.child_ids, vec![inner.id.clone()]);
    assert_eq!(inner.child_ids, vec![leaf.id.clone()]);
    assert!(
        outer.start < inner.start && inner.end <= outer.end,
        "parent spans strictly contain children"
    );
}

#[test]
fn callee_collection_follows_the_member_rules() {
    let source = "function f(a) { g(); a.b.c(); a[k](); new Thing(); }";
    let records = parse_functions(source).expect("source parses");
    let f = &records[0];
    assert!(f.callees.contains(&"g".to_owned()));
    assert!(
        f.callees.contains(&"c".to_owned()),
        "member calls contribute the rightmost property: {:?}",
        f.callees
    );
    assert!(
        !f.callees.iter().any(|c| c == "k" || c == "b"),
        "computed member calls contribute nothing: {:?}",
        f.callees
    );
}

#[test]
fn identifier_lists_exclude_property_names() {
    let source = "function f(a) { return { key: a, other: b.prop }; }";
    let records = parse_functions(source).expect("source parses");
    let identifiers = &records[0].identifiers;
    assert!(identifiers.contains(&"a".to_owned()));
    assert!(identifiers.contains(&"b".to_owned()));
    assert!(!identifiers.contains(&"key".to_owned()), "object keys excluded");
    assert!(!identifiers.contains(&"prop".to_owned()), "property names excluded");
}

#[test]
fn async_and_generator_flags() {
    let source = "async function a() {} function* g() {} async () => {};";
    let records = parse_functions(source).expect("source parses");
    let a = records.iter().find(|r| r.original_name == "a").expect("a");
    assert!(a.is_async && !a.is_generator);
    let g = records.iter().find(|r| r.original_name == "g").expect("g");
    assert!(g.is_generator && !g.is_async);
    let arrow = records.iter().find(|r| r.kind == FunctionKind::Arrow).expect("arrow");
    assert!(arrow.is_async);
}

#[test]
fn method_spans_include_the_key() {
    let source = "class C { longMethodName(x) { return x; } }";
    let records = parse_functions(source).expect("source parses");
    let method = records.iter().find(|r| r.kind == FunctionKind::Method).expect("method");
    let text = method.source(source);
    assert!(
        text.starts_with("longMethodName"),
        "method record spans the key: {text:?}"
    );
}

#[test]
fn broken_source_is_a_parse_error() {
    let err = parse_functions("function ((((").expect_err("must not parse");
    assert!(err.to_string().contains("not valid JavaScript"));
}

#[test]
fn ids_are_unique() {
    let source = "function a(){} function a(){} const b = () => () => 0;";
    let records = parse_functions(source).expect("source parses");
    let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    ids.sort_unstable();
    let before = ids.len();
    ids.dedup();
    assert_eq!(before, ids.len(), "IDs must be unique within one source");
}
