use indexmap::IndexMap;

use crate::ast::{ExprKind, Field, Literal, Proposition, Rule, Value};
use crate::error::CompileError;
use crate::parser::{parse_expression, parse_program, FileParser};
use crate::rewrite;
use crate::source::Span;
use crate::traverse::{is_whole, remove_comments, split, split_raw, strip};
use crate::universe::Universe;

fn span(text: &str) -> Span {
    Span::new(text.to_string())
}

fn parse_rules(program: &str) -> Vec<Rule> {
    parse_program(program).expect("program parses").rules
}

fn universe_of(program: &str) -> Universe {
    let unit = parse_program(program).expect("program parses");
    Universe::new(unit, IndexMap::new(), None).expect("universe builds")
}

//
// Traverser and splitter.
//

#[test]
fn split_respects_brackets() {
    let parts = split(&span("[a,b],[c,d]"), ",").unwrap();
    let texts: Vec<&str> = parts.iter().map(|p| p.text()).collect();
    assert_eq!(texts, vec!["[a,b]", "[c,d]"]);
}

#[test]
fn split_respects_strings_and_comments() {
    let source = remove_comments("P(\"a;b\"); # comment; with semicolons\nQ(x);").unwrap();
    let parts = split(&span(&source), ";").unwrap();
    let texts: Vec<&str> = parts.iter().map(|p| p.text()).collect();
    assert_eq!(texts, vec!["P(\"a;b\")", "Q(x)", ""]);
}

#[test]
fn split_does_not_tear_double_pipe() {
    let parts = split_raw(&span("a || b"), "|").unwrap();
    assert_eq!(parts.len(), 1);
    let parts = split_raw(&span("a | b"), "|").unwrap();
    assert_eq!(parts.len(), 2);
}

#[test]
fn split_word_separators_need_boundaries() {
    // `in` inside an identifier must not split.
    let parts = split(&span("winter in seasons"), "in").unwrap();
    let texts: Vec<&str> = parts.iter().map(|p| p.text()).collect();
    assert_eq!(texts, vec!["winter", "seasons"]);
}

#[test]
fn split_soundness() {
    // Concatenating raw parts with the separator reproduces the input.
    for (text, sep) in [
        ("a, f(b, c), [d, e]", ","),
        ("P(x) :- Q(x), R(x)", ":-"),
        ("a | b | c", "|"),
    ] {
        let parts = split_raw(&span(text), sep).unwrap();
        let rejoined = parts.iter().map(|p| p.text()).collect::<Vec<_>>().join(sep);
        assert_eq!(rejoined, text);
    }
}

#[test]
fn strip_unwraps_redundant_parentheses() {
    assert_eq!(strip(&span("  ((a + b)) ")).text(), "a + b");
    // Not whole without the outer parens: must not unwrap.
    assert_eq!(strip(&span("(a) + (b)")).text(), "(a) + (b)");
}

#[test]
fn is_whole_requires_clean_state() {
    assert!(is_whole(&span("f(x, [1, 2])")));
    assert!(!is_whole(&span("f(x")));
    assert!(!is_whole(&span("\"unterminated")));
}

#[test]
fn unmatched_parenthesis_is_an_error() {
    let err = parse_program("P(x)) :- Q(x);").unwrap_err();
    assert!(err.to_string().contains("Parenthesis matches nothing"));
}

#[test]
fn newline_in_string_is_an_error() {
    let err = parse_program("P(\"a\nb\");").unwrap_err();
    assert!(err.to_string().contains("End of line in string"));
}

//
// Expression parsing.
//

#[test]
fn heritage_round_trip() {
    let text = "Price(item:, cost? += n * 2) distinct :- Sale(item:, n:)";
    let buffer = span(text);
    let (rule, _) = crate::parser::parse_rule(&buffer).unwrap();
    assert_eq!(rule.full_text.text(), text);
    // Heritage of any expression is the exact source substring.
    let fv = &rule.head.record.field_values[1];
    match &fv.value {
        Value::Aggregation { argument, .. } => {
            let h = &argument.heritage;
            assert_eq!(h.text(), "n * 2");
            assert_eq!(&h.buffer()[h.start()..h.end()], "n * 2");
        }
        other => panic!("expected aggregation, got {other:?}"),
    }
}

#[test]
fn infix_precedence_is_left_associative() {
    let e = parse_expression(&span("a - b - c")).unwrap();
    match e.kind {
        ExprKind::Call(call) => {
            assert_eq!(call.predicate_name, "-");
            let left = call.record.field_values[0].value.as_expr().unwrap();
            assert_eq!(left.heritage.text(), "a - b");
        }
        other => panic!("expected call, got {other:?}"),
    }
}

#[test]
fn multiplication_binds_tighter_than_addition() {
    let e = parse_expression(&span("a + b * c")).unwrap();
    match e.kind {
        ExprKind::Call(call) => {
            assert_eq!(call.predicate_name, "+");
            let right = call.record.field_values[1].value.as_expr().unwrap();
            assert_eq!(right.heritage.text(), "b * c");
        }
        other => panic!("expected call, got {other:?}"),
    }
}

#[test]
fn unary_minus_parses() {
    let e = parse_expression(&span("-x")).unwrap();
    match e.kind {
        ExprKind::Call(call) => assert_eq!(call.predicate_name, "-"),
        other => panic!("expected call, got {other:?}"),
    }
}

#[test]
fn record_field_forms() {
    let rules = parse_rules("P(a, b: 1, c:, d? Max= e, ..rest);");
    let record = &rules[0].head.record;
    assert_eq!(record.field_values[0].field, Field::Positional(0));
    assert_eq!(record.field_values[1].field, Field::Named("b".to_string()));
    // Shorthand `c:` binds the variable of the same name.
    let c = record.field_values[2].value.as_expr().unwrap();
    assert_eq!(c.as_variable(), Some("c"));
    assert!(record.field_values[3].value.is_aggregated());
    assert_eq!(record.field_values[4].field, Field::Splat);
    assert_eq!(record.field_values[4].except, vec!["col0", "b", "c", "d"]);
}

#[test]
fn splat_must_be_last() {
    let err = parse_program("P(..r, a);").unwrap_err();
    assert!(err.to_string().contains("must go last"));
}

#[test]
fn positional_after_named_is_an_error() {
    let err = parse_program("P(a: 1, b);").unwrap_err();
    assert!(err.to_string().contains("Positional argument"));
}

#[test]
fn reserved_variable_prefix_is_rejected() {
    let err = parse_program("P(x_1);").unwrap_err();
    assert!(err.to_string().contains("reserved"));
}

#[test]
fn combine_expression_parses() {
    let e = parse_expression(&span("combine Max= x :- Q(x)")).unwrap();
    match e.kind {
        ExprKind::Combine(rule) => {
            assert_eq!(rule.predicate_name(), "Combine");
            assert!(rule.distinct_denoted);
            assert_eq!(rule.body.as_ref().unwrap().len(), 1);
        }
        other => panic!("expected combine, got {other:?}"),
    }
}

#[test]
fn concise_combine_is_sugar_for_combine() {
    let rules = parse_rules("P(total:) :- total List= x, Q(x);");
    let body = rules[0].body.as_ref().unwrap();
    match &body[0] {
        Proposition::Unification { right, .. } => {
            assert!(matches!(right.kind, ExprKind::Combine(_)));
        }
        other => panic!("expected unification, got {other:?}"),
    }
}

#[test]
fn implication_parses() {
    let e = parse_expression(&span("if a then 1 else if b then 2 else 3")).unwrap();
    match e.kind {
        ExprKind::Implication(implication) => {
            assert_eq!(implication.if_thens.len(), 2);
            assert_eq!(implication.otherwise.heritage.text(), "3");
        }
        other => panic!("expected implication, got {other:?}"),
    }
}

#[test]
fn implication_is_not_a_proposition() {
    let err = parse_program("P(x) :- if a then b else c;").unwrap_err();
    assert!(err.to_string().contains("only supported as an expression"));
}

#[test]
fn record_subscript_parses() {
    let e = parse_expression(&span("employee.salary")).unwrap();
    match e.kind {
        ExprKind::Subscript { field, .. } => assert_eq!(field, "salary"),
        other => panic!("expected subscript, got {other:?}"),
    }
}

#[test]
fn array_subscript_unfolds_to_element_calls() {
    let e = parse_expression(&span("a[i, j]")).unwrap();
    match e.kind {
        ExprKind::Call(outer) => {
            assert_eq!(outer.predicate_name, "Element");
            let inner = outer.record.field_values[0].value.as_expr().unwrap();
            match &inner.kind {
                ExprKind::Call(inner) => {
                    assert_eq!(inner.predicate_name, "Element");
                    let array = inner.record.field_values[0].value.as_expr().unwrap();
                    assert_eq!(array.as_variable(), Some("a"));
                }
                other => panic!("expected nested Element, got {other:?}"),
            }
        }
        other => panic!("expected call, got {other:?}"),
    }
}

#[test]
fn negation_desugars_to_is_null_combine() {
    let rules = parse_rules("P(x) :- Q(x), ~R(x);");
    let body = rules[0].body.as_ref().unwrap();
    match &body[1] {
        Proposition::Call(call) => {
            assert_eq!(call.predicate_name, "IsNull");
            let arg = call.record.field_values[0].value.as_expr().unwrap();
            assert!(matches!(arg.kind, ExprKind::Combine(_)));
        }
        other => panic!("expected IsNull call, got {other:?}"),
    }
}

#[test]
fn triple_quoted_strings_parse() {
    let e = parse_expression(&span("\"\"\"multi (line)\"\"\"")).unwrap();
    match e.kind {
        ExprKind::Literal(Literal::Str(s)) => assert_eq!(s, "multi (line)"),
        other => panic!("expected string, got {other:?}"),
    }
}

//
// Statement parsing.
//

#[test]
fn value_head_adds_logica_value() {
    let rules = parse_rules("Square(x) = x * x;");
    let last = rules[0].head.record.field_values.last().unwrap();
    assert_eq!(last.field, Field::Named("logica_value".to_string()));
    assert!(!rules[0].distinct_denoted);
}

#[test]
fn aggregating_head_implies_distinct() {
    let rules = parse_rules("Total() += 1;");
    assert!(rules[0].distinct_denoted);
}

#[test]
fn functor_rule_becomes_make_annotation() {
    let rules = parse_rules("G := F(A: C);");
    assert_eq!(rules[0].predicate_name(), "@Make");
    let record = &rules[0].head.record;
    assert_eq!(record.field_values.len(), 3);
}

#[test]
fn function_rule_synthesizes_udf_annotation() {
    let rules = parse_rules("Incr(x) --> x + 1;");
    assert_eq!(rules[0].predicate_name(), "@CompileAsUdf");
    assert_eq!(rules[1].predicate_name(), "Incr");
    let value = rules[1].head.record.field_values.last().unwrap();
    assert_eq!(value.field, Field::Named("logica_value".to_string()));
}

#[test]
fn denotations_promote_to_annotations() {
    let rules = parse_rules("Top(score:) order_by score desc limit 3 :- Game(score:);");
    let names: Vec<&str> = rules.iter().map(|r| r.predicate_name()).collect();
    assert!(names.contains(&"@OrderBy"));
    assert!(names.contains(&"@Limit"));
}

#[test]
fn solver_denotations_are_rejected_by_sql_universe() {
    let unit = parse_program("@Engine(\"sqlite\"); P(1) couldbe;").unwrap();
    let err = Universe::new(unit, IndexMap::new(), None).unwrap_err();
    assert!(err.to_string().contains("solver"));
}

//
// Rewrites.
//

#[test]
fn dnf_splits_disjunction_into_rules() {
    let rules = parse_rules("F(x) :- A(x) | B(x);");
    let f_rules: Vec<&Rule> =
        rules.iter().filter(|r| r.predicate_name() == "F").collect();
    assert_eq!(f_rules.len(), 2);
}

#[test]
fn dnf_distributes_conjunction_over_disjunction() {
    let rules = parse_rules("F(x) :- A(x), (B(x) | C(x));");
    let f_rules: Vec<&Rule> =
        rules.iter().filter(|r| r.predicate_name() == "F").collect();
    assert_eq!(f_rules.len(), 2);
    for rule in f_rules {
        assert_eq!(rule.body.as_ref().unwrap().len(), 2);
    }
}

#[test]
fn multi_body_aggregation_introduces_auxiliary() {
    let rules = parse_rules("A() += 1; A() += 2;");
    let aux: Vec<&Rule> = rules
        .iter()
        .filter(|r| r.predicate_name() == "A_MultBodyAggAux")
        .collect();
    assert_eq!(aux.len(), 2);
    let a_rules: Vec<&Rule> =
        rules.iter().filter(|r| r.predicate_name() == "A").collect();
    assert_eq!(a_rules.len(), 1);
    assert!(a_rules[0].distinct_denoted);
    assert!(a_rules[0].head.record.field_values[0].value.is_aggregated());
}

#[test]
fn multi_body_signature_mismatch_is_an_error() {
    let err = parse_program("A(x? += y) distinct :- B(x, y); A(x? Max= y) distinct :- C(x, y);")
        .unwrap_err();
    assert!(err.to_string().contains("Signature differs"));
}

#[test]
fn rewrites_are_idempotent() {
    let rules = parse_rules(
        "A() += 1; A() += 2; F(x) :- B(x) | C(x); D(total? += x) distinct :- E(x);",
    );
    let once = rules.clone();
    let twice = rewrite::aggregations_as_expressions_rewrite(
        rewrite::multi_body_aggregation_rewrite(rewrite::dnf_rewrite(rules)).unwrap(),
    );
    assert_eq!(once, twice);
}

//
// Imports.
//

#[test]
fn imports_prefix_and_rename() {
    let dir = std::env::temp_dir().join(format!("logica_test_{}", std::process::id()));
    std::fs::create_dir_all(dir.join("lib")).unwrap();
    std::fs::write(
        dir.join("lib/util.l"),
        "Fact(1); Fact(2); Other(3);",
    )
    .unwrap();
    let unit = FileParser::new(vec![dir.clone()])
        .parse("import lib.util.Fact; P(x) :- Fact(x);")
        .unwrap();
    let names: Vec<&str> = unit.rules.iter().map(|r| r.predicate_name()).collect();
    assert!(names.contains(&"Util_Fact"));
    assert!(names.contains(&"Util_Other"));
    let p = unit
        .rules
        .iter()
        .find(|r| r.predicate_name() == "P")
        .unwrap();
    match &p.body.as_ref().unwrap()[0] {
        Proposition::Call(call) => assert_eq!(call.predicate_name, "Util_Fact"),
        other => panic!("expected call, got {other:?}"),
    }
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn unused_import_is_an_error() {
    let dir = std::env::temp_dir().join(format!("logica_unused_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("util.l"), "Fact(1);").unwrap();
    let err = FileParser::new(vec![dir.clone()])
        .parse("import util.Fact; P(1);")
        .unwrap_err();
    assert!(err.to_string().contains("not used"));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn undefined_import_is_an_error() {
    let dir = std::env::temp_dir().join(format!("logica_undef_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("util.l"), "Fact(1);").unwrap();
    let err = FileParser::new(vec![dir.clone()])
        .parse("import util.Missing; P(x) :- Missing(x);")
        .unwrap_err();
    assert!(err.to_string().contains("not defined"));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn import_cycle_is_an_error() {
    let dir = std::env::temp_dir().join(format!("logica_cycle_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.l"), "import b.B; A(x) :- B(x);").unwrap();
    std::fs::write(dir.join("b.l"), "import a.A; B(x) :- A(x);").unwrap();
    let err = FileParser::new(vec![dir.clone()])
        .parse("import a.A; P(x) :- A(x);")
        .unwrap_err();
    match err {
        CompileError::Import { message, chain } => {
            assert!(message.contains("Circular"));
            assert!(chain.len() >= 3);
        }
        other => panic!("expected import error, got {other}"),
    }
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_import_lists_considered_files() {
    let err = FileParser::new(vec![std::path::PathBuf::from("/nonexistent_root")])
        .parse("import no.such.Predicate; P(x) :- Predicate(x);")
        .unwrap_err();
    assert!(err.to_string().contains("Considered"));
}

//
// JSON output.
//

#[test]
fn json_output_has_contract_keys() {
    let unit = parse_program("Parent(\"A\", \"B\"); G(a, b) :- Parent(a, b);").unwrap();
    let value = crate::json::unit_to_json(&unit);
    assert!(value.get("rule").is_some());
    assert!(value.get("imported_predicates").is_some());
    assert!(value.get("predicates_prefix").is_some());
    assert!(value.get("file_name").is_some());
    let rule = &value["rule"][1];
    assert_eq!(rule["head"]["predicate_name"], "G");
    assert!(rule.get("full_text").is_some());
    let first_arg = &rule["head"]["record"]["field_value"][0];
    assert_eq!(first_arg["field"], 0);
    assert_eq!(
        first_arg["value"]["expression"]["expression_heritage"],
        "a"
    );
}

#[test]
fn json_keys_are_sorted() {
    let unit = parse_program("P(1);").unwrap();
    let rendered = crate::json::render(&unit, true);
    let file_name = rendered.find("\"file_name\"").unwrap();
    let rule = rendered.find("\"rule\"").unwrap();
    let prefix = rendered.find("\"predicates_prefix\"").unwrap();
    assert!(file_name < prefix && prefix < rule);
}

//
// Universe and classification.
//

#[test]
fn single_rule_predicates_are_injectable() {
    let universe = universe_of(
        "@Engine(\"sqlite\");
         One(1);
         Many(1); Many(2);
         Agg() += 1;
         @NoInject(Opaque); Opaque(1);
         P(x) :- One(x), Many(x), Agg(), Opaque(x);",
    );
    assert!(universe.is_injectable("One").unwrap());
    assert!(!universe.is_injectable("Many").unwrap());
    assert!(!universe.is_injectable("Agg").unwrap());
    assert!(!universe.is_injectable("Opaque").unwrap());
}

#[test]
fn recursive_predicates_are_detected() {
    let universe = universe_of("@Engine(\"sqlite\"); N(0); N(n + 1) :- N(n); M(1);");
    assert!(universe.is_recursive("N"));
    assert!(!universe.is_recursive("M"));
    assert!(!universe.is_injectable("N").unwrap());
}

#[test]
fn mutual_recursion_is_one_group() {
    let universe = universe_of(
        "@Engine(\"sqlite\"); A(0); A(x) :- B(x); B(x + 1) :- A(x);",
    );
    assert!(universe.is_recursive("A"));
    assert!(universe.is_recursive("B"));
}

#[test]
fn recursion_without_base_case_is_an_error() {
    let universe = universe_of("@Engine(\"sqlite\"); P(x + 1) :- P(x);");
    let err = universe.compile("P").unwrap_err();
    assert!(err.to_string().contains("base case"));
}

#[test]
fn unknown_predicate_is_an_error() {
    let universe = universe_of("@Engine(\"sqlite\"); P(x) :- Mystery(x);");
    let err = universe.compile("P").unwrap_err();
    assert!(err.to_string().contains("Unknown predicate"));
}

#[test]
fn undefined_compilation_target_is_an_error() {
    let universe = universe_of("@Engine(\"sqlite\"); P(1);");
    let err = universe.compile("Q").unwrap_err();
    assert!(err.to_string().contains("No rules are defining"));
}

#[test]
fn unbound_variable_is_an_error() {
    let universe = universe_of("@Engine(\"sqlite\"); P(x, y) :- Q(x); Q(1);");
    let err = universe.compile("P").unwrap_err();
    assert!(err.to_string().contains("Found no way to assign variables"));
    assert!(err.to_string().contains("y"));
}

#[test]
fn aggregation_requires_distinct() {
    // The parser denotes distinct implicitly, so sneak aggregation in via
    // a body where it is never legal.
    let err = parse_program("P(x) :- Q(x? += y);")
        .map(|unit| Universe::new(unit, IndexMap::new(), None).and_then(|u| u.compile("P")));
    match err {
        Ok(Ok(sql)) => panic!("expected error, got {sql}"),
        _ => {}
    }
}

#[test]
fn compile_determinism() {
    let program = "@Engine(\"sqlite\");
        Parent(\"A\", \"B\"); Parent(\"B\", \"C\");
        Grandparent(a, b) :- Parent(a, x), Parent(x, b);";
    let a = universe_of(program).compile("Grandparent").unwrap();
    let b = universe_of(program).compile("Grandparent").unwrap();
    assert_eq!(a, b);
}

#[test]
fn functor_expansion_determinism() {
    let program = "@Engine(\"sqlite\");
        F(x) :- A(x) | B(x);
        G := F(A: C, B: D);
        H := F(A: D, B: C);
        C(\"c\"); D(\"d\");";
    let a = universe_of(program).compile("G").unwrap();
    let b = universe_of(program).compile("G").unwrap();
    assert_eq!(a, b);
    let rules_a: Vec<String> = parse_rules(program)
        .iter()
        .map(|r| format!("{r:?}"))
        .collect();
    let rules_b: Vec<String> = parse_rules(program)
        .iter()
        .map(|r| format!("{r:?}"))
        .collect();
    assert_eq!(rules_a, rules_b);
}

#[test]
fn grounded_predicate_compiles_to_table_reference() {
    let universe = universe_of(
        "@Engine(\"sqlite\"); @Ground(Employee, \"company_employees\");
         P(x) :- Employee(x);",
    );
    let sql = universe.compile("P").unwrap();
    assert!(sql.contains("company_employees"));
    assert!(!sql.contains("WITH"));
}

#[test]
fn with_annotation_forces_cte() {
    let universe = universe_of(
        "@Engine(\"sqlite\"); @With(One); One(1); P(x) :- One(x);",
    );
    let sql = universe.compile("P").unwrap();
    assert!(sql.contains("WITH One AS"));
}

#[test]
fn injection_inlines_single_rule_predicates() {
    let universe = universe_of("@Engine(\"sqlite\"); One(1); P(x) :- One(x);");
    let sql = universe.compile("P").unwrap();
    assert!(!sql.contains("WITH"), "injectable was materialized: {sql}");
}

#[test]
fn engine_annotation_selects_dialect() {
    let universe = universe_of("@Engine(\"psql\"); P(x) :- x in [1, 2];");
    assert_eq!(universe.dialect().name(), "PostgreSQL");
    let universe = universe_of("P(1);");
    assert_eq!(universe.dialect().name(), "BigQuery");
}

#[test]
fn unrecognized_engine_is_an_error() {
    let unit = parse_program("@Engine(\"oracle\"); P(1);").unwrap();
    let err = Universe::new(unit, IndexMap::new(), None).unwrap_err();
    assert!(err.to_string().contains("Unrecognized engine"));
}

#[test]
fn unknown_annotation_is_an_error() {
    let err = parse_program("@Frobnicate(P); P(1);")
        .map(|unit| Universe::new(unit, IndexMap::new(), None).map(|_| ()));
    match err {
        Ok(Err(e)) => assert!(e.to_string().contains("special predicates")),
        other => panic!("expected annotation error, got {other:?}"),
    }
}

#[test]
fn annotation_of_missing_predicate_is_an_error() {
    let unit = parse_program("@Limit(Nothing, 5); P(1);").unwrap();
    let err = Universe::new(unit, IndexMap::new(), None).unwrap_err();
    assert!(err.to_string().contains("non-existing predicate"));
}

#[test]
fn sqlite_rejects_argmax() {
    let universe = universe_of(
        "@Engine(\"sqlite\");
         Best(x? ArgMax= y -> x) distinct :- Score(y, x);
         Score(1, 10); Score(2, 20);",
    );
    let err = universe.compile("Best").unwrap_err();
    assert!(matches!(err, CompileError::Dialect(_)));
}

#[test]
fn flags_substitute_to_fixpoint() {
    let program = "@Engine(\"sqlite\");
        @DefineFlag(\"greeting\", \"hello\");
        P(\"${greeting}\");";
    let universe = universe_of(program);
    let sql = universe.compile("P").unwrap();
    assert!(sql.contains("'hello'"));
    let unit = parse_program(program).unwrap();
    let mut flags = IndexMap::new();
    flags.insert("greeting".to_string(), "goodbye".to_string());
    let universe = Universe::new(unit, flags, None).unwrap();
    assert!(universe.compile("P").unwrap().contains("'goodbye'"));
}

#[test]
fn undefined_flag_is_an_error() {
    let unit = parse_program("P(\"${no_such_flag}\");").unwrap();
    let err = Universe::new(unit, IndexMap::new(), None).unwrap_err();
    assert!(err.to_string().contains("undefined"));
}

#[test]
fn udf_calls_inline_as_formulas() {
    let universe = universe_of(
        "@Engine(\"sqlite\"); Incr(x) --> x + 1; P(y) :- Q(x), y == Incr(x); Q(1);",
    );
    let sql = universe.compile("P").unwrap();
    assert!(sql.contains("+ (1)"), "udf was not inlined: {sql}");
}

#[test]
fn parse_error_snippet_highlights_span() {
    let err = parse_program("P(x) :- ;").unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains(">>"));
    assert!(rendered.contains("<<"));
}
