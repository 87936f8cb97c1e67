//! End-to-end tests: compile a program for SQLite, execute the SQL on an
//! in-memory database, compare multisets of rows.

use hashbag::HashBag;
use indexmap::IndexMap;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use logica::{parse_program, Universe};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Datum {
    Int(i64),
    Text(String),
    Null,
}

fn int(n: i64) -> Datum {
    Datum::Int(n)
}

fn text(s: &str) -> Datum {
    Datum::Text(s.to_string())
}

fn compile(program: &str, predicate: &str) -> String {
    let unit = parse_program(program).expect("program parses");
    let universe = Universe::new(unit, IndexMap::new(), None).expect("universe builds");
    let sql = universe.compile(predicate).expect("compilation succeeds");
    println!("***** BEGIN SQL *****\n{sql}\n***** END SQL *****");
    sql
}

fn run_sql(sql: &str) -> Vec<Vec<Datum>> {
    let connection = Connection::open_in_memory().unwrap();
    let mut statement = connection
        .prepare(sql.trim_end().trim_end_matches(';'))
        .unwrap();
    let column_count = statement.column_count();
    let mut rows = statement.query([]).unwrap();
    let mut result = Vec::new();
    while let Some(row) = rows.next().unwrap() {
        let mut converted = Vec::with_capacity(column_count);
        for i in 0..column_count {
            converted.push(match row.get_ref(i).unwrap() {
                ValueRef::Integer(x) => Datum::Int(x),
                ValueRef::Text(s) => Datum::Text(String::from_utf8_lossy(s).into_owned()),
                ValueRef::Null => Datum::Null,
                other => panic!("unexpected value type {other:?}"),
            });
        }
        result.push(converted);
    }
    result
}

fn query(program: &str, predicate: &str) -> Vec<Vec<Datum>> {
    run_sql(&compile(program, predicate))
}

fn query_bag(program: &str, predicate: &str) -> HashBag<Vec<Datum>> {
    query(program, predicate).into_iter().collect()
}

fn expect_bag(program: &str, predicate: &str, expected: &[Vec<Datum>]) {
    let actual = query_bag(program, predicate);
    let expected: HashBag<Vec<Datum>> = expected.iter().cloned().collect();
    assert_eq!(actual, expected);
}

#[test]
fn facts_and_projection() {
    expect_bag(
        r#"
        @Engine("sqlite");
        Parent("A", "B"); Parent("B", "C"); Parent("A", "F");
        Grandparent(a, b) :- Parent(a, x), Parent(x, b);
        "#,
        "Grandparent",
        &[vec![text("A"), text("C")]],
    );
}

#[test]
fn distinct_collapses_multiplicities() {
    expect_bag(
        r#"
        @Engine("sqlite");
        FruitPurchase(fruit: "apple");
        FruitPurchase(fruit: "apple");
        FruitPurchase(fruit: "orange");
        FruitPurchase(fruit: "orange");
        FruitPurchase(fruit: "orange");
        FruitPurchase(fruit: "pineapple");
        FruitPurchase(fruit: "pineapple");
        Fruit(fruit:) distinct :- FruitPurchase(fruit:);
        "#,
        "Fruit",
        &[
            vec![text("apple")],
            vec![text("orange")],
            vec![text("pineapple")],
        ],
    );
}

#[test]
fn multi_body_aggregation_sums() {
    expect_bag(
        r#"@Engine("sqlite"); A() += 1; A() += 2;"#,
        "A",
        &[vec![int(3)]],
    );
}

#[test]
fn recursion_unrolls_to_default_depth() {
    let expected: Vec<Vec<Datum>> = (0..=8).map(|n| vec![int(n)]).collect();
    expect_bag(
        r#"@Engine("sqlite"); N(0); N(n + 1) :- N(n);"#,
        "N",
        &expected,
    );
}

#[test]
fn recursion_depth_annotation_overrides_default() {
    let expected: Vec<Vec<Datum>> = (0..=20).map(|n| vec![int(n)]).collect();
    expect_bag(
        r#"@Engine("sqlite"); @Recursive(N, 20); N(0); N(n + 1) :- N(n);"#,
        "N",
        &expected,
    );
}

#[test]
fn functor_instantiation() {
    expect_bag(
        r#"
        @Engine("sqlite");
        F(x) :- A(x) | B(x);
        G := F(A: C, B: D);
        C("c1"); D("d1");
        "#,
        "G",
        &[vec![text("c1")], vec![text("d1")]],
    );
}

#[test]
fn negation_as_aggregate() {
    expect_bag(
        r#"
        @Engine("sqlite");
        Bird("sparrow"); Bird("eagle"); Bird("canary"); Bird("cassowary");
        CanSing("sparrow"); CanSing("canary"); CanSing("cassowary");
        CanFly("sparrow"); CanFly("eagle"); CanFly("canary");
        InterestingBird(x) :- Bird(x), CanSing(x), ~CanFly(x);
        "#,
        "InterestingBird",
        &[vec![text("cassowary")]],
    );
}

#[test]
fn aggregation_groups_by_non_aggregated_fields() {
    expect_bag(
        r#"
        @Engine("sqlite");
        Purchase("apple", 2); Purchase("apple", 3); Purchase("pear", 5);
        Total(fruit:, total? += n) distinct :- Purchase(fruit, n);
        "#,
        "Total",
        &[
            vec![text("apple"), int(5)],
            vec![text("pear"), int(5)],
        ],
    );
}

#[test]
fn order_by_and_limit_denotations() {
    let rows = query(
        r#"
        @Engine("sqlite");
        Score(1); Score(5); Score(3);
        Top(x) order_by col0 desc limit 2 :- Score(x);
        "#,
        "Top",
    );
    assert_eq!(rows, vec![vec![int(5)], vec![int(3)]]);
}

#[test]
fn value_predicates_compile_through_injection() {
    expect_bag(
        r#"
        @Engine("sqlite");
        N(2); N(3);
        Square(x) = x * x;
        Squares(y) :- N(x), y == Square(x);
        "#,
        "Squares",
        &[vec![int(4)], vec![int(9)]],
    );
}

#[test]
fn inclusion_unnests_lists() {
    expect_bag(
        r#"@Engine("sqlite"); P(x) :- x in [1, 2, 3];"#,
        "P",
        &[vec![int(1)], vec![int(2)], vec![int(3)]],
    );
}

#[test]
fn combine_expression_aggregates() {
    expect_bag(
        r#"
        @Engine("sqlite");
        Item(1); Item(2); Item(3);
        MaxItem(m) :- m == (combine Max= x :- Item(x));
        "#,
        "MaxItem",
        &[vec![int(3)]],
    );
}

#[test]
fn implication_compiles_to_case() {
    expect_bag(
        r#"
        @Engine("sqlite");
        N(1); N(2);
        Label(x, y) :- N(x), y == (if x == 1 then "one" else "many");
        "#,
        "Label",
        &[
            vec![int(1), text("one")],
            vec![int(2), text("many")],
        ],
    );
}

#[test]
fn udf_calls_evaluate_inline() {
    expect_bag(
        r#"
        @Engine("sqlite");
        Incr(x) --> x + 1;
        N(1); N(5);
        M(y) :- N(x), y == Incr(x);
        "#,
        "M",
        &[vec![int(2)], vec![int(6)]],
    );
}

#[test]
fn injection_is_semantically_transparent() {
    let with_injection = r#"
        @Engine("sqlite");
        Center("x");
        Edge("x", "y"); Edge("x", "z");
        Reach(b) :- Center(a), Edge(a, b);
    "#;
    let without_injection = r#"
        @Engine("sqlite");
        @NoInject(Center); @NoInject(Edge);
        Center("x");
        Edge("x", "y"); Edge("x", "z");
        Reach(b) :- Center(a), Edge(a, b);
    "#;
    let expected = [vec![text("y")], vec![text("z")]];
    expect_bag(with_injection, "Reach", &expected);
    expect_bag(without_injection, "Reach", &expected);
    // Injection changed the SQL shape but not the result.
    assert_ne!(
        compile(with_injection, "Reach"),
        compile(without_injection, "Reach")
    );
}

#[test]
fn compilation_is_deterministic() {
    let program = r#"
        @Engine("sqlite");
        Parent("A", "B"); Parent("B", "C");
        Grandparent(a, b) :- Parent(a, x), Parent(x, b);
        Ancestor(a, b) :- Parent(a, b);
        Ancestor(a, b) :- Ancestor(a, x), Parent(x, b);
    "#;
    let first = compile(program, "Ancestor");
    let second = compile(program, "Ancestor");
    assert_eq!(first, second);
    expect_bag(
        program,
        "Ancestor",
        &[
            vec![text("A"), text("B")],
            vec![text("B"), text("C")],
            vec![text("A"), text("C")],
        ],
    );
}

#[test]
fn mutual_recursion_unrolls_in_lockstep() {
    // Even/odd chain over a five-node path.
    let program = r#"
        @Engine("sqlite");
        Next(0, 1); Next(1, 2); Next(2, 3); Next(3, 4);
        Even(0);
        Even(y) :- Odd(x), Next(x, y);
        Odd(y) :- Even(x), Next(x, y);
    "#;
    expect_bag(
        program,
        "Even",
        &[vec![int(0)], vec![int(2)], vec![int(4)]],
    );
    expect_bag(program, "Odd", &[vec![int(1)], vec![int(3)]]);
}
