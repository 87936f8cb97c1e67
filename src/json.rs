//! JSON rendering of the parsed AST: the stable contract for external
//! tooling. Keys are sorted lexicographically (serde_json's default map
//! is ordered), and every expression carries its `expression_heritage`.

use serde_json::{json, Map, Value as Json};

use crate::ast::{
    Call, ExprKind, Expression, Field, Literal, Proposition, Record, Rule, Value,
};
use crate::parser::ParsedUnit;

fn field_to_json(field: &Field) -> Json {
    match field {
        Field::Positional(i) => json!(i),
        Field::Named(name) => json!(name),
        Field::Splat => json!("*"),
    }
}

fn literal_to_json(literal: &Literal) -> Json {
    match literal {
        Literal::Number(n) => json!({ "the_number": { "number": n } }),
        Literal::Str(s) => json!({ "the_string": { "the_string": s } }),
        Literal::Bool(b) => json!({ "the_bool": { "the_bool": b.to_string() } }),
        Literal::Null => json!({ "the_null": { "the_null": "null" } }),
        Literal::List(elements) => json!({
            "the_list": {
                "element": elements.iter().map(expression_to_json).collect::<Vec<_>>()
            }
        }),
        Literal::Predicate(name) => json!({ "the_predicate": { "predicate_name": name } }),
    }
}

pub fn expression_to_json(expression: &Expression) -> Json {
    let mut object = Map::new();
    match &expression.kind {
        ExprKind::Literal(literal) => {
            object.insert("literal".to_string(), literal_to_json(literal));
        }
        ExprKind::Variable(name) => {
            object.insert("variable".to_string(), json!({ "var_name": name }));
        }
        ExprKind::Record(record) => {
            object.insert("record".to_string(), record_to_json(record));
        }
        ExprKind::Call(call) => {
            object.insert("call".to_string(), call_to_json(call));
        }
        ExprKind::Subscript { record, field } => {
            object.insert(
                "subscript".to_string(),
                json!({
                    "record": expression_to_json(record),
                    "subscript": { "literal": { "the_symbol": { "symbol": field } } }
                }),
            );
        }
        ExprKind::Combine(rule) => {
            object.insert("combine".to_string(), rule_to_json(rule));
        }
        ExprKind::Implication(implication) => {
            object.insert(
                "implication".to_string(),
                json!({
                    "if_then": implication
                        .if_thens
                        .iter()
                        .map(|it| json!({
                            "condition": expression_to_json(&it.condition),
                            "consequence": expression_to_json(&it.consequence)
                        }))
                        .collect::<Vec<_>>(),
                    "otherwise": expression_to_json(&implication.otherwise)
                }),
            );
        }
    }
    object.insert(
        "expression_heritage".to_string(),
        json!(expression.heritage.text()),
    );
    Json::Object(object)
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Expr(e) => json!({ "expression": expression_to_json(e) }),
        Value::Aggregation { operator, argument } => json!({
            "aggregation": { "operator": operator, "argument": expression_to_json(argument) }
        }),
        Value::AggregatedExpr(e) => {
            json!({ "aggregation": { "expression": expression_to_json(e) } })
        }
    }
}

fn record_to_json(record: &Record) -> Json {
    let field_values: Vec<Json> = record
        .field_values
        .iter()
        .map(|fv| {
            let mut object = Map::new();
            object.insert("field".to_string(), field_to_json(&fv.field));
            object.insert("value".to_string(), value_to_json(&fv.value));
            if !fv.except.is_empty() {
                object.insert("except".to_string(), json!(fv.except));
            }
            Json::Object(object)
        })
        .collect();
    json!({ "field_value": field_values })
}

fn call_to_json(call: &Call) -> Json {
    json!({
        "predicate_name": call.predicate_name,
        "record": record_to_json(&call.record)
    })
}

fn proposition_to_json(proposition: &Proposition) -> Json {
    match proposition {
        Proposition::Call(call) => json!({ "predicate": call_to_json(call) }),
        Proposition::Unification { left, right } => json!({
            "unification": {
                "left_hand_side": expression_to_json(left),
                "right_hand_side": expression_to_json(right)
            }
        }),
        Proposition::Inclusion { element, list } => json!({
            "inclusion": {
                "element": expression_to_json(element),
                "list": expression_to_json(list)
            }
        }),
        Proposition::Conjunction(conjuncts) => json!({
            "conjunction": {
                "conjunct": conjuncts.iter().map(proposition_to_json).collect::<Vec<_>>()
            }
        }),
        Proposition::Disjunction(disjuncts) => json!({
            "disjunction": {
                "disjunct": disjuncts.iter().map(proposition_to_json).collect::<Vec<_>>()
            }
        }),
    }
}

pub fn rule_to_json(rule: &Rule) -> Json {
    let mut object = Map::new();
    object.insert("head".to_string(), call_to_json(&rule.head));
    if let Some(body) = &rule.body {
        object.insert(
            "body".to_string(),
            json!({
                "conjunction": {
                    "conjunct": body.iter().map(proposition_to_json).collect::<Vec<_>>()
                }
            }),
        );
    }
    if rule.distinct_denoted {
        object.insert("distinct_denoted".to_string(), json!(true));
    }
    object.insert("full_text".to_string(), json!(rule.full_text.text()));
    Json::Object(object)
}

pub fn unit_to_json(unit: &ParsedUnit) -> Json {
    json!({
        "rule": unit.rules.iter().map(rule_to_json).collect::<Vec<_>>(),
        "imported_predicates": unit
            .imported_predicates
            .iter()
            .map(|i| json!({
                "file": i.file,
                "predicate_name": i.predicate_name,
                "synonym": i.synonym
            }))
            .collect::<Vec<_>>(),
        "predicates_prefix": unit.predicates_prefix,
        "file_name": unit.file_name
    })
}

/// The parsed program as a JSON document. With `full`, the whole unit;
/// otherwise just the rule list.
pub fn render(unit: &ParsedUnit, full: bool) -> String {
    let value = if full {
        unit_to_json(unit)
    } else {
        unit_to_json(unit)["rule"].clone()
    };
    serde_json::to_string_pretty(&value).expect("AST serialization is infallible")
}
