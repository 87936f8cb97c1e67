//! Syntactic rewrites applied to every parsed file, in order:
//! disjunctive normal form, multi-body aggregation, and
//! aggregation-as-expression. Each rewrite is idempotent.

use indexmap::IndexMap;

use crate::ast::{
    walk_rule, Call, Expression, Field, FieldValue, Proposition, Record, Rule, Value, Visitor,
};
use crate::error::{ParseError, ParseResult};

pub const MULTI_BODY_SUFFIX: &str = "_MultBodyAggAux";

//
// Disjunctive normal form.
//

fn conjunction_of_dnfs(dnfs: &[Vec<Vec<Proposition>>]) -> Vec<Vec<Proposition>> {
    if dnfs.len() == 1 {
        return dnfs[0].clone();
    }
    let rest = conjunction_of_dnfs(&dnfs[1..]);
    let mut result = Vec::new();
    for a in &dnfs[0] {
        for b in &rest {
            let mut conjuncts = a.clone();
            conjuncts.extend(b.clone());
            result.push(conjuncts);
        }
    }
    result
}

fn proposition_to_dnf(proposition: &Proposition) -> Vec<Vec<Proposition>> {
    match proposition {
        Proposition::Conjunction(conjuncts) => {
            let dnfs: Vec<_> = conjuncts.iter().map(proposition_to_dnf).collect();
            conjunction_of_dnfs(&dnfs)
        }
        Proposition::Disjunction(disjuncts) => {
            disjuncts.iter().flat_map(proposition_to_dnf).collect()
        }
        // Negation-as-aggregate is a call and stays opaque here.
        other => vec![vec![other.clone()]],
    }
}

fn rule_to_rules(rule: Rule) -> Vec<Rule> {
    let body = match &rule.body {
        Some(body) => body,
        None => return vec![rule],
    };
    let dnf = proposition_to_dnf(&Proposition::Conjunction(body.clone()));
    dnf.into_iter()
        .map(|conjuncts| Rule { body: Some(conjuncts), ..rule.clone() })
        .collect()
}

/// Distributes conjunctions over disjunctions; each disjunct becomes a
/// separate rule with the same head.
pub fn dnf_rewrite(rules: Vec<Rule>) -> Vec<Rule> {
    rules.into_iter().flat_map(rule_to_rules).collect()
}

//
// Multi-body aggregation.
//

/// Splits an aggregating rule into its aggregation signature and a
/// non-aggregating rule emitting the per-row argument values.
fn split_aggregation(rule: &Rule) -> ParseResult<(Vec<FieldValue>, Rule)> {
    if !rule.distinct_denoted {
        return Err(ParseError::syntax(
            rule.full_text.clone(),
            format!(
                "Inconsistency in >>distinct<< denoting for predicate >>{}<<.",
                rule.predicate_name()
            ),
        ));
    }
    let mut rule = rule.clone();
    rule.distinct_denoted = false;
    rule.head.predicate_name = format!("{}{MULTI_BODY_SUFFIX}", rule.head.predicate_name);
    let mut transformation_field_values = Vec::new();
    let mut aggregation_field_values = Vec::new();
    for field_value in &rule.head.record.field_values {
        let pass_variable = Expression::variable(field_value.field.sql_name());
        match &field_value.value {
            Value::Aggregation { operator, argument } => {
                aggregation_field_values.push(FieldValue::new(
                    field_value.field.clone(),
                    Value::Aggregation {
                        operator: operator.clone(),
                        argument: pass_variable,
                    },
                ));
                transformation_field_values.push(FieldValue::expression(
                    field_value.field.clone(),
                    argument.clone(),
                ));
            }
            _ => {
                aggregation_field_values.push(FieldValue::expression(
                    field_value.field.clone(),
                    pass_variable,
                ));
                transformation_field_values.push(field_value.clone());
            }
        }
    }
    rule.head.record.field_values = transformation_field_values;
    Ok((aggregation_field_values, rule))
}

/// Merges multiple bodies of an aggregating predicate into a
/// non-aggregating auxiliary predicate plus a single aggregating rule.
pub fn multi_body_aggregation_rewrite(rules: Vec<Rule>) -> ParseResult<Vec<Rule>> {
    let mut rules_of: IndexMap<String, Vec<&Rule>> = IndexMap::new();
    for rule in &rules {
        rules_of
            .entry(rule.predicate_name().to_string())
            .or_default()
            .push(rule);
    }
    let multi_body: Vec<String> = rules_of
        .iter()
        .filter(|(_, rs)| rs.len() > 1 && rs[0].distinct_denoted)
        .map(|(name, _)| name.clone())
        .collect();

    let mut new_rules = Vec::new();
    let mut signature_of: IndexMap<String, Vec<FieldValue>> = IndexMap::new();
    let mut full_text_of: IndexMap<String, crate::source::Span> = IndexMap::new();
    for rule in &rules {
        let name = rule.predicate_name().to_string();
        full_text_of.insert(name.clone(), rule.full_text.clone());
        if !multi_body.contains(&name) {
            new_rules.push(rule.clone());
            continue;
        }
        let (aggregation, new_rule) = split_aggregation(rule)?;
        if let Some(expected) = signature_of.get(&name) {
            if *expected != aggregation {
                return Err(ParseError::syntax(
                    rule.full_text.clone(),
                    format!("Signature differs for bodies of >>{name}<<."),
                ));
            }
        } else {
            signature_of.insert(name.clone(), aggregation);
        }
        new_rules.push(new_rule);
    }
    for name in &multi_body {
        let signature = signature_of[name].clone();
        let pass_field_values: Vec<FieldValue> = signature
            .iter()
            .map(|fv| {
                FieldValue::expression(
                    fv.field.clone(),
                    Expression::variable(fv.field.sql_name()),
                )
            })
            .collect();
        let aggregating_rule = Rule {
            head: Call::new(name.clone(), signature),
            body: Some(vec![Proposition::Call(Call::new(
                format!("{name}{MULTI_BODY_SUFFIX}"),
                pass_field_values,
            ))]),
            distinct_denoted: true,
            full_text: full_text_of[name].clone(),
        };
        new_rules.push(aggregating_rule);
    }
    Ok(new_rules)
}

//
// Aggregation as expression.
//

fn aggregation_operator(raw_operator: &str) -> String {
    match raw_operator {
        "+" => "Agg+".to_string(),
        "++" => "Agg++".to_string(),
        other => other.to_string(),
    }
}

struct AggregationRewriter;

impl Visitor for AggregationRewriter {
    fn record(&mut self, record: &mut Record) {
        rewrite_aggregations_of(record);
    }
}

fn rewrite_aggregations_of(record: &mut Record) {
    for fv in &mut record.field_values {
        if let Value::Aggregation { operator, argument } = &fv.value {
            let call = Expression::call(
                aggregation_operator(operator),
                vec![FieldValue::expression(Field::Positional(0), argument.clone())],
            );
            fv.value = Value::AggregatedExpr(call);
        }
    }
}

/// Turns every raw `Op= argument` aggregation into an expression over
/// `Agg`-operators; the only aggregated form later stages accept.
pub fn aggregations_as_expressions_rewrite(rules: Vec<Rule>) -> Vec<Rule> {
    rules
        .into_iter()
        .map(|mut rule| {
            walk_rule(&mut AggregationRewriter, &mut rule);
            rule
        })
        .collect()
}
