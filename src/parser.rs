//! Parser of Logica: expressions, propositions, statements, files, imports.
//!
//! Mutually recursive descent where every parser receives a stripped span
//! and relies exclusively on the traverser's split/strip primitives. The
//! first error aborts the enclosing statement and the compilation.

use std::fs;
use std::path::PathBuf;

use indexmap::{IndexMap, IndexSet};

use crate::ast::{
    Call, ExprKind, Expression, Field, FieldValue, IfThen, Implication, Literal, Proposition,
    Record, Rule, Value, VALUE_FIELD,
};
use crate::error::{CompileError, ParseError, ParseResult, Result};
use crate::rewrite;
use crate::source::Span;
use crate::traverse::{
    is_whole, remove_comments, split, split_in_one_or_two, split_in_two, split_on_whitespace,
    split_raw, strip, Traversal,
};

/// Operator precedence, loosest first. Trying each in order and splitting
/// at the first that applies yields the usual precedence climbing.
const OPERATORS: &[&str] = &[
    "||", "&&", "->", "==", "<=", ">=", "<", ">", "!=", "=", "~", "in", "is not", "is", "++?",
    "++", "+", "-", "*", "/", "%", "^", "!",
];

const UNARY_OPERATORS: &[&str] = &["-", "!"];

fn is_variable_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
}

fn functor_syntax_error() -> String {
    "Incorrect syntax for functor call. Functor call to be made as\n\
     \u{20} R := F(A: V, ...)\n\
     or\n\
     \u{20} @Make(R, F, {A: V, ...})\n\
     Where R, F, A's and V's are all predicate names."
        .to_string()
}

//
// Literals.
//

fn parse_number(s: &Span) -> Option<Expression> {
    let mut text = s.text();
    if let Some(stripped) = text.strip_suffix('u') {
        text = stripped;
    }
    if text.is_empty()
        || !text
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return None;
    }
    text.parse::<f64>().ok()?;
    Some(Expression::new(
        ExprKind::Literal(Literal::Number(text.to_string())),
        s.clone(),
    ))
}

fn parse_string(s: &Span) -> Option<Expression> {
    let text = s.text();
    if text.len() >= 6 && text.starts_with("\"\"\"") && text.ends_with("\"\"\"") {
        let inside = &text[3..text.len() - 3];
        if !inside.contains("\"\"\"") {
            return Some(Expression::new(
                ExprKind::Literal(Literal::Str(inside.to_string())),
                s.clone(),
            ));
        }
    }
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        let inside = &text[1..text.len() - 1];
        if !inside.contains('"') {
            return Some(Expression::new(
                ExprKind::Literal(Literal::Str(inside.to_string())),
                s.clone(),
            ));
        }
    }
    None
}

fn parse_bool(s: &Span) -> Option<Expression> {
    match s.text() {
        "true" => Some(Expression::new(ExprKind::Literal(Literal::Bool(true)), s.clone())),
        "false" => Some(Expression::new(ExprKind::Literal(Literal::Bool(false)), s.clone())),
        _ => None,
    }
}

fn parse_null(s: &Span) -> Option<Expression> {
    if s.text() == "null" {
        return Some(Expression::new(ExprKind::Literal(Literal::Null), s.clone()));
    }
    None
}

fn parse_list(s: &Span) -> ParseResult<Option<Expression>> {
    let text = s.text();
    if !(text.len() >= 2 && text.starts_with('[') && text.ends_with(']')) {
        return Ok(None);
    }
    let inner = s.slice(1, s.len() - 1);
    if !is_whole(&inner) {
        return Ok(None);
    }
    let inside = strip(&inner);
    let elements = if inside.is_empty() {
        Vec::new()
    } else {
        split(&inside, ",")?
            .iter()
            .map(parse_expression)
            .collect::<ParseResult<Vec<_>>>()?
    };
    Ok(Some(Expression::new(
        ExprKind::Literal(Literal::List(elements)),
        s.clone(),
    )))
}

fn parse_predicate_literal(s: &Span) -> Option<Expression> {
    let text = s.text();
    let is_predicate = text == "++?"
        || text == "nil"
        || (!text.is_empty()
            && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && text.chars().next().unwrap().is_ascii_uppercase());
    if is_predicate {
        return Some(Expression::new(
            ExprKind::Literal(Literal::Predicate(text.to_string())),
            s.clone(),
        ));
    }
    None
}

fn parse_literal(s: &Span) -> ParseResult<Option<Expression>> {
    if let Some(e) = parse_number(s) {
        return Ok(Some(e));
    }
    if let Some(e) = parse_string(s) {
        return Ok(Some(e));
    }
    if let Some(e) = parse_list(s)? {
        return Ok(Some(e));
    }
    if let Some(e) = parse_bool(s) {
        return Ok(Some(e));
    }
    if let Some(e) = parse_null(s) {
        return Ok(Some(e));
    }
    Ok(parse_predicate_literal(s))
}

fn parse_variable(s: &Span) -> ParseResult<Option<Expression>> {
    let text = s.text();
    let mut chars = text.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return Ok(None),
    };
    if !(first.is_ascii_lowercase() || first == '_') || !text.chars().all(is_variable_char) {
        return Ok(None);
    }
    if text.starts_with("x_") {
        return Err(ParseError::syntax(
            s.clone(),
            "Variable names starting with >>x_<< are reserved for the compiler.",
        ));
    }
    Ok(Some(Expression::new(
        ExprKind::Variable(text.to_string()),
        s.clone(),
    )))
}

//
// Records.
//

/// Parses `{...}` record literals.
fn parse_record(s: &Span) -> ParseResult<Option<Expression>> {
    let s = strip(s);
    let text = s.text();
    if text.len() >= 2 && text.starts_with('{') && text.ends_with('}') {
        let inner = s.slice(1, s.len() - 1);
        if is_whole(&inner) {
            let record = parse_record_internals(&inner, true)?;
            return Ok(Some(Expression::new(ExprKind::Record(record), s.clone())));
        }
    }
    Ok(None)
}

/// Parses the internals of a record: positional, named, shorthand,
/// aggregating and splat fields.
pub fn parse_record_internals(s: &Span, is_record_literal: bool) -> ParseResult<Record> {
    let s = strip(s);
    if split(&s, ":-")?.len() > 1 {
        return Err(ParseError::syntax(
            s.clone(),
            "Unexpected >>:-<< in record internals. If you apply a function to a >>combine<< \
             statement, place it in auxiliary variable first.",
        ));
    }
    if s.is_empty() {
        return Ok(Record::empty());
    }
    let mut result = Vec::new();
    if !is_whole(&s) {
        return Ok(Record { field_values: result });
    }
    let field_values = split(&s, ",")?;
    let mut had_restof = false;
    let mut positional_ok = true;
    let mut observed_fields: Vec<String> = Vec::new();
    for (idx, field_value) in field_values.iter().enumerate() {
        if had_restof {
            return Err(ParseError::syntax(
                field_value.clone(),
                "Field >>..<rest_of><< must go last.",
            ));
        }
        if field_value.starts_with("..") {
            if is_record_literal {
                return Err(ParseError::syntax(
                    field_value.clone(),
                    "Field >>..<rest_of> in record literals<< is not currently supported.",
                ));
            }
            let rest = strip(&field_value.slice(2, field_value.len()));
            let mut fv = FieldValue::expression(Field::Splat, parse_expression(&rest)?);
            fv.except = observed_fields.clone();
            result.push(fv);
            had_restof = true;
            positional_ok = false;
            continue;
        }
        let observed_field;
        if let Some((field, value)) = split_in_one_or_two(field_value, ":")? {
            positional_ok = false;
            observed_field = field.text().to_string();
            let value = if value.is_empty() {
                let field_text = field.text();
                if field_text
                    .chars()
                    .next()
                    .map_or(false, |c| c.is_ascii_uppercase())
                {
                    return Err(ParseError::syntax(
                        field.clone(),
                        "Record fields may not start with capital letter, as it is reserved \
                         for predicate literals.\nBacktick the field name if you need it \
                         capitalized. E.g. \"Q(`A`: 1)\".",
                    ));
                }
                if field_text.starts_with('`') {
                    return Err(ParseError::syntax(
                        field.clone(),
                        "Backticks in variable names are disallowed. Please give an explicit \
                         variable for the value of the column.",
                    ));
                }
                field.clone()
            } else {
                value
            };
            result.push(FieldValue::expression(
                Field::Named(field.text().to_string()),
                parse_expression(&value)?,
            ));
        } else if let Some((field, value)) = split_in_one_or_two(field_value, "?")? {
            positional_ok = false;
            if field.is_empty() {
                return Err(ParseError::syntax(
                    field_value.clone(),
                    "Aggregated fields have to be named.",
                ));
            }
            observed_field = field.text().to_string();
            let (operator, expression) = split_in_two(&value, "=")?;
            result.push(FieldValue::new(
                Field::Named(field.text().to_string()),
                Value::Aggregation {
                    operator: operator.text().to_string(),
                    argument: parse_expression(&expression)?,
                },
            ));
        } else if positional_ok {
            observed_field = format!("col{idx}");
            result.push(FieldValue::expression(
                Field::Positional(idx),
                parse_expression(field_value)?,
            ));
        } else {
            return Err(ParseError::syntax(
                field_value.clone(),
                "Positional argument can not go after non-positional arguments.",
            ));
        }
        observed_fields.push(observed_field);
    }
    Ok(Record { field_values: result })
}

//
// Calls.
//

/// Parses a predicate call `Name(...)`.
///
/// The name scan allows dots, dollar templates, braces and backticks
/// (table references); any other nesting before the first argument
/// parenthesis means there is no call here.
pub fn parse_call(s: &Span) -> ParseResult<Option<Call>> {
    let s = strip(s);
    if s.is_empty() {
        return Ok(None);
    }
    let bytes = s.text().as_bytes();
    let mut open_idx = None;
    if s.starts_with("->") {
        open_idx = Some(2);
    } else {
        for visit in Traversal::new(&s) {
            let visit = visit?;
            if visit.state_is(b'(') {
                let prefix = &s.text()[..visit.idx];
                let good = |ch: char| {
                    ch.is_ascii_alphanumeric()
                        || matches!(ch, '@' | '_' | '.' | '$' | '{' | '}' | '+' | '-' | '`')
                };
                let backticked = visit.idx >= 2
                    && prefix.starts_with('`')
                    && prefix.ends_with('`');
                if (visit.idx > 0 && prefix.chars().all(good))
                    || prefix == "!"
                    || prefix == "++?"
                    || backticked
                {
                    open_idx = Some(visit.idx);
                }
                break;
            }
            if visit.state_len > 0
                && !visit.state_is(b'{')
                && visit.state_first != Some(b'`')
            {
                return Ok(None);
            }
        }
    }
    let open_idx = match open_idx {
        Some(i) => i,
        None => return Ok(None),
    };
    if bytes.get(open_idx) == Some(&b'(')
        && bytes.last() == Some(&b')')
        && is_whole(&s.slice(open_idx + 1, s.len() - 1))
    {
        let predicate = s.text()[..open_idx].to_string();
        let record = parse_record_internals(&s.slice(open_idx + 1, s.len() - 1), false)?;
        return Ok(Some(Call { predicate_name: predicate, record }));
    }
    Ok(None)
}

//
// Infix operators.
//

fn parse_infix(s: &Span, operators: &[&str]) -> ParseResult<Option<Expression>> {
    for op in operators {
        let parts = split_raw(s, op)?;
        if parts.len() < 2 {
            continue;
        }
        // Left is every operand but the last, so `a / b / c` parses as
        // `(a / b) / c`.
        let left_end = parts[parts.len() - 2].end() - s.start();
        let right_start = parts[parts.len() - 1].start() - s.start();
        let left = strip(&s.slice(0, left_end));
        let right = strip(&s.slice(right_start, s.len()));
        if left.is_empty() {
            if UNARY_OPERATORS.contains(op) {
                let record = parse_record_internals(&right, false)?;
                return Ok(Some(Expression::new(
                    ExprKind::Call(Call { predicate_name: op.to_string(), record }),
                    s.clone(),
                )));
            }
            // `~` and friends with an empty left-hand side are not
            // operators here; negation handles them.
            continue;
        }
        let left_expr = parse_expression(&left)?;
        let right_expr = parse_expression(&right)?;
        let call = Call::new(
            op.trim(),
            vec![
                FieldValue::expression(Field::Named("left".to_string()), left_expr),
                FieldValue::expression(Field::Named("right".to_string()), right_expr),
            ],
        );
        return Ok(Some(Expression::new(ExprKind::Call(call), s.clone())));
    }
    Ok(None)
}

//
// Combine, implication, inclusion, unification, negation, subscripts.
//

fn combine_rule(
    parsed_expression: Expression,
    operator: &str,
    parsed_body: Option<Vec<Proposition>>,
    full_text: Span,
) -> Rule {
    let aggregated = FieldValue::new(
        Field::Named(VALUE_FIELD.to_string()),
        Value::Aggregation { operator: operator.to_string(), argument: parsed_expression },
    );
    Rule {
        head: Call::new("Combine", vec![aggregated]),
        body: parsed_body,
        distinct_denoted: true,
        full_text,
    }
}

fn keyword_prefix(s: &Span, keyword: &str) -> bool {
    let text = s.text();
    text.strip_prefix(keyword)
        .map_or(false, |rest| rest.chars().next().map_or(false, |c| c.is_whitespace()))
}

fn parse_combine(s: &Span) -> ParseResult<Option<Expression>> {
    if !keyword_prefix(s, "combine") {
        return Ok(None);
    }
    let inner = strip(&s.slice("combine".len(), s.len()));
    let (value, body) = match split_in_one_or_two(&inner, ":-")? {
        Some((value, body)) => (value, Some(body)),
        None => (inner.clone(), None),
    };
    let (operator, expression) = split_in_two(&value, "=")?;
    let parsed_expression = parse_expression(&expression)?;
    let parsed_body = match body {
        Some(b) => Some(parse_conjunction(&b, true)?.expect("singleton allowed")),
        None => None,
    };
    let rule = combine_rule(parsed_expression, operator.text(), parsed_body, inner);
    Ok(Some(Expression::new(
        ExprKind::Combine(Box::new(rule)),
        s.clone(),
    )))
}

/// A concise combine proposition: `x Op= expr [:- body]`, equivalent to
/// `x == (combine Op= expr [:- body])`.
fn parse_concise_combine(s: &Span) -> ParseResult<Option<Proposition>> {
    let parts = split(s, "=")?;
    if parts.len() != 2 {
        return Ok(None);
    }
    let (lhs_and_op, combine) = (&parts[0], &parts[1]);
    let left_parts = split_on_whitespace(lhs_and_op)?;
    if left_parts.len() < 2 {
        return Ok(None);
    }
    let operator = &left_parts[left_parts.len() - 1];
    // These arise from comparison operators; bail out and let infix
    // parsing handle them.
    if ["!", "<", ">", "~"].contains(&operator.text()) {
        return Ok(None);
    }
    let lhs_end = left_parts[left_parts.len() - 2].end() - s.start();
    let lhs = strip(&s.slice(0, lhs_end));
    let left_expr = parse_expression(&lhs)?;
    let (expression, body) = match split_in_one_or_two(combine, ":-")? {
        Some((e, b)) => (e, Some(b)),
        None => (combine.clone(), None),
    };
    let parsed_expression = parse_expression(&expression)?;
    let parsed_body = match body {
        Some(b) => Some(parse_conjunction(&b, true)?.expect("singleton allowed")),
        None => None,
    };
    let rule = combine_rule(parsed_expression, operator.text(), parsed_body, s.clone());
    let right = Expression::new(ExprKind::Combine(Box::new(rule)), s.clone());
    Ok(Some(Proposition::Unification { left: left_expr, right }))
}

fn parse_implication(s: &Span) -> ParseResult<Option<Expression>> {
    if !(keyword_prefix(s, "if")) {
        return Ok(None);
    }
    let inner = s.slice(2, s.len());
    let mut if_thens_str = split(&inner, "else if")?;
    let last = if_thens_str.pop().expect("split yields at least one part");
    let (last_if_then, last_else) = split_in_two(&last, "else")?;
    if_thens_str.push(last_if_then);
    let mut if_thens = Vec::new();
    for condition_consequence in &if_thens_str {
        let (condition, consequence) = split_in_two(condition_consequence, "then")?;
        if_thens.push(IfThen {
            condition: parse_expression(&condition)?,
            consequence: parse_expression(&consequence)?,
        });
    }
    let otherwise = parse_expression(&last_else)?;
    Ok(Some(Expression::new(
        ExprKind::Implication(Implication { if_thens, otherwise: Box::new(otherwise) }),
        s.clone(),
    )))
}

fn parse_inclusion(s: &Span) -> ParseResult<Option<Proposition>> {
    let parts = split(s, "in")?;
    if parts.len() != 2 {
        return Ok(None);
    }
    Ok(Some(Proposition::Inclusion {
        element: parse_expression(&parts[0])?,
        list: parse_expression(&parts[1])?,
    }))
}

fn parse_unification(s: &Span) -> ParseResult<Option<Proposition>> {
    let parts = split(s, "==")?;
    if parts.len() != 2 {
        return Ok(None);
    }
    Ok(Some(Proposition::Unification {
        left: parse_expression(&parts[0])?,
        right: parse_expression(&parts[1])?,
    }))
}

/// Negation `~P(...)` desugars to `IsNull(combine Min= 1 :- ...)`.
fn parse_negation(s: &Span) -> ParseResult<Option<Proposition>> {
    let parts = split(s, "~")?;
    if parts.len() == 1 {
        return Ok(None);
    }
    if parts.len() != 2 || !parts[0].is_empty() {
        return Err(ParseError::syntax(
            s.clone(),
            "Negation \"~\" is a unary operator.",
        ));
    }
    let negated = strip(&parts[1]);
    let body = parse_conjunction(&negated, true)?.expect("singleton allowed");
    let one = Expression::number("1");
    let mut rule = combine_rule(one, "Min", Some(body), s.clone());
    rule.full_text = s.clone();
    let combine = Expression::new(ExprKind::Combine(Box::new(rule)), s.clone());
    let call = Call::new(
        "IsNull",
        vec![FieldValue::expression(Field::Positional(0), combine)],
    );
    Ok(Some(Proposition::Call(call)))
}

fn parse_negation_expression(s: &Span) -> ParseResult<Option<Expression>> {
    match parse_negation(s)? {
        Some(Proposition::Call(call)) => {
            Ok(Some(Expression::new(ExprKind::Call(call), s.clone())))
        }
        _ => Ok(None),
    }
}

/// `record.field` subscript.
fn parse_subscript(s: &Span) -> ParseResult<Option<Expression>> {
    let parts = split_raw(s, ".")?;
    if parts.len() < 2 {
        return Ok(None);
    }
    let record_end = parts[parts.len() - 2].end() - s.start();
    let record_str = strip(&s.slice(0, record_end));
    let field = &parts[parts.len() - 1];
    if !field
        .text()
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        || field.is_empty()
    {
        return Err(ParseError::syntax(s.clone(), "Subscript must be lowercase."));
    }
    let record = parse_expression(&record_str)?;
    Ok(Some(Expression::new(
        ExprKind::Subscript { record: Box::new(record), field: field.text().to_string() },
        s.clone(),
    )))
}

/// `array[i, j]` unfolds to `Element(Element(array, i), j)`.
fn parse_array_subscript(s: &Span) -> ParseResult<Option<Expression>> {
    let bytes = s.text().as_bytes();
    if bytes.last() != Some(&b']') {
        return Ok(None);
    }
    // Find the last top-level bracket group and require it to close the
    // span.
    let mut open = None;
    let mut close_of_open = None;
    for visit in Traversal::new(s) {
        let visit = visit?;
        if visit.state_is(b'[') && bytes[visit.idx] == b'[' {
            open = Some(visit.idx);
            close_of_open = None;
        }
        if visit.top_level() && open.is_some() && close_of_open.is_none() {
            close_of_open = Some(visit.idx);
        }
    }
    let (open, close) = match (open, close_of_open) {
        (Some(o), Some(c)) => (o, c),
        _ => return Ok(None),
    };
    if close != s.len() - 1 || open == 0 {
        return Ok(None);
    }
    let array = strip(&s.slice(0, open));
    let inner = strip(&s.slice(open + 1, close));
    if inner.is_empty() {
        return Ok(None);
    }
    let mut expr = parse_expression(&array)?;
    for index in split(&inner, ",")? {
        let index_expr = parse_expression(&index)?;
        let call = Call::new(
            "Element",
            vec![
                FieldValue::expression(Field::Positional(0), expr),
                FieldValue::expression(Field::Positional(1), index_expr),
            ],
        );
        expr = Expression::new(ExprKind::Call(call), s.clone());
    }
    Ok(Some(expr))
}

//
// Expressions and propositions.
//

pub fn parse_expression(s: &Span) -> ParseResult<Expression> {
    let s = strip(s);
    if let Some(e) = parse_combine(&s)? {
        return Ok(e);
    }
    if let Some(e) = parse_implication(&s)? {
        return Ok(e);
    }
    if let Some(e) = parse_literal(&s)? {
        return Ok(e);
    }
    if let Some(e) = parse_variable(&s)? {
        return Ok(e);
    }
    if let Some(e) = parse_record(&s)? {
        return Ok(e);
    }
    if let Some(call) = parse_call(&s)? {
        return Ok(Expression::new(ExprKind::Call(call), s.clone()));
    }
    if let Some(e) = parse_infix(&s, OPERATORS)? {
        return Ok(e);
    }
    if let Some(e) = parse_array_subscript(&s)? {
        return Ok(e);
    }
    if let Some(e) = parse_subscript(&s)? {
        return Ok(e);
    }
    if let Some(e) = parse_negation_expression(&s)? {
        return Ok(e);
    }
    Err(ParseError::syntax(
        s.clone(),
        "Could not parse expression of a value.",
    ))
}

pub fn parse_proposition(s: &Span) -> ParseResult<Proposition> {
    let s = strip(s);
    if let Some(d) = parse_disjunction(&s)? {
        return Ok(d);
    }
    let str_conjuncts = split(&s, ",")?;
    if str_conjuncts.len() > 1 {
        let c = parse_conjunction(&s, false)?.expect("multiple conjuncts");
        return Ok(Proposition::Conjunction(c));
    }
    if parse_implication(&s)?.is_some() {
        return Err(ParseError::syntax(
            s.clone(),
            "If-then-else clause is only supported as an expression, not as a proposition.",
        ));
    }
    if let Some(call) = parse_call(&s)? {
        return Ok(Proposition::Call(call));
    }
    if let Some(e) = parse_infix(&s, &["&&", "||"])? {
        if let ExprKind::Call(call) = e.kind {
            return Ok(Proposition::Call(call));
        }
    }
    if let Some(u) = parse_unification(&s)? {
        return Ok(u);
    }
    if let Some(i) = parse_inclusion(&s)? {
        return Ok(i);
    }
    if let Some(c) = parse_concise_combine(&s)? {
        return Ok(c);
    }
    if let Some(e) = parse_infix(&s, OPERATORS)? {
        if let ExprKind::Call(call) = e.kind {
            return Ok(Proposition::Call(call));
        }
    }
    if let Some(n) = parse_negation(&s)? {
        return Ok(n);
    }
    Err(ParseError::syntax(s.clone(), "Could not parse proposition."))
}

pub fn parse_conjunction(
    s: &Span,
    allow_singleton: bool,
) -> ParseResult<Option<Vec<Proposition>>> {
    let str_conjuncts = split(s, ",")?;
    if str_conjuncts.len() == 1 && !allow_singleton {
        return Ok(None);
    }
    let mut conjuncts = Vec::new();
    for c in &str_conjuncts {
        conjuncts.push(parse_proposition(c)?);
    }
    Ok(Some(conjuncts))
}

fn parse_disjunction(s: &Span) -> ParseResult<Option<Proposition>> {
    let str_disjuncts = split(s, "|")?;
    if str_disjuncts.len() == 1 {
        return Ok(None);
    }
    let mut disjuncts = Vec::new();
    for d in &str_disjuncts {
        disjuncts.push(parse_proposition(d)?);
    }
    Ok(Some(Proposition::Disjunction(disjuncts)))
}

//
// Rule heads, denotations, rules.
//

/// Parses a rule head call and its optional `[Op]= value` assignment.
/// Returns the call and whether aggregation (implying distinct) was seen.
fn parse_head_call(s: &Span) -> ParseResult<(Call, bool)> {
    let mut saw_open = false;
    let mut call_end = None;
    for visit in Traversal::new(s) {
        let visit = visit?;
        if visit.state_is(b'(') {
            saw_open = true;
        }
        if saw_open && visit.top_level() {
            call_end = Some(visit.idx);
            break;
        }
    }
    let call_end = match call_end {
        Some(i) => i,
        None => {
            return Err(ParseError::syntax(s.clone(), "Found no call in rule head."));
        }
    };
    let call_str = s.slice(0, call_end + 1);
    let post_call_str = s.slice(call_end + 1, s.len());
    let mut call = match parse_call(&call_str)? {
        Some(c) => c,
        None => {
            return Err(ParseError::syntax(
                call_str,
                "Could not parse predicate call.",
            ));
        }
    };
    let operator_expression = split(&post_call_str, "=")?;
    match operator_expression.len() {
        1 => {
            if !operator_expression[0].is_empty() {
                return Err(ParseError::syntax(
                    operator_expression[0].clone(),
                    "Unexpected text in the head of a rule.",
                ));
            }
            Ok((call, false))
        }
        2 => {
            let operator = &operator_expression[0];
            let expression = parse_expression(&operator_expression[1])?;
            if operator.is_empty() {
                call.record.field_values.push(FieldValue::expression(
                    Field::Named(VALUE_FIELD.to_string()),
                    expression,
                ));
                Ok((call, false))
            } else {
                call.record.field_values.push(FieldValue::new(
                    Field::Named(VALUE_FIELD.to_string()),
                    Value::Aggregation {
                        operator: operator.text().to_string(),
                        argument: expression,
                    },
                ));
                Ok((call, true))
            }
        }
        _ => Err(ParseError::syntax(
            post_call_str,
            "Too many '=' in predicate value.",
        )),
    }
}

/// A column of an `order_by` denotation.
#[derive(Clone, Debug)]
struct OrderByColumn {
    column: String,
    descending: bool,
}

/// Denotations extracted from a rule head, promoted to sibling annotation
/// rules by the statement parser.
#[derive(Clone, Debug, Default)]
struct Denotations {
    order_by: Option<Vec<OrderByColumn>>,
    limit: Option<String>,
    flags: Vec<&'static str>,
}

/// Strips denotations off the head. Grammar, in order:
/// `[couldbe|cantbe|shouldbe] [order_by col [desc], ...] [limit N]`.
fn extract_denotations(head: &Span) -> ParseResult<(Span, Denotations)> {
    let mut head = head.clone();
    let mut denotations = Denotations::default();
    if let Some((rest, limit)) = split_in_one_or_two(&head, "limit")? {
        let number = parse_number(&limit).ok_or_else(|| {
            ParseError::syntax(limit.clone(), "The limit denotation takes a number.")
        })?;
        if let ExprKind::Literal(Literal::Number(n)) = number.kind {
            denotations.limit = Some(n);
        }
        head = rest;
    }
    if let Some((rest, order_by)) = split_in_one_or_two(&head, "order_by")? {
        let mut columns = Vec::new();
        for column in split(&order_by, ",")? {
            let words = split_on_whitespace(&column)?;
            let (name, descending) = match words.as_slice() {
                [name] => (name, false),
                [name, direction] if direction.text() == "desc" => (name, true),
                [name, direction] if direction.text() == "asc" => (name, false),
                _ => {
                    return Err(ParseError::syntax(
                        column.clone(),
                        "An order_by column is a name optionally followed by >>desc<<.",
                    ));
                }
            };
            if !name
                .text()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ParseError::syntax(
                    name.clone(),
                    "An order_by column must be a column name.",
                ));
            }
            columns.push(OrderByColumn {
                column: name.text().to_string(),
                descending,
            });
        }
        denotations.order_by = Some(columns);
        head = rest;
    }
    for (keyword, annotation) in [
        ("couldbe", "@CouldBe"),
        ("cantbe", "@CantBe"),
        ("shouldbe", "@ShouldBe"),
    ] {
        if let Some((rest, tail)) = split_in_one_or_two(&head, keyword)? {
            if !tail.is_empty() {
                return Err(ParseError::syntax(
                    tail,
                    format!("Unexpected text after >>{keyword}<<."),
                ));
            }
            denotations.flags.push(annotation);
            head = rest;
        }
    }
    Ok((head, denotations))
}

fn annotation_rule(name: &str, subject: &str, args: Vec<Expression>, text: String) -> Rule {
    let mut field_values = vec![FieldValue::expression(
        Field::Positional(0),
        Expression::predicate_literal(subject),
    )];
    for (i, arg) in args.into_iter().enumerate() {
        field_values.push(FieldValue::expression(Field::Positional(i + 1), arg));
    }
    Rule {
        head: Call::new(name, field_values),
        body: None,
        distinct_denoted: false,
        full_text: Span::new(text),
    }
}

fn denotation_annotations(denotations: &Denotations, predicate: &str) -> Vec<Rule> {
    let mut result = Vec::new();
    if let Some(order_by) = &denotations.order_by {
        let mut args = Vec::new();
        let mut rendering = Vec::new();
        for col in order_by {
            args.push(Expression::string_literal(col.column.clone()));
            rendering.push(format!("\"{}\"", col.column));
            if col.descending {
                args.push(Expression::string_literal("DESC"));
                rendering.push("\"DESC\"".to_string());
            }
        }
        result.push(annotation_rule(
            "@OrderBy",
            predicate,
            args,
            format!("@OrderBy({predicate}, {})", rendering.join(", ")),
        ));
    }
    if let Some(limit) = &denotations.limit {
        result.push(annotation_rule(
            "@Limit",
            predicate,
            vec![Expression::number(limit.clone())],
            format!("@Limit({predicate}, {limit})"),
        ));
    }
    for annotation in &denotations.flags {
        result.push(annotation_rule(
            annotation,
            predicate,
            vec![],
            format!("{annotation}({predicate})"),
        ));
    }
    result
}

/// Parses a plain rule. Returns the rule and its sibling annotation rules
/// synthesized from denotations.
pub fn parse_rule(s: &Span) -> ParseResult<(Rule, Vec<Rule>)> {
    let parts = split(s, ":-")?;
    if parts.len() > 2 {
        return Err(ParseError::syntax(
            s.clone(),
            "Too many :- in a rule. Did you forget >>semicolon<<?",
        ));
    }
    let (head, denotations) = extract_denotations(&parts[0])?;
    let head_distinct = split(&head, "distinct")?;
    let (parsed_head_call, mut distinct_denoted) = match head_distinct.len() {
        1 => parse_head_call(&head)?,
        2 if head_distinct[1].is_empty() => {
            let (call, _) = parse_head_call(&head_distinct[0])?;
            (call, true)
        }
        _ => {
            return Err(ParseError::syntax(
                head.clone(),
                "Can not parse rule head. Something is wrong with how >>distinct<< is used.",
            ));
        }
    };
    if head_distinct.len() == 1 {
        // Aggregation in the head implies distinct.
        distinct_denoted = distinct_denoted
            || parsed_head_call
                .record
                .field_values
                .iter()
                .any(|fv| fv.value.is_aggregated());
    }
    let body = if parts.len() == 2 {
        Some(parse_conjunction(&parts[1], true)?.expect("singleton allowed"))
    } else {
        None
    };
    let rule = Rule {
        head: parsed_head_call,
        body,
        distinct_denoted,
        full_text: s.clone(),
    };
    let annotations = denotation_annotations(&denotations, rule.predicate_name());
    Ok((rule, annotations))
}

/// `NewName := Template(Slot: Value, ...)` becomes `@Make(...)`.
fn parse_functor_rule(s: &Span) -> ParseResult<Option<Rule>> {
    let parts = split(s, ":=")?;
    if parts.len() != 2 {
        return Ok(None);
    }
    let new_predicate = parse_expression(&parts[0])?;
    let definition = parse_expression(&parts[1])?;
    let definition = match definition.kind {
        ExprKind::Call(call) => call,
        _ => return Err(ParseError::syntax(parts[1].clone(), functor_syntax_error())),
    };
    if !matches!(
        new_predicate.kind,
        ExprKind::Literal(Literal::Predicate(_))
    ) {
        return Err(ParseError::syntax(parts[0].clone(), functor_syntax_error()));
    }
    let applicant = Expression::predicate_literal(definition.predicate_name.clone());
    let arguments = Expression::new(
        ExprKind::Record(definition.record),
        parts[1].clone(),
    );
    Ok(Some(Rule {
        head: Call::new(
            "@Make",
            vec![
                FieldValue::expression(Field::Positional(0), new_predicate),
                FieldValue::expression(Field::Positional(1), applicant),
                FieldValue::expression(Field::Positional(2), arguments),
            ],
        ),
        body: None,
        distinct_denoted: false,
        full_text: s.clone(),
    }))
}

/// `Head(args) --> value` synthesizes `@CompileAsUdf(Head)` and
/// `Head(args) = value`.
fn parse_function_rule(s: &Span) -> ParseResult<Option<Vec<Rule>>> {
    let parts = split_raw(s, "-->")?;
    if parts.len() != 2 {
        return Ok(None);
    }
    let call = parse_call(&parts[0])?.ok_or_else(|| {
        ParseError::syntax(
            parts[0].clone(),
            "Left hand side of function definition must be a predicate call.",
        )
    })?;
    let annotation = annotation_rule(
        "@CompileAsUdf",
        &call.predicate_name,
        vec![],
        format!("@CompileAsUdf({})", call.predicate_name),
    );
    let rewritten = Span::new(format!(
        "{} = {}",
        parts[0].text().trim(),
        parts[1].text().trim()
    ));
    let (rule, _) = parse_rule(&rewritten)?;
    Ok(Some(vec![annotation, rule]))
}

//
// Files and imports.
//

#[derive(Clone, Debug)]
pub struct ImportedPredicate {
    pub file: String,
    pub predicate_name: String,
    pub synonym: Option<String>,
}

/// A parsed, rewritten, rename-complete file. For the main file, rules of
/// all transitively imported files are merged in.
#[derive(Clone, Debug)]
pub struct ParsedUnit {
    pub rules: Vec<Rule>,
    pub imported_predicates: Vec<ImportedPredicate>,
    pub predicates_prefix: String,
    pub file_name: String,
}

fn defined_predicates(rules: &[Rule]) -> IndexSet<String> {
    rules.iter().map(|r| r.predicate_name().to_string()).collect()
}

fn made_predicates(rules: &[Rule]) -> IndexSet<String> {
    let mut result = IndexSet::new();
    for rule in rules {
        if rule.predicate_name() == "@Make" {
            if let Some(fv) = rule.head.record.field(&Field::Positional(0)) {
                if let Some(Expression {
                    kind: ExprKind::Literal(Literal::Predicate(name)),
                    ..
                }) = fv.value.as_expr()
                {
                    result.insert(name.clone());
                }
            }
        }
    }
    result
}

fn grounded_predicates(rules: &[Rule]) -> IndexSet<String> {
    let mut result = IndexSet::new();
    for rule in rules {
        if rule.predicate_name() == "@Ground" {
            if let Some(fv) = rule.head.record.field(&Field::Positional(0)) {
                if let Some(Expression {
                    kind: ExprKind::Literal(Literal::Predicate(name)),
                    ..
                }) = fv.value.as_expr()
                {
                    result.insert(name.clone());
                }
            }
        }
    }
    result
}

fn rename_in_rules(rules: &mut [Rule], old: &str, new: &str) -> usize {
    rules
        .iter_mut()
        .map(|r| crate::ast::rename_predicate(r, old, new))
        .sum()
}

/// Splits an import statement into (file path, predicate, synonym).
fn split_import(import_str: &Span) -> Result<(String, String, Option<String>)> {
    let parts = split(import_str, "as").map_err(CompileError::Parse)?;
    if parts.len() > 2 {
        return Err(ParseError::syntax(import_str.clone(), "Too many \"as\" in import.").into());
    }
    let synonym = parts.get(1).map(|s| s.text().to_string());
    let import_path = parts[0].text().to_string();
    let import_parts: Vec<&str> = import_path.split('.').collect();
    let predicate = import_parts[import_parts.len() - 1].to_string();
    if !predicate
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_uppercase())
    {
        return Err(ParseError::syntax(
            import_str.clone(),
            "One import per predicate please: the last path component must be a predicate.",
        )
        .into());
    }
    let file = import_parts[..import_parts.len() - 1].join(".");
    Ok((file, predicate, synonym))
}

/// Loads and parses files, detecting import cycles and assigning unique
/// per-file predicate prefixes.
pub struct FileParser {
    import_roots: Vec<PathBuf>,
    /// file import path -> parsed unit; `None` marks an in-flight parse
    /// (a cycle when hit again). Insertion order drives prefix allocation
    /// and the final rule merge, so this map must preserve it.
    parsed_imports: IndexMap<String, Option<ParsedUnit>>,
}

impl FileParser {
    pub fn new(import_roots: Vec<PathBuf>) -> FileParser {
        FileParser { parsed_imports: IndexMap::new(), import_roots }
    }

    /// Parses the main program.
    pub fn parse(&mut self, text: &str) -> Result<ParsedUnit> {
        self.parse_file(text, "main", &[])
    }

    fn parse_import(&mut self, file_import: &str, import_chain: &[String]) -> Result<()> {
        if let Some(state) = self.parsed_imports.get(file_import) {
            if state.is_none() {
                let mut chain: Vec<String> = import_chain.to_vec();
                chain.push(file_import.to_string());
                return Err(CompileError::Import {
                    message: "Circular imports are not allowed.".to_string(),
                    chain,
                });
            }
            return Ok(());
        }
        self.parsed_imports.insert(file_import.to_string(), None);
        let relative: PathBuf = file_import.split('.').collect::<Vec<_>>().join("/").into();
        let relative = relative.with_extension("l");
        let mut considered = Vec::new();
        let mut content = None;
        for root in &self.import_roots {
            let path = root.join(&relative);
            considered.push(path.display().to_string());
            if path.exists() {
                content = Some(fs::read_to_string(&path).map_err(|e| CompileError::Import {
                    message: format!("Could not read {}: {e}", path.display()),
                    chain: import_chain.to_vec(),
                })?);
                break;
            }
        }
        let content = content.ok_or_else(|| CompileError::Import {
            message: format!(
                "Imported file not found. Considered:\n- {}",
                considered.join("\n- ")
            ),
            chain: import_chain.to_vec(),
        })?;
        let unit = self.parse_file(&content, file_import, import_chain)?;
        self.parsed_imports
            .insert(file_import.to_string(), Some(unit));
        Ok(())
    }

    fn allocate_prefix(&self, file_name: &str) -> Result<String> {
        let mut existing = IndexSet::new();
        for unit in self.parsed_imports.values().flatten() {
            existing.insert(unit.predicates_prefix.clone());
        }
        fn capitalize(s: &str) -> String {
            let mut chars = s.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        }
        let parts: Vec<&str> = file_name.split('.').collect();
        let mut idx = parts.len() - 1;
        let mut prefix = format!("{}_", capitalize(parts[idx]));
        while existing.contains(&prefix) {
            if idx == 0 {
                return Err(CompileError::Import {
                    message: format!(
                        "Import paths are equal modulo '_' and '/'; cannot build a unique \
                         prefix: {prefix}"
                    ),
                    chain: vec![file_name.to_string()],
                });
            }
            idx -= 1;
            prefix = format!("{}{prefix}", capitalize(parts[idx]));
        }
        Ok(prefix)
    }

    fn parse_file(
        &mut self,
        text: &str,
        file_name: &str,
        import_chain: &[String],
    ) -> Result<ParsedUnit> {
        let mut chain: Vec<String> = import_chain.to_vec();
        chain.push(file_name.to_string());

        let buffer = Span::new(remove_comments(text)?);
        let statements = split(&buffer, ";").map_err(CompileError::Parse)?;
        let mut rules: Vec<Rule> = Vec::new();
        let mut imported_predicates = Vec::new();
        let mut created_by_import: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for statement in &statements {
            if statement.is_empty() {
                continue;
            }
            if statement.starts_with("import ") {
                let import_str = strip(&statement.slice("import ".len(), statement.len()));
                let (file, predicate, synonym) = split_import(&import_str)?;
                self.parse_import(&file, &chain)?;
                if !created_by_import.contains_key(&file) {
                    let unit = self.parsed_imports[&file]
                        .as_ref()
                        .expect("import just parsed");
                    let mut created = defined_predicates(&unit.rules);
                    created.extend(made_predicates(&unit.rules));
                    created.extend(grounded_predicates(&unit.rules));
                    created_by_import.insert(file.clone(), created);
                }
                imported_predicates.push(ImportedPredicate {
                    file,
                    predicate_name: predicate,
                    synonym,
                });
                continue;
            }
            if let Some(annotation_and_rule) = parse_function_rule(statement)? {
                rules.extend(annotation_and_rule);
                continue;
            }
            if let Some(rule) = parse_functor_rule(statement)? {
                rules.push(rule);
                continue;
            }
            let (rule, annotations) = parse_rule(statement)?;
            rules.push(rule);
            rules.extend(annotations);
        }

        // Eliminate explicit disjunctions via DNF reduction.
        let rules = rewrite::dnf_rewrite(rules);
        // Multi-body aggregation uses the concise aggregation structure.
        let rules = rewrite::multi_body_aggregation_rewrite(rules)?;
        // The concise structure is no longer needed.
        let mut rules = rewrite::aggregations_as_expressions_rewrite(rules);

        let predicates_prefix = if file_name == "main" {
            String::new()
        } else {
            self.allocate_prefix(file_name)?
        };

        // Prefix locally defined predicates of imported files.
        if file_name != "main" {
            let mut own = defined_predicates(&rules);
            own.extend(made_predicates(&rules));
            for p in own {
                if !p.starts_with('@') && p != "++?" {
                    rename_in_rules(&mut rules, &p, &format!("{predicates_prefix}{p}"));
                }
            }
        }

        // Rewrite references to imported predicates.
        for imported in &imported_predicates {
            let unit_prefix = self.parsed_imports[&imported.file]
                .as_ref()
                .expect("import parsed")
                .predicates_prefix
                .clone();
            let imported_as = imported
                .synonym
                .clone()
                .unwrap_or_else(|| imported.predicate_name.clone());
            let target = format!("{unit_prefix}{}", imported.predicate_name);
            let count = rename_in_rules(&mut rules, &imported_as, &target);
            if !created_by_import[&imported.file].contains(&target) {
                return Err(CompileError::Import {
                    message: format!(
                        "Predicate {} from file {} is imported by {}, but is not defined.",
                        imported.predicate_name, imported.file, file_name
                    ),
                    chain,
                });
            }
            if count == 0 {
                return Err(CompileError::Import {
                    message: format!(
                        "Predicate {} from file {} is imported by {}, but not used.",
                        imported.predicate_name, imported.file, file_name
                    ),
                    chain,
                });
            }
        }

        // The main file assembles all rules together.
        if file_name == "main" {
            let mut defined = defined_predicates(&rules);
            for (imported_file, unit) in &self.parsed_imports {
                let unit = unit.as_ref().expect("all imports parsed");
                let new_predicates = defined_predicates(&unit.rules);
                let overridden: Vec<&String> = defined
                    .intersection(&new_predicates)
                    .filter(|p| !p.starts_with('@'))
                    .collect();
                if !overridden.is_empty() {
                    return Err(CompileError::Import {
                        message: format!(
                            "Predicate from file {} is overridden by some importer: {}.",
                            imported_file,
                            overridden
                                .iter()
                                .map(|s| s.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                        chain,
                    });
                }
                defined.extend(new_predicates);
                rules.extend(unit.rules.iter().cloned());
            }
        }

        Ok(ParsedUnit {
            rules,
            imported_predicates,
            predicates_prefix,
            file_name: file_name.to_string(),
        })
    }
}

/// Parses a self-contained program (no import roots).
pub fn parse_program(text: &str) -> Result<ParsedUnit> {
    FileParser::new(Vec::new()).parse(text)
}
