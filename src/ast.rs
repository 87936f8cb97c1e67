//! The abstract syntax tree of Logica.
//!
//! A closed set of tagged variants, one per syntactic category. Every
//! expression carries its heritage span. Equality ignores heritage: two
//! nodes are equal when they denote the same syntax, wherever they were
//! parsed from (rewrites synthesize nodes freely).

use indexmap::IndexSet;

use crate::source::Span;

pub type PredicateName = String;
pub type VariableName = String;

/// The reserved value column of value-producing and aggregating heads.
pub const VALUE_FIELD: &str = "logica_value";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    /// Auto-named positional field; renders as `col<n>`.
    Positional(usize),
    Named(String),
    /// The `..rest` splat; renders as `*`.
    Splat,
}

impl Field {
    /// The SQL column name this field maps to.
    pub fn sql_name(&self) -> String {
        match self {
            Field::Positional(i) => format!("col{i}"),
            Field::Named(name) => name.clone(),
            Field::Splat => "*".to_string(),
        }
    }

    pub fn as_named(&self) -> Option<&str> {
        match self {
            Field::Named(name) => Some(name),
            _ => None,
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sql_name())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    /// Numbers are carried as source text; SQL receives them verbatim.
    Number(String),
    Str(String),
    Bool(bool),
    Null,
    List(Vec<Expression>),
    /// A predicate used as a value, e.g. functor arguments.
    Predicate(PredicateName),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub field_values: Vec<FieldValue>,
}

impl Record {
    pub fn empty() -> Record {
        Record { field_values: Vec::new() }
    }

    pub fn field(&self, field: &Field) -> Option<&FieldValue> {
        self.field_values.iter().find(|fv| &fv.field == field)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldValue {
    pub field: Field,
    pub value: Value,
    /// For splat fields: names already bound by earlier fields, to be
    /// excluded from the rest-of row.
    pub except: Vec<String>,
}

impl FieldValue {
    pub fn new(field: Field, value: Value) -> FieldValue {
        FieldValue { field, value, except: Vec::new() }
    }

    pub fn expression(field: Field, expr: Expression) -> FieldValue {
        FieldValue::new(field, Value::Expr(expr))
    }
}

/// A field's value: a plain expression, a raw aggregation as parsed from the
/// head (`name? Op= expr`), or the aggregation rewritten into an expression
/// over `Agg`-operators (the only aggregated form the translator accepts).
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Expr(Expression),
    Aggregation { operator: String, argument: Expression },
    AggregatedExpr(Expression),
}

impl Value {
    pub fn as_expr(&self) -> Option<&Expression> {
        match self {
            Value::Expr(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_aggregated(&self) -> bool {
        matches!(self, Value::Aggregation { .. } | Value::AggregatedExpr(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub predicate_name: PredicateName,
    pub record: Record,
}

impl Call {
    pub fn new(predicate_name: impl Into<String>, field_values: Vec<FieldValue>) -> Call {
        Call {
            predicate_name: predicate_name.into(),
            record: Record { field_values },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfThen {
    pub condition: Expression,
    pub consequence: Expression,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Implication {
    pub if_thens: Vec<IfThen>,
    pub otherwise: Box<Expression>,
}

#[derive(Clone, Debug)]
pub struct Expression {
    pub kind: ExprKind,
    /// The exact source substring this expression was parsed from.
    pub heritage: Span,
}

// Heritage excluded: rewrites must be able to compare parsed and
// synthesized trees.
impl PartialEq for Expression {
    fn eq(&self, other: &Expression) -> bool {
        self.kind == other.kind
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Variable(VariableName),
    Record(Record),
    Call(Call),
    Subscript { record: Box<Expression>, field: String },
    /// A combine expression packages a mini aggregating rule.
    Combine(Box<Rule>),
    Implication(Implication),
}

impl Expression {
    pub fn new(kind: ExprKind, heritage: Span) -> Expression {
        Expression { kind, heritage }
    }

    /// A synthesized node whose heritage is its own rendering.
    pub fn synthetic(kind: ExprKind, text: impl Into<String>) -> Expression {
        Expression { kind, heritage: Span::new(text.into()) }
    }

    pub fn variable(name: impl Into<String>) -> Expression {
        let name = name.into();
        Expression::synthetic(ExprKind::Variable(name.clone()), name)
    }

    pub fn number(text: impl Into<String>) -> Expression {
        let text = text.into();
        Expression::synthetic(ExprKind::Literal(Literal::Number(text.clone())), text)
    }

    pub fn predicate_literal(name: impl Into<String>) -> Expression {
        let name = name.into();
        Expression::synthetic(ExprKind::Literal(Literal::Predicate(name.clone())), name)
    }

    pub fn string_literal(text: impl Into<String>) -> Expression {
        let text = text.into();
        Expression::synthetic(
            ExprKind::Literal(Literal::Str(text.clone())),
            format!("\"{text}\""),
        )
    }

    pub fn call(name: impl Into<String>, field_values: Vec<FieldValue>) -> Expression {
        let call = Call::new(name, field_values);
        let text = call.predicate_name.clone();
        Expression::synthetic(ExprKind::Call(call), text)
    }

    pub fn as_variable(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Variable(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub head: Call,
    /// Post-DNF bodies are plain conjunct lists; disjunctions only occur
    /// nested inside propositions before the rewrite.
    pub body: Option<Vec<Proposition>>,
    pub distinct_denoted: bool,
    pub full_text: Span,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Rule) -> bool {
        self.head == other.head
            && self.body == other.body
            && self.distinct_denoted == other.distinct_denoted
    }
}

impl Rule {
    pub fn predicate_name(&self) -> &str {
        &self.head.predicate_name
    }

    pub fn is_annotation(&self) -> bool {
        self.head.predicate_name.starts_with('@')
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Proposition {
    Call(Call),
    Unification { left: Expression, right: Expression },
    Inclusion { element: Expression, list: Expression },
    Conjunction(Vec<Proposition>),
    Disjunction(Vec<Proposition>),
}

//
// Typed traversal.
//
// The original expressed rename/substitution as reflective walks over
// arbitrary trees; here each walk is a visitor with rewrite_children
// combinators per node kind. The rename contract is exact string match on
// predicate names and record field names, case-sensitive.
//

pub trait Visitor {
    /// Called for every expression, before children.
    fn expression(&mut self, _expr: &mut Expression) {}
    /// Called for every predicate-name occurrence: calls and predicate
    /// literals.
    fn predicate_name(&mut self, _name: &mut String) {}
    /// Called for every named record field.
    fn field_name(&mut self, _name: &mut String) {}
    /// Called for every record, before its fields.
    fn record(&mut self, _record: &mut Record) {}
    /// Whether to descend into combine sub-rules.
    fn enter_combines(&mut self) -> bool {
        true
    }
}

pub fn walk_rule<V: Visitor + ?Sized>(v: &mut V, rule: &mut Rule) {
    walk_call(v, &mut rule.head);
    if let Some(body) = &mut rule.body {
        for p in body {
            walk_proposition(v, p);
        }
    }
}

pub fn walk_proposition<V: Visitor + ?Sized>(v: &mut V, prop: &mut Proposition) {
    match prop {
        Proposition::Call(call) => walk_call(v, call),
        Proposition::Unification { left, right } => {
            walk_expression(v, left);
            walk_expression(v, right);
        }
        Proposition::Inclusion { element, list } => {
            walk_expression(v, element);
            walk_expression(v, list);
        }
        Proposition::Conjunction(ps) | Proposition::Disjunction(ps) => {
            for p in ps {
                walk_proposition(v, p);
            }
        }
    }
}

pub fn walk_call<V: Visitor + ?Sized>(v: &mut V, call: &mut Call) {
    v.predicate_name(&mut call.predicate_name);
    walk_record(v, &mut call.record);
}

pub fn walk_record<V: Visitor + ?Sized>(v: &mut V, record: &mut Record) {
    v.record(record);
    for fv in &mut record.field_values {
        if let Field::Named(name) = &mut fv.field {
            v.field_name(name);
        }
        match &mut fv.value {
            Value::Expr(e) | Value::AggregatedExpr(e) | Value::Aggregation { argument: e, .. } => {
                walk_expression(v, e)
            }
        }
    }
}

pub fn walk_expression<V: Visitor + ?Sized>(v: &mut V, expr: &mut Expression) {
    v.expression(expr);
    match &mut expr.kind {
        ExprKind::Literal(Literal::List(elements)) => {
            for e in elements {
                walk_expression(v, e);
            }
        }
        ExprKind::Literal(Literal::Predicate(name)) => v.predicate_name(name),
        ExprKind::Literal(_) | ExprKind::Variable(_) => {}
        ExprKind::Record(record) => walk_record(v, record),
        ExprKind::Call(call) => walk_call(v, call),
        ExprKind::Subscript { record, .. } => walk_expression(v, record),
        ExprKind::Combine(rule) => {
            if v.enter_combines() {
                walk_rule(v, rule);
            }
        }
        ExprKind::Implication(implication) => {
            for it in &mut implication.if_thens {
                walk_expression(v, &mut it.condition);
                walk_expression(v, &mut it.consequence);
            }
            walk_expression(v, &mut implication.otherwise);
        }
    }
}

struct Renamer<'a> {
    old: &'a str,
    new: &'a str,
    count: usize,
}

impl Visitor for Renamer<'_> {
    fn predicate_name(&mut self, name: &mut String) {
        if name == self.old {
            *name = self.new.to_string();
            self.count += 1;
        }
    }

    fn field_name(&mut self, name: &mut String) {
        if name == self.old {
            *name = self.new.to_string();
            self.count += 1;
        }
    }
}

/// Renames a predicate throughout a rule, counting replacements. Field
/// names are treated as predicate names: functors substitute through both.
pub fn rename_predicate(rule: &mut Rule, old: &str, new: &str) -> usize {
    let mut renamer = Renamer { old, new, count: 0 };
    walk_rule(&mut renamer, rule);
    renamer.count
}

struct VariableCollector {
    dive_into_combines: bool,
    found: IndexSet<String>,
}

impl Visitor for VariableCollector {
    fn expression(&mut self, expr: &mut Expression) {
        if let ExprKind::Variable(name) = &expr.kind {
            self.found.insert(name.clone());
        }
    }

    fn enter_combines(&mut self) -> bool {
        self.dive_into_combines
    }
}

/// All variables mentioned in an expression. Variables inside `combine`
/// sub-expressions resolve against the combine's own tables, so they are
/// excluded unless `dive_into_combines` is set.
pub fn mentioned_variables(expr: &Expression, dive_into_combines: bool) -> IndexSet<String> {
    let mut collector = VariableCollector { dive_into_combines, found: IndexSet::new() };
    let mut e = expr.clone();
    walk_expression(&mut collector, &mut e);
    collector.found
}

/// All variables mentioned in a rule (head and body), with the same
/// combine-diving convention as [`mentioned_variables`].
pub fn mentioned_variables_in_rule(rule: &Rule, dive_into_combines: bool) -> IndexSet<String> {
    let mut collector = VariableCollector { dive_into_combines, found: IndexSet::new() };
    let mut r = rule.clone();
    walk_rule(&mut collector, &mut r);
    collector.found
}

pub fn mentioned_variables_of_all<'a>(
    exprs: impl IntoIterator<Item = &'a Expression>,
    dive_into_combines: bool,
) -> IndexSet<String> {
    let mut result = IndexSet::new();
    for e in exprs {
        result.extend(mentioned_variables(e, dive_into_combines));
    }
    result
}

struct PredicateCollector {
    found: IndexSet<String>,
}

impl Visitor for PredicateCollector {
    fn predicate_name(&mut self, name: &mut String) {
        self.found.insert(name.clone());
    }
}

/// All predicate names mentioned anywhere in the rule, including inside
/// combine sub-expressions and predicate literals.
pub fn mentioned_predicates(rule: &Rule) -> IndexSet<String> {
    let mut collector = PredicateCollector { found: IndexSet::new() };
    let mut r = rule.clone();
    walk_rule(&mut collector, &mut r);
    collector.found
}

/// Predicates a rule depends on: everything mentioned in the body and in
/// the head's argument record, but not the head predicate itself.
pub fn rule_dependencies(rule: &Rule) -> IndexSet<String> {
    let mut collector = PredicateCollector { found: IndexSet::new() };
    let mut r = rule.clone();
    walk_record(&mut collector, &mut r.head.record);
    if let Some(body) = &mut r.body {
        for p in body {
            walk_proposition(&mut collector, p);
        }
    }
    collector.found
}

struct VariableReplacer<'a> {
    old: &'a str,
    new: &'a Expression,
}

impl Visitor for VariableReplacer<'_> {
    fn expression(&mut self, expr: &mut Expression) {
        if expr.as_variable() == Some(self.old) {
            *expr = self.new.clone();
        }
    }
}

/// Substitutes a variable by an expression, diving into combines: a
/// combine's free variables belong to the enclosing rule's scope.
pub fn replace_variable_in_expression(expr: &mut Expression, old: &str, new: &Expression) {
    let mut replacer = VariableReplacer { old, new };
    walk_expression(&mut replacer, expr);
}

pub fn replace_variable_in_rule(rule: &mut Rule, old: &str, new: &Expression) {
    let mut replacer = VariableReplacer { old, new };
    walk_rule(&mut replacer, rule);
}
