//! Extraction and retrieval of predicate annotations.
//!
//! Annotation rules have `@`-heads whose arguments must evaluate to
//! literal values. The set of recognized annotations is closed.

use indexmap::IndexMap;

use crate::ast::{ExprKind, Expression, Field, Literal, Rule, Value};
use crate::error::{CompileError, Result};

pub const ANNOTATING_PREDICATES: &[&str] = &[
    "@Engine",
    "@Ground",
    "@With",
    "@OrderBy",
    "@Limit",
    "@NoInject",
    "@Recursive",
    "@Make",
    "@DefineFlag",
    "@CompileAsUdf",
    "@CouldBe",
    "@CantBe",
    "@ShouldBe",
];

/// Annotations whose subject must be an existing predicate.
const MUST_ANNOTATE_EXISTING: &[&str] = &[
    "@With",
    "@OrderBy",
    "@Limit",
    "@NoInject",
    "@Recursive",
    "@CompileAsUdf",
];

const DEFAULT_RECURSION_DEPTH: usize = 8;

/// A literal value of an annotation argument.
#[derive(Clone, Debug, PartialEq)]
pub enum AnnotationValue {
    Str(String),
    Number(String),
    Bool(bool),
    Null,
    Predicate(String),
    List(Vec<AnnotationValue>),
    Record(IndexMap<String, AnnotationValue>),
}

impl AnnotationValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnnotationValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_predicate(&self) -> Option<&str> {
        match self {
            AnnotationValue::Predicate(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&str> {
        match self {
            AnnotationValue::Number(n) => Some(n),
            _ => None,
        }
    }
}

fn evaluate(expr: &Expression, rule_text: &str) -> Result<AnnotationValue> {
    match &expr.kind {
        ExprKind::Literal(Literal::Str(s)) => Ok(AnnotationValue::Str(s.clone())),
        ExprKind::Literal(Literal::Number(n)) => Ok(AnnotationValue::Number(n.clone())),
        ExprKind::Literal(Literal::Bool(b)) => Ok(AnnotationValue::Bool(*b)),
        ExprKind::Literal(Literal::Null) => Ok(AnnotationValue::Null),
        ExprKind::Literal(Literal::Predicate(p)) => Ok(AnnotationValue::Predicate(p.clone())),
        ExprKind::Literal(Literal::List(elements)) => Ok(AnnotationValue::List(
            elements
                .iter()
                .map(|e| evaluate(e, rule_text))
                .collect::<Result<Vec<_>>>()?,
        )),
        ExprKind::Record(record) => {
            let mut values = IndexMap::new();
            for fv in &record.field_values {
                let value = match &fv.value {
                    Value::Expr(e) => evaluate(e, rule_text)?,
                    _ => {
                        return Err(CompileError::rule(
                            "Can not understand annotation.",
                            rule_text,
                        ))
                    }
                };
                values.insert(annotation_key(&fv.field), value);
            }
            Ok(AnnotationValue::Record(values))
        }
        ExprKind::Variable(name) => Err(CompileError::rule(
            format!(
                "Annotation may not use variables, but this one uses variable {name}."
            ),
            rule_text,
        )),
        _ => Err(CompileError::rule(
            "Could not understand arguments of annotation.",
            rule_text,
        )),
    }
}

fn annotation_key(field: &Field) -> String {
    match field {
        Field::Positional(i) => i.to_string(),
        Field::Named(name) => name.clone(),
        Field::Splat => "*".to_string(),
    }
}

/// Arguments of one annotation application, keyed by position ("1", "2",
/// ...) or name; the subject (position 0) is extracted separately.
#[derive(Clone, Debug)]
pub struct AnnotationArgs {
    pub values: IndexMap<String, AnnotationValue>,
    pub rule_text: String,
}

impl AnnotationArgs {
    /// Positional arguments in order, or `None` if any are named.
    pub fn as_list(&self) -> Option<Vec<&AnnotationValue>> {
        let mut result = Vec::new();
        for i in 0..self.values.len() {
            result.push(self.values.get(&(i + 1).to_string())?);
        }
        Some(result)
    }

    pub fn get(&self, key: &str) -> Option<&AnnotationValue> {
        self.values.get(key)
    }
}

/// A `@Ground` target.
#[derive(Clone, Debug)]
pub struct Ground {
    pub table_name: String,
    pub overwrite: bool,
}

#[derive(Clone, Debug)]
pub struct Annotations {
    /// [annotation name][subject] -> args. Order preserved throughout: the
    /// functor expansion order depends on it.
    annotations: IndexMap<String, IndexMap<String, AnnotationArgs>>,
    pub flag_values: IndexMap<String, String>,
}

impl Annotations {
    pub fn new(rules: &[Rule], user_flags: &IndexMap<String, String>) -> Result<Annotations> {
        let annotations = Self::extract(rules)?;
        let mut result = Annotations { annotations, flag_values: IndexMap::new() };
        result.flag_values = result.build_flag_values(user_flags)?;
        result.check_annotated_objects(rules)?;
        Ok(result)
    }

    fn extract(rules: &[Rule]) -> Result<IndexMap<String, IndexMap<String, AnnotationArgs>>> {
        let mut result: IndexMap<String, IndexMap<String, AnnotationArgs>> = IndexMap::new();
        for name in ANNOTATING_PREDICATES {
            result.insert(name.to_string(), IndexMap::new());
        }
        for rule in rules {
            let predicate = rule.predicate_name();
            if !predicate.starts_with('@') {
                continue;
            }
            if !ANNOTATING_PREDICATES.contains(&predicate) {
                return Err(CompileError::rule(
                    format!(
                        "Only {} special predicates are allowed.",
                        ANNOTATING_PREDICATES.join(", ")
                    ),
                    rule.full_text.clone(),
                ));
            }
            let rule_text = rule.full_text.to_string();
            let mut values = IndexMap::new();
            for fv in &rule.head.record.field_values {
                let value = match &fv.value {
                    Value::Expr(e) => evaluate(e, &rule_text)?,
                    _ => {
                        return Err(CompileError::rule(
                            "Can not understand annotation.",
                            &rule_text,
                        ))
                    }
                };
                values.insert(annotation_key(&fv.field), value);
            }
            let subject = match values.shift_remove("0") {
                Some(AnnotationValue::Predicate(p)) => p,
                Some(AnnotationValue::Str(s)) => s,
                Some(AnnotationValue::Number(n)) => n,
                _ => {
                    return Err(CompileError::rule(
                        "Can not understand annotation.",
                        &rule_text,
                    ))
                }
            };
            let args = AnnotationArgs { values, rule_text: rule_text.clone() };
            if ["@OrderBy", "@Limit", "@NoInject"].contains(&predicate) {
                if args.as_list().is_none() {
                    return Err(CompileError::rule(
                        "@OrderBy and @Limit may only have positional arguments.",
                        &rule_text,
                    ));
                }
                if predicate == "@Limit" && args.values.len() != 1 {
                    return Err(CompileError::rule(
                        "Annotation @Limit must have exactly two arguments: predicate and \
                         limit.",
                        &rule_text,
                    ));
                }
            }
            let per_subject = result.get_mut(predicate).expect("pre-seeded");
            if let Some(existing) = per_subject.get(&subject) {
                return Err(CompileError::rule(
                    format!(
                        "{predicate} annotates {subject} more than once: {}, {}",
                        existing.rule_text, rule_text
                    ),
                    &rule_text,
                ));
            }
            per_subject.insert(subject, args);
        }
        Ok(result)
    }

    fn check_annotated_objects(&self, rules: &[Rule]) -> Result<()> {
        let mut all_predicates: indexmap::IndexSet<String> =
            rules.iter().map(|r| r.predicate_name().to_string()).collect();
        all_predicates.extend(self.annotations["@Ground"].keys().cloned());
        all_predicates.extend(self.annotations["@Make"].keys().cloned());
        for annotation_name in MUST_ANNOTATE_EXISTING {
            for (subject, args) in &self.annotations[*annotation_name] {
                if !all_predicates.contains(subject) {
                    return Err(CompileError::rule(
                        format!(
                            "Annotation {annotation_name} must be applied to an existing \
                             predicate, but it was applied to a non-existing predicate \
                             {subject}."
                        ),
                        &args.rule_text,
                    ));
                }
            }
        }
        Ok(())
    }

    fn build_flag_values(
        &self,
        user_flags: &IndexMap<String, String>,
    ) -> Result<IndexMap<String, String>> {
        let mut values = IndexMap::new();
        for (flag, args) in &self.annotations["@DefineFlag"] {
            let default = match args.get("1") {
                Some(AnnotationValue::Str(s)) => s.clone(),
                Some(AnnotationValue::Number(n)) => n.clone(),
                None => format!("${{{flag}}}"),
                _ => {
                    return Err(CompileError::rule(
                        "Flag default must be a string or a number.",
                        &args.rule_text,
                    ))
                }
            };
            values.insert(flag.clone(), default);
        }
        for (flag, value) in user_flags {
            if !values.contains_key(flag) {
                return Err(CompileError::rule(
                    format!("Undefined flags used: {flag}"),
                    flag,
                ));
            }
            values.insert(flag.clone(), value.clone());
        }
        Ok(values)
    }

    fn singleton(&self, annotation_name: &str, default_value: &str) -> Result<String> {
        let subjects = &self.annotations[annotation_name];
        match subjects.len() {
            0 => Ok(default_value.to_string()),
            1 => Ok(subjects.keys().next().unwrap().clone()),
            _ => Err(CompileError::rule(
                format!(
                    "Single {annotation_name} must be provided. Provided: {}",
                    subjects.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
                subjects.values().next().unwrap().rule_text.clone(),
            )),
        }
    }

    pub fn engine(&self) -> Result<String> {
        self.singleton("@Engine", "bigquery")
    }

    pub fn limit_of(&self, predicate_name: &str) -> Result<Option<String>> {
        let args = match self.annotations["@Limit"].get(predicate_name) {
            Some(a) => a,
            None => return Ok(None),
        };
        let list = args.as_list().expect("checked at extraction");
        match list.as_slice() {
            [value] => match value.as_number() {
                Some(n) => Ok(Some(n.to_string())),
                None => Err(CompileError::rule(
                    format!("Bad limit specification for predicate {predicate_name}."),
                    format!("Predicate: {predicate_name}"),
                )),
            },
            _ => Err(CompileError::rule(
                format!("Bad limit specification for predicate {predicate_name}."),
                format!("Predicate: {predicate_name}"),
            )),
        }
    }

    pub fn order_by_of(&self, predicate_name: &str) -> Result<Option<Vec<String>>> {
        let args = match self.annotations["@OrderBy"].get(predicate_name) {
            Some(a) => a,
            None => return Ok(None),
        };
        let list = args.as_list().expect("checked at extraction");
        let mut result = Vec::new();
        for value in list {
            match value {
                AnnotationValue::Str(s) => result.push(s.clone()),
                _ => {
                    return Err(CompileError::rule(
                        format!("Bad @OrderBy specification for predicate {predicate_name}."),
                        &args.rule_text,
                    ))
                }
            }
        }
        Ok(Some(result))
    }

    /// Renders ` ORDER BY ...` for the predicate, empty if unannotated.
    pub fn order_by_clause(&self, predicate_name: &str) -> Result<String> {
        let order_by = match self.order_by_of(predicate_name)? {
            Some(o) if !o.is_empty() => o,
            _ => return Ok(String::new()),
        };
        let mut pieces = Vec::new();
        for i in 0..order_by.len() {
            let last = i + 1 == order_by.len();
            let next_is_desc = !last && order_by[i + 1] == "DESC";
            if last || next_is_desc {
                pieces.push(order_by[i].clone());
            } else {
                pieces.push(format!("{},", order_by[i]));
            }
        }
        Ok(format!(" ORDER BY {}", pieces.join(" ")))
    }

    /// Renders ` LIMIT n` for the predicate, empty if unannotated.
    pub fn limit_clause(&self, predicate_name: &str) -> Result<String> {
        Ok(match self.limit_of(predicate_name)? {
            Some(limit) => format!(" LIMIT {limit}"),
            None => String::new(),
        })
    }

    pub fn ground(&self, predicate_name: &str) -> Option<Ground> {
        let args = self.annotations["@Ground"].get(predicate_name)?;
        let table_name = match args.get("1") {
            Some(AnnotationValue::Str(s)) => s.clone(),
            _ => format!("logica_test.{predicate_name}"),
        };
        let overwrite = !matches!(args.get("overwrite"), Some(AnnotationValue::Bool(false)));
        Some(Ground { table_name, overwrite })
    }

    pub fn no_inject(&self, predicate_name: &str) -> bool {
        self.annotations["@NoInject"].contains_key(predicate_name)
    }

    pub fn force_with(&self, predicate_name: &str) -> bool {
        self.annotations["@With"].contains_key(predicate_name)
    }

    pub fn compile_as_udf(&self, predicate_name: &str) -> bool {
        self.annotations["@CompileAsUdf"].contains_key(predicate_name)
    }

    pub fn udf_predicates(&self) -> Vec<String> {
        self.annotations["@CompileAsUdf"].keys().cloned().collect()
    }

    /// The unroll depth for a predicate annotated `@Recursive`.
    pub fn recursive_depth(&self, predicate_name: &str) -> Option<usize> {
        let args = self.annotations["@Recursive"].get(predicate_name)?;
        match args.get("1") {
            Some(AnnotationValue::Number(n)) => n.parse().ok(),
            None => Some(DEFAULT_RECURSION_DEPTH),
            _ => Some(DEFAULT_RECURSION_DEPTH),
        }
    }

    /// Whether the current annotations leave the predicate injectable.
    pub fn ok_injection(&self, predicate_name: &str) -> Result<bool> {
        Ok(!(self.order_by_of(predicate_name)?.is_some()
            || self.limit_of(predicate_name)?.is_some()
            || self.ground(predicate_name).is_some()
            || self.no_inject(predicate_name)
            || self.force_with(predicate_name)))
    }

    /// The `@Make` instructions in program order.
    pub fn make_instructions(&self) -> &IndexMap<String, AnnotationArgs> {
        &self.annotations["@Make"]
    }

    /// The first solver-only denotation in the program, if any. The SQL
    /// universe rejects these.
    pub fn solver_only_annotation(&self) -> Option<(String, String)> {
        for name in ["@CouldBe", "@CantBe", "@ShouldBe"] {
            if let Some((subject, _)) = self.annotations[name].first() {
                return Some((name.to_string(), subject.clone()));
            }
        }
        None
    }
}
