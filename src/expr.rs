//! Translation of Logica expressions into SQL.
//!
//! The translator resolves variables through a vocabulary (variable name →
//! SQL), defers combine expressions to a subquery translator, and renders
//! calls through the builtin function and operator tables with per-dialect
//! overrides.

use indexmap::IndexMap;

use crate::ast::{Call, ExprKind, Expression, Field, Implication, Literal, Rule, Value};
use crate::dialect::{Dialect, FunctionOverride};
use crate::error::{CompileError, Result};
use crate::source::Span;

/// Variable name → SQL expression holding its value.
pub type Vocabulary = IndexMap<String, String>;

/// The universe-side services expression translation needs: rendering
/// tables and correlated combine subqueries.
pub trait SubqueryTranslator {
    /// SQL for a table in a FROM clause: CTE name, ground table or
    /// external reference.
    fn translate_table(&self, predicate: &str, external_vocabulary: Option<&Vocabulary>)
        -> Result<String>;

    /// SQL of a combine rule correlated with the caller's vocabulary.
    fn translate_combine(&self, rule: &Rule, vocabulary: &Vocabulary) -> Result<String>;

    fn dialect(&self) -> &dyn Dialect;

    fn flag_values(&self) -> &IndexMap<String, String>;

    /// UDF name → SQL application template with `{arg}` placeholders.
    fn custom_udfs(&self) -> &IndexMap<String, String>;
}

/// Base function table, BigQuery-flavored: (template, min args, max args).
fn base_function(name: &str) -> Option<(&'static str, usize, usize)> {
    Some(match name {
        "ToFloat64" => ("CAST(%s AS FLOAT64)", 1, 1),
        "ToInt64" => ("CAST(%s AS INT64)", 1, 1),
        "ToString" => ("CAST(%s AS STRING)", 1, 1),
        "Agg+" => ("SUM(%s)", 1, 1),
        "Agg++" => ("ARRAY_CONCAT_AGG(%s)", 1, 1),
        "Sum" => ("SUM(%s)", 1, 1),
        "Avg" => ("AVG(%s)", 1, 1),
        "Max" => ("MAX(%s)", 1, 1),
        "Min" => ("MIN(%s)", 1, 1),
        "Count" => ("APPROX_COUNT_DISTINCT(%s)", 1, 1),
        "ExactCount" => ("COUNT(DISTINCT %s)", 1, 1),
        "List" => ("ARRAY_AGG(%s)", 1, 1),
        "Set" => ("ARRAY_AGG(DISTINCT %s)", 1, 1),
        "SomeValue" => ("ANY_VALUE(%s)", 1, 1),
        "StringAgg" => ("STRING_AGG(%s)", 1, 2),
        "Median" => ("APPROX_QUANTILES(%s, 2)[OFFSET(1)]", 1, 1),
        "!" => ("NOT %s", 1, 1),
        "-" => ("- %s", 1, 1),
        "IsNull" => ("(%s IS NULL)", 1, 1),
        "Like" => ("({0} LIKE {1})", 2, 2),
        "Constraint" => ("%s", 1, 1),
        "Container" => ("%s", 1, 1),
        "Element" => ("{0}[OFFSET({1})]", 2, 2),
        "Size" => ("ARRAY_LENGTH(%s)", 1, 1),
        "Range" => ("GENERATE_ARRAY(0, %s - 1)", 1, 1),
        "RangeOf" => ("GENERATE_ARRAY(0, ARRAY_LENGTH(%s) - 1)", 1, 1),
        "Sort" => ("ARRAY(SELECT x FROM UNNEST(%s) AS x ORDER BY x)", 1, 1),
        "Unique" => ("ARRAY(SELECT DISTINCT x FROM UNNEST(%s) AS x ORDER BY x)", 1, 1),
        "Join" | "ArrayToString" => ("ARRAY_TO_STRING({0}, {1})", 2, 2),
        "ArrayConcat" | "Concat" => ("ARRAY_CONCAT({0}, {1})", 2, 2),
        "RecordAsJson" => ("TO_JSON_STRING(%s)", 1, 1),
        "Abs" => ("ABS(%s)", 1, 1),
        "Least" => ("LEAST(%s)", 1, 16),
        "Greatest" => ("GREATEST(%s)", 1, 16),
        "Upper" => ("UPPER(%s)", 1, 1),
        "Lower" => ("LOWER(%s)", 1, 1),
        "Length" => ("LENGTH(%s)", 1, 1),
        "Substr" => ("SUBSTR(%s)", 2, 3),
        "Split" => ("SPLIT({0}, {1})", 2, 2),
        "Floor" => ("FLOOR(%s)", 1, 1),
        "Ceil" => ("CEIL(%s)", 1, 1),
        "Round" => ("ROUND(%s)", 1, 2),
        "Sqrt" => ("SQRT(%s)", 1, 1),
        "Exp" => ("EXP(%s)", 1, 1),
        "Log" => ("LN(%s)", 1, 1),
        "Mod" => ("MOD({0}, {1})", 2, 2),
        "If" => ("IF({0}, {1}, {2})", 3, 3),
        "ValueOfUnnested" => ("%s", 1, 1),
        "Fingerprint" => ("FARM_FINGERPRINT(%s)", 1, 1),
        _ => return None,
    })
}

fn base_infix(op: &str) -> Option<&'static str> {
    Some(match op {
        "==" | "=" => "%s = %s",
        "<=" => "%s <= %s",
        "<" => "%s < %s",
        ">=" => "%s >= %s",
        ">" => "%s > %s",
        "!=" => "%s != %s",
        "/" => "(%s) / (%s)",
        "+" => "(%s) + (%s)",
        "-" => "(%s) - (%s)",
        "*" => "(%s) * (%s)",
        "^" => "POW(%s, %s)",
        "++" => "CONCAT(%s, %s)",
        "in" => "%s IN UNNEST(%s)",
        "||" => "%s OR %s",
        "&&" => "%s AND %s",
        "%" => "MOD(%s, %s)",
        "is" => "%s IS %s",
        "is not" => "%s IS NOT %s",
        _ => return None,
    })
}

/// Functions handled outside the tables.
const SPECIAL_FUNCTIONS: &[&str] = &[
    "SqlExpr", "Cast", "FlagValue", "->", "ArgMax", "ArgMin", "~", "++?",
];

/// Whether a name resolves as a function rather than a predicate. Calls
/// that fail this test in expression position are value-inlined.
pub fn function_exists(name: &str, custom_udfs: &IndexMap<String, String>) -> bool {
    base_function(name).is_some()
        || base_infix(name).is_some()
        || SPECIAL_FUNCTIONS.contains(&name)
        || custom_udfs.contains_key(name)
}

/// Fills a template: `{i}` placeholders by position, or `%s` slots — a
/// single slot takes all arguments comma-joined, multiple slots take one
/// argument each.
fn fill(template: &str, args: &[String]) -> String {
    if template.contains('{') {
        let mut out = template.to_string();
        for (i, arg) in args.iter().enumerate() {
            out = out.replace(&format!("{{{i}}}"), arg);
        }
        return out;
    }
    let pieces: Vec<&str> = template.split("%s").collect();
    if pieces.len() == 2 {
        return format!("{}{}{}", pieces[0], args.join(", "), pieces[1]);
    }
    let mut out = String::new();
    for (i, piece) in pieces.iter().enumerate() {
        out.push_str(piece);
        if i + 1 < pieces.len() {
            out.push_str(args.get(i).map(String::as_str).unwrap_or(""));
        }
    }
    out
}

pub struct ExprTranslator<'a> {
    pub vocabulary: &'a Vocabulary,
    pub subquery: &'a dyn SubqueryTranslator,
    /// Rule text for error reporting.
    pub context: &'a Span,
}

impl<'a> ExprTranslator<'a> {
    pub fn new(
        vocabulary: &'a Vocabulary,
        subquery: &'a dyn SubqueryTranslator,
        context: &'a Span,
    ) -> ExprTranslator<'a> {
        ExprTranslator { vocabulary, subquery, context }
    }

    fn dialect(&self) -> &dyn Dialect {
        self.subquery.dialect()
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::rule(message, self.context.clone())
    }

    fn argument_expr<'e>(&self, call: &'e Call, index: usize) -> Result<&'e Expression> {
        call.record
            .field_values
            .get(index)
            .and_then(|fv| fv.value.as_expr())
            .ok_or_else(|| {
                self.error(format!(
                    "Function {} is missing argument {index}.",
                    call.predicate_name
                ))
            })
    }

    fn positional_args(&self, call: &Call) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for fv in &call.record.field_values {
            let expr = fv.value.as_expr().ok_or_else(|| {
                self.error("Aggregation is only allowed in rule heads and combine expressions.")
            })?;
            args.push(self.convert(expr)?);
        }
        Ok(args)
    }

    fn named_arg(&self, call: &Call, name: &str) -> Result<String> {
        let fv = call
            .record
            .field(&Field::Named(name.to_string()))
            .ok_or_else(|| {
                self.error(format!(
                    "Operator {} is missing its {name} operand.",
                    call.predicate_name
                ))
            })?;
        let expr = fv
            .value
            .as_expr()
            .ok_or_else(|| self.error("Unexpected aggregation in operand."))?;
        self.convert(expr)
    }

    fn is_infix_shape(call: &Call) -> bool {
        call.record.field_values.len() == 2
            && call.record.field(&Field::Named("left".to_string())).is_some()
            && call.record.field(&Field::Named("right".to_string())).is_some()
    }

    /// Resolves the SQL template of a builtin function under the dialect.
    fn function_template(&self, name: &str) -> Result<Option<(&'static str, usize, usize)>> {
        let base = base_function(name);
        match self.dialect().builtin_function(name) {
            FunctionOverride::Default => Ok(base),
            FunctionOverride::Sql(template) => {
                let (_, min_args, max_args) = base.unwrap_or((template, 1, 3));
                Ok(Some((template, min_args, max_args)))
            }
            FunctionOverride::Unsupported => Err(CompileError::Dialect(format!(
                "Function {name} is not supported by the {} dialect.",
                self.dialect().name()
            ))),
        }
    }

    pub fn convert(&self, expression: &Expression) -> Result<String> {
        match &expression.kind {
            ExprKind::Variable(name) => match self.vocabulary.get(name) {
                Some(sql) => Ok(sql.clone()),
                None => Err(self.error(format!(
                    "Found no way to assign variables: {name}. This error might also come \
                     from injected sub-rules."
                ))),
            },
            ExprKind::Literal(literal) => self.convert_literal(literal),
            ExprKind::Call(call) => self.convert_call(call),
            ExprKind::Subscript { record, field } => self.convert_subscript(record, field),
            ExprKind::Record(record) => {
                let mut fields = Vec::new();
                for fv in &record.field_values {
                    let expr = fv.value.as_expr().ok_or_else(|| {
                        self.error("Unexpected aggregation in a record literal.")
                    })?;
                    fields.push((fv.field.sql_name(), self.convert(expr)?));
                }
                Ok(self.dialect().record_phrase(&fields))
            }
            ExprKind::Combine(rule) => Ok(format!(
                "({})",
                self.subquery.translate_combine(rule, self.vocabulary)?
            )),
            ExprKind::Implication(implication) => self.convert_implication(implication),
        }
    }

    fn convert_literal(&self, literal: &Literal) -> Result<String> {
        match literal {
            Literal::Number(n) => Ok(n.clone()),
            Literal::Str(s) => Ok(self.dialect().string_literal(s)),
            Literal::Bool(b) => Ok(self.dialect().bool_literal(*b).to_string()),
            Literal::Null => Ok("NULL".to_string()),
            Literal::List(elements) => {
                let inner = elements
                    .iter()
                    .map(|e| self.convert(e))
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                Ok(self.dialect().array_phrase(&inner))
            }
            Literal::Predicate(name) => {
                let fields =
                    vec![("predicate_name".to_string(), self.dialect().string_literal(name))];
                Ok(self.dialect().record_phrase(&fields))
            }
        }
    }

    fn convert_call(&self, call: &Call) -> Result<String> {
        let name = call.predicate_name.as_str();
        match name {
            "SqlExpr" => return self.convert_sql_expr(call),
            "Cast" => {
                let value = self.convert(self.argument_expr(call, 0)?)?;
                let target = self.argument_expr(call, 1)?;
                let target = match &target.kind {
                    ExprKind::Literal(Literal::Str(s)) => s,
                    _ => {
                        return Err(self.error(
                            "Cast must have 2 arguments and the second argument must be a \
                             string literal.",
                        ))
                    }
                };
                return Ok(format!("CAST({value} AS {target})"));
            }
            "FlagValue" => {
                let flag = self.argument_expr(call, 0)?;
                let flag = match &flag.kind {
                    ExprKind::Literal(Literal::Str(s)) => s,
                    _ => return Err(self.error("FlagValue argument must be a string literal.")),
                };
                let value = self
                    .subquery
                    .flag_values()
                    .get(flag)
                    .ok_or_else(|| self.error(format!("Unspecified flag: {flag}")))?;
                return Ok(self.dialect().string_literal(value));
            }
            "->" => {
                let left = self.named_arg(call, "left")?;
                let right = self.named_arg(call, "right")?;
                let fields =
                    vec![("arg".to_string(), left), ("value".to_string(), right)];
                return Ok(self.dialect().record_phrase(&fields));
            }
            "ArgMax" | "ArgMin" => {
                let pair = self.argument_expr(call, 0)?;
                let pair_call = match &pair.kind {
                    ExprKind::Call(c) if c.predicate_name == "->" => c,
                    _ => {
                        return Err(self.error(format!(
                            "{name} aggregates pairs: write {name}= x -> value."
                        )))
                    }
                };
                let argument = self.named_arg(pair_call, "left")?;
                let value = self.named_arg(pair_call, "right")?;
                return self.dialect().arg_extreme(&argument, &value, name == "ArgMax");
            }
            _ => {}
        }
        // Builtin functions by positional arguments. Binary `-` falls
        // through to the operator table.
        if !(name == "-" && Self::is_infix_shape(call)) {
            if let Some((template, min_args, max_args)) = self.function_template(name)? {
                let args = self.positional_args(call)?;
                if args.len() < min_args || args.len() > max_args {
                    return Err(self.error(format!(
                        "Built-in function {name} takes {min_args}..{max_args} arguments, \
                         but {} arguments were given.",
                        args.len()
                    )));
                }
                return Ok(fill(template, &args));
            }
        }
        if let Some(template) = self.subquery.custom_udfs().get(name) {
            return self.apply_udf(name, template, call);
        }
        let infix = self
            .dialect()
            .infix_operator(name)
            .or_else(|| base_infix(name));
        if let Some(template) = infix {
            let left = self.named_arg(call, "left")?;
            let right = self.named_arg(call, "right")?;
            return Ok(format!("({})", fill(template, &[left, right])));
        }
        Err(self.error(format!(
            "Unsupported supposedly built-in function: {name}."
        )))
    }

    fn apply_udf(&self, name: &str, template: &str, call: &Call) -> Result<String> {
        let mut result = template.to_string();
        for fv in &call.record.field_values {
            let expr = fv.value.as_expr().ok_or_else(|| {
                self.error(format!("Unexpected aggregation in a call to function {name}."))
            })?;
            let placeholder = format!("{{{}}}", fv.field.sql_name());
            result = result.replace(&placeholder, &self.convert(expr)?);
        }
        if let Some(unfilled) = argument_placeholder(&result) {
            return Err(self.error(format!(
                "Function {name} call is inconsistent with its signature {template}: \
                 argument {unfilled} was not provided."
            )));
        }
        Ok(result)
    }

    fn convert_sql_expr(&self, call: &Call) -> Result<String> {
        let template = self.argument_expr(call, 0)?;
        let template = match &template.kind {
            ExprKind::Literal(Literal::Str(s)) => s.clone(),
            _ => return Err(self.error("SqlExpr must have first argument be string.")),
        };
        let args = self.argument_expr(call, 1)?;
        let args = match &args.kind {
            ExprKind::Record(record) => record,
            _ => return Err(self.error("Second argument of SqlExpr must be record literal.")),
        };
        let mut result = template;
        for fv in &args.field_values {
            let expr = fv
                .value
                .as_expr()
                .ok_or_else(|| self.error("Unexpected aggregation in SqlExpr arguments."))?;
            result = result.replace(
                &format!("{{{}}}", fv.field.sql_name()),
                &self.convert(expr)?,
            );
        }
        Ok(result)
    }

    fn convert_subscript(&self, record: &Expression, field: &str) -> Result<String> {
        // Subscript of a record literal projects the field directly.
        if let ExprKind::Record(r) = &record.kind {
            for fv in &r.field_values {
                if fv.field.sql_name() == field {
                    if let Some(expr) = fv.value.as_expr() {
                        return self.convert(expr);
                    }
                }
            }
        }
        // Subscript of an implication whose branches are all records
        // pushes the subscript into the branches.
        if let ExprKind::Implication(implication) = &record.kind {
            if let Some(sql) = self.subscript_of_implication(implication, field)? {
                return Ok(sql);
            }
        }
        let record_sql = self.convert(record)?;
        Ok(self.dialect().subscript(&record_sql, field))
    }

    fn subscript_of_implication(
        &self,
        implication: &Implication,
        field: &str,
    ) -> Result<Option<String>> {
        fn field_of<'e>(expr: &'e Expression, field: &str) -> Option<&'e Expression> {
            match &expr.kind {
                ExprKind::Record(record) => record
                    .field_values
                    .iter()
                    .find(|fv| fv.field.sql_name() == field)
                    .and_then(|fv| fv.value.as_expr()),
                _ => None,
            }
        }
        let all_records = implication
            .if_thens
            .iter()
            .all(|it| matches!(it.consequence.kind, ExprKind::Record(_)))
            && matches!(implication.otherwise.kind, ExprKind::Record(_));
        if !all_records {
            return Ok(None);
        }
        let mut when_thens = Vec::new();
        for if_then in &implication.if_thens {
            let consequence = field_of(&if_then.consequence, field).ok_or_else(|| {
                self.error(format!(
                    "Expected field {field} missing in a record inside if statement."
                ))
            })?;
            when_thens.push(format!(
                "WHEN {} THEN {}",
                self.convert(&if_then.condition)?,
                self.convert(consequence)?
            ));
        }
        let otherwise = field_of(&implication.otherwise, field).ok_or_else(|| {
            self.error(format!(
                "Expected field {field} missing in a record inside if statement."
            ))
        })?;
        Ok(Some(format!(
            "CASE {} ELSE {} END",
            when_thens.join(" "),
            self.convert(otherwise)?
        )))
    }

    fn convert_implication(&self, implication: &Implication) -> Result<String> {
        let mut when_thens = Vec::new();
        for if_then in &implication.if_thens {
            when_thens.push(format!(
                "WHEN {} THEN {}",
                self.convert(&if_then.condition)?,
                self.convert(&if_then.consequence)?
            ));
        }
        Ok(format!(
            "CASE {} ELSE {} END",
            when_thens.join(" "),
            self.convert(&implication.otherwise)?
        ))
    }
}

/// Aggregated head values must be aggregate calls; returns the call name.
pub fn value_as_aggregation(value: &Value) -> Option<&Expression> {
    match value {
        Value::AggregatedExpr(e) => Some(e),
        _ => None,
    }
}

/// An unfilled `{argument}` placeholder in rendered SQL, if any. Brace
/// constructs of SQL itself (e.g. struct literals) never match: only
/// lowercase identifier contents count.
fn argument_placeholder(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut j = i + 1;
            while j < bytes.len()
                && (bytes[j].is_ascii_lowercase() || bytes[j].is_ascii_digit() || bytes[j] == b'_')
            {
                j += 1;
            }
            if j > i + 1 && bytes.get(j) == Some(&b'}') {
                return Some(s[i + 1..j].to_string());
            }
        }
        i += 1;
    }
    None
}
