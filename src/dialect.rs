//! SQL dialects of the supported engines.
//!
//! A dialect is a small strategy object parameterizing identifier quoting,
//! literal syntax, array/record construction, unnesting, group-by
//! spelling, arg-extremum aggregation and per-engine builtin overrides.
//! An override of `Unsupported` makes use of the function a fatal dialect
//! error rather than a silent miscompile.

use crate::error::{CompileError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionOverride {
    /// Use the base (BigQuery-flavored) emission.
    Default,
    /// Engine-specific SQL template.
    Sql(&'static str),
    /// The engine cannot express this function.
    Unsupported,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupBySpec {
    /// GROUP BY output column names.
    Name,
    /// GROUP BY 1-based select indices.
    Index,
    /// GROUP BY the full select expressions.
    Expr,
}

pub trait Dialect: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Per-engine overrides of the base builtin function table.
    fn builtin_function(&self, _name: &str) -> FunctionOverride {
        FunctionOverride::Default
    }

    /// Per-engine overrides of the base infix operator table.
    fn infix_operator(&self, _op: &str) -> Option<&'static str> {
        None
    }

    fn subscript(&self, record: &str, field: &str) -> String;

    fn unnest_phrase(&self, list: &str, var: &str) -> String;

    fn array_phrase(&self, elements: &str) -> String;

    fn record_phrase(&self, fields: &[(String, String)]) -> String;

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "true"
        } else {
            "false"
        }
    }

    fn string_literal(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    fn group_by_spec(&self) -> GroupBySpec {
        GroupBySpec::Name
    }

    /// The value of `argument` on the row where `value` is extreme.
    fn arg_extreme(&self, argument: &str, value: &str, maximal: bool) -> Result<String>;

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{name}\"")
    }
}

#[derive(Debug)]
pub struct BigQueryDialect;

impl Dialect for BigQueryDialect {
    fn name(&self) -> &'static str {
        "BigQuery"
    }

    fn infix_operator(&self, op: &str) -> Option<&'static str> {
        match op {
            "++" => Some("CONCAT(%s, %s)"),
            _ => None,
        }
    }

    fn subscript(&self, record: &str, field: &str) -> String {
        format!("{record}.{field}")
    }

    fn unnest_phrase(&self, list: &str, var: &str) -> String {
        format!("UNNEST({list}) AS {var}")
    }

    fn array_phrase(&self, elements: &str) -> String {
        format!("ARRAY[{elements}]")
    }

    fn record_phrase(&self, fields: &[(String, String)]) -> String {
        let arguments = fields
            .iter()
            .map(|(field, value)| format!("{value} AS {field}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("STRUCT({arguments})")
    }

    fn string_literal(&self, s: &str) -> String {
        serde_json::to_string(s).expect("string serialization is infallible")
    }

    fn arg_extreme(&self, argument: &str, value: &str, maximal: bool) -> Result<String> {
        let direction = if maximal { "DESC" } else { "ASC" };
        Ok(format!(
            "ARRAY_AGG({argument} ORDER BY {value} {direction} LIMIT 1)[OFFSET(0)]"
        ))
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{name}`")
    }
}

#[derive(Debug)]
pub struct SqLiteDialect;

impl Dialect for SqLiteDialect {
    fn name(&self) -> &'static str {
        "SqLite"
    }

    fn builtin_function(&self, name: &str) -> FunctionOverride {
        use FunctionOverride::{Sql, Unsupported};
        match name {
            "ToString" => Sql("CAST(%s AS TEXT)"),
            "ToInt64" => Sql("CAST(%s AS INTEGER)"),
            "ToFloat64" => Sql("CAST(%s AS REAL)"),
            "Count" => Sql("COUNT(DISTINCT {0})"),
            "List" => Sql("JSON_GROUP_ARRAY({0})"),
            "Element" => Sql("JSON_EXTRACT({0}, '$[' || {1} || ']')"),
            "Size" => Sql("JSON_ARRAY_LENGTH({0})"),
            "Range" => Sql(
                "(SELECT JSON_GROUP_ARRAY(n) FROM (WITH RECURSIVE t AS (SELECT 0 AS n UNION \
                 ALL SELECT n + 1 AS n FROM t WHERE n + 1 < {0}) SELECT n FROM t) WHERE n < \
                 {0})",
            ),
            "ValueOfUnnested" => Sql("{0}.value"),
            "StringAgg" => Sql("GROUP_CONCAT(%s)"),
            "SomeValue" => Sql("MIN(%s)"),
            "Least" => Sql("MIN(%s)"),
            "Greatest" => Sql("MAX(%s)"),
            "If" => Sql("IIF({0}, {1}, {2})"),
            "RecordAsJson" => Sql("%s"),
            "Set" | "Agg++" | "Median" | "Sort" | "Unique" | "Join" | "ArrayToString"
            | "ArrayConcat" | "Concat" | "Split" | "RangeOf" | "Fingerprint" => Unsupported,
            _ => FunctionOverride::Default,
        }
    }

    fn infix_operator(&self, op: &str) -> Option<&'static str> {
        match op {
            "++" => Some("(%s) || (%s)"),
            "%" => Some("(%s) % (%s)"),
            "in" => Some("%s IN (SELECT value FROM JSON_EACH(%s))"),
            _ => None,
        }
    }

    fn subscript(&self, record: &str, field: &str) -> String {
        format!("JSON_EXTRACT({record}, '$.{field}')")
    }

    fn unnest_phrase(&self, list: &str, var: &str) -> String {
        format!("JSON_EACH({list}) AS {var}")
    }

    fn array_phrase(&self, elements: &str) -> String {
        format!("JSON_ARRAY({elements})")
    }

    fn record_phrase(&self, fields: &[(String, String)]) -> String {
        let arguments = fields
            .iter()
            .map(|(field, value)| format!("'{field}', {value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("JSON_OBJECT({arguments})")
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn group_by_spec(&self) -> GroupBySpec {
        GroupBySpec::Expr
    }

    fn arg_extreme(&self, _argument: &str, _value: &str, maximal: bool) -> Result<String> {
        let name = if maximal { "ArgMax" } else { "ArgMin" };
        Err(CompileError::Dialect(format!(
            "{name} aggregation is not supported by the SqLite dialect."
        )))
    }
}

#[derive(Debug)]
pub struct PostgreSqlDialect;

impl Dialect for PostgreSqlDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn builtin_function(&self, name: &str) -> FunctionOverride {
        use FunctionOverride::{Sql, Unsupported};
        match name {
            "ToString" => Sql("CAST(%s AS TEXT)"),
            "ToInt64" => Sql("CAST(%s AS BIGINT)"),
            "ToFloat64" => Sql("CAST(%s AS DOUBLE PRECISION)"),
            "Count" => Sql("COUNT(DISTINCT {0})"),
            "List" => Sql("ARRAY_AGG(%s)"),
            "Set" => Sql("ARRAY_AGG(DISTINCT %s)"),
            "Element" => Sql("({0})[{1} + 1]"),
            "Size" => Sql("ARRAY_LENGTH(%s, 1)"),
            "Range" => Sql("(SELECT ARRAY_AGG(x) FROM GENERATE_SERIES(0, {0} - 1) AS x)"),
            "RangeOf" => {
                Sql("(SELECT ARRAY_AGG(x) FROM GENERATE_SERIES(0, ARRAY_LENGTH({0}, 1) - 1) AS x)")
            }
            "Join" | "ArrayToString" => Sql("ARRAY_TO_STRING({0}, {1})"),
            "Split" => Sql("STRING_TO_ARRAY({0}, {1})"),
            "Median" => Sql("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY {0})"),
            "SomeValue" => Sql("MIN(%s)"),
            "If" => Sql("CASE WHEN {0} THEN {1} ELSE {2} END"),
            "Sort" => Sql("(SELECT ARRAY_AGG(x ORDER BY x) FROM UNNEST({0}) AS x)"),
            "Unique" => Sql("(SELECT ARRAY_AGG(DISTINCT x ORDER BY x) FROM UNNEST({0}) AS x)"),
            "RecordAsJson" => Sql("%s"),
            "Agg++" | "Fingerprint" => Unsupported,
            _ => FunctionOverride::Default,
        }
    }

    fn infix_operator(&self, op: &str) -> Option<&'static str> {
        match op {
            "++" => Some("CONCAT(%s, %s)"),
            "in" => Some("%s = ANY(%s)"),
            _ => None,
        }
    }

    fn subscript(&self, record: &str, field: &str) -> String {
        format!("({record} -> '{field}')")
    }

    fn unnest_phrase(&self, list: &str, var: &str) -> String {
        format!("UNNEST({list}) AS {var}")
    }

    fn array_phrase(&self, elements: &str) -> String {
        format!("ARRAY[{elements}]")
    }

    fn record_phrase(&self, fields: &[(String, String)]) -> String {
        let arguments = fields
            .iter()
            .map(|(field, value)| format!("'{field}', {value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("JSONB_BUILD_OBJECT({arguments})")
    }

    fn arg_extreme(&self, argument: &str, value: &str, maximal: bool) -> Result<String> {
        let direction = if maximal { "DESC" } else { "ASC" };
        Ok(format!(
            "(ARRAY_AGG({argument} ORDER BY {value} {direction}))[1]"
        ))
    }
}

#[derive(Debug)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "DuckDB"
    }

    fn builtin_function(&self, name: &str) -> FunctionOverride {
        use FunctionOverride::Sql;
        match name {
            "ToString" => Sql("CAST(%s AS VARCHAR)"),
            "ToInt64" => Sql("CAST(%s AS BIGINT)"),
            "ToFloat64" => Sql("CAST(%s AS DOUBLE)"),
            "Count" => Sql("COUNT(DISTINCT {0})"),
            "List" => Sql("LIST({0})"),
            "Set" => Sql("LIST(DISTINCT {0})"),
            "Agg++" => Sql("FLATTEN(LIST({0}))"),
            "Element" => Sql("{0}[{1} + 1]"),
            "Size" => Sql("ARRAY_LENGTH({0})"),
            "Range" => Sql("RANGE({0})"),
            "RangeOf" => Sql("RANGE(ARRAY_LENGTH({0}))"),
            "Join" | "ArrayToString" => Sql("ARRAY_TO_STRING({0}, {1})"),
            "Split" => Sql("STRING_SPLIT({0}, {1})"),
            "Median" => Sql("MEDIAN({0})"),
            "SomeValue" => Sql("ANY_VALUE({0})"),
            "Sort" => Sql("LIST_SORT({0})"),
            "Unique" => Sql("LIST_SORT(LIST_DISTINCT({0}))"),
            "RecordAsJson" => Sql("TO_JSON({0})"),
            _ => FunctionOverride::Default,
        }
    }

    fn infix_operator(&self, op: &str) -> Option<&'static str> {
        match op {
            "++" => Some("({0} || {1})"),
            "in" => Some("LIST_CONTAINS({1}, {0})"),
            _ => None,
        }
    }

    fn subscript(&self, record: &str, field: &str) -> String {
        format!("{record}.{field}")
    }

    fn unnest_phrase(&self, list: &str, var: &str) -> String {
        format!("UNNEST({list}) AS t_{var}({var})")
    }

    fn array_phrase(&self, elements: &str) -> String {
        format!("[{elements}]")
    }

    fn record_phrase(&self, fields: &[(String, String)]) -> String {
        let arguments = fields
            .iter()
            .map(|(field, value)| format!("'{field}': {value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{arguments}}}")
    }

    fn arg_extreme(&self, argument: &str, value: &str, maximal: bool) -> Result<String> {
        let function = if maximal { "ARG_MAX" } else { "ARG_MIN" };
        Ok(format!("{function}({argument}, {value})"))
    }
}

pub const ENGINES: &[&str] = &["sqlite", "psql", "bigquery", "duckdb"];

pub fn get(engine: &str) -> Result<Box<dyn Dialect>> {
    match engine {
        "bigquery" => Ok(Box::new(BigQueryDialect)),
        "sqlite" => Ok(Box::new(SqLiteDialect)),
        "psql" => Ok(Box::new(PostgreSqlDialect)),
        "duckdb" => Ok(Box::new(DuckDbDialect)),
        other => Err(CompileError::Dialect(format!(
            "Unrecognized engine: {other}. Supported engines: {}.",
            ENGINES.join(", ")
        ))),
    }
}
