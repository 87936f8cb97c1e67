//! Lowering of a single conjunctive rule to a relational structure.
//!
//! A [`RuleStructure`] holds the source tables with synthesized aliases,
//! the bag of variable unifications, the constraint list, the output
//! column map and the unnestings of a rule. It eliminates internal
//! variables by substitution to fixpoint and renders itself as a SELECT.

use std::cell::{Cell, RefCell};

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;

use crate::ast::{
    mentioned_variables, mentioned_variables_in_rule, replace_variable_in_expression,
    replace_variable_in_rule, Call, ExprKind, Expression, Field, FieldValue, Proposition, Rule,
    Value, VALUE_FIELD,
};
use crate::dialect::GroupBySpec;
use crate::error::{CompileError, Result};
use crate::expr::{ExprTranslator, SubqueryTranslator, Vocabulary};
use crate::source::Span;

/// Marker appended to variables renamed apart inside combine expressions.
const DISAMBIGUATION_MARKER: &str = " # disambiguated with ";

/// Predicates that compile to WHERE constraints instead of tables.
const CONSTRAINT_PREDICATES: &[&str] = &[
    "<=", "<", ">", ">=", "!=", "&&", "||", "!", "IsNull", "Like", "Constraint", "=", "is",
    "is not",
];

/// Allocator of unique variable and table names for one compilation.
#[derive(Default)]
pub struct NamesAllocator {
    aux_var_num: Cell<usize>,
    table_num: Cell<usize>,
    allocated_tables: RefCell<IndexSet<String>>,
}

impl NamesAllocator {
    pub fn new() -> NamesAllocator {
        NamesAllocator::default()
    }

    pub fn allocate_var(&self) -> String {
        let n = self.aux_var_num.get();
        self.aux_var_num.set(n + 1);
        format!("x_{n}")
    }

    pub fn allocate_table(&self, hint_for_user: &str) -> String {
        let suffix: String = if hint_for_user.len() < 100 {
            hint_for_user
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/'))
                .map(|c| if matches!(c, '.' | '/') { '_' } else { c })
                .collect()
        } else {
            String::new()
        };
        let mut allocated = self.allocated_tables.borrow_mut();
        let name = if !suffix.is_empty() && !allocated.contains(&suffix) {
            suffix
        } else {
            let n = self.table_num.get();
            self.table_num.set(n + 1);
            if suffix.is_empty() {
                format!("t_{n}")
            } else {
                format!("t_{n}_{suffix}")
            }
        };
        allocated.insert(name.clone());
        name
    }
}

/// What a table variable points at inside its table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableColumn {
    Field(Field),
    /// Rest-of row minus the named fields (`..r` after named fields).
    Except(Vec<String>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Unification {
    pub left: Expression,
    pub right: Expression,
}

/// The relational structure of one conjunctive rule.
pub struct RuleStructure {
    pub this_predicate_name: String,
    /// Table alias -> predicate name. Iteration order is emission order.
    pub tables: IndexMap<String, String>,
    /// (table alias, column) -> clause variable.
    pub vars_map: IndexMap<(Option<String>, TableColumn), String>,
    /// Clause variable -> (table alias, column).
    pub inv_vars_map: IndexMap<String, (Option<String>, TableColumn)>,
    pub vars_unification: Vec<Unification>,
    pub constraints: Vec<Expression>,
    pub select: IndexMap<Field, Expression>,
    pub aggregated_fields: Vec<Field>,
    /// (variable expression, list expression) pairs.
    pub unnestings: Vec<(Expression, Expression)>,
    pub distinct_vars: Vec<Field>,
    pub distinct_denoted: bool,
    pub external_vocabulary: Option<Vocabulary>,
    /// Variable -> names it absorbed, for error messages.
    synonym_log: IndexMap<String, Vec<String>>,
    pub full_rule_text: Span,
}

impl RuleStructure {
    fn new(external_vocabulary: Option<Vocabulary>, full_rule_text: Span) -> RuleStructure {
        RuleStructure {
            this_predicate_name: String::new(),
            tables: IndexMap::new(),
            vars_map: IndexMap::new(),
            inv_vars_map: IndexMap::new(),
            vars_unification: Vec::new(),
            constraints: Vec::new(),
            select: IndexMap::new(),
            aggregated_fields: Vec::new(),
            unnestings: Vec::new(),
            distinct_vars: Vec::new(),
            distinct_denoted: false,
            external_vocabulary,
            synonym_log: IndexMap::new(),
            full_rule_text,
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::rule(message, self.full_rule_text.clone())
    }

    /// Variable -> SQL holding its value, from this rule's own tables.
    pub fn own_vars_vocabulary(&self) -> Vocabulary {
        let mut result = Vocabulary::new();
        for (var, (table, column)) in &self.inv_vars_map {
            let sql = match (table, column) {
                (Some(t), TableColumn::Field(Field::Splat)) => t.clone(),
                (Some(t), TableColumn::Field(f)) => format!("{t}.{}", f.sql_name()),
                (Some(t), TableColumn::Except(fields)) => {
                    format!("(SELECT AS STRUCT {t}.* EXCEPT ({}))", fields.join(","))
                }
                (None, TableColumn::Field(f)) => f.sql_name(),
                (None, TableColumn::Except(_)) => continue,
            };
            result.insert(var.clone(), sql);
        }
        result
    }

    /// Own vocabulary extended by the enclosing rule's, for subqueries.
    pub fn vars_vocabulary(&self) -> Vocabulary {
        let mut result = self.own_vars_vocabulary();
        if let Some(external) = &self.external_vocabulary {
            for (k, v) in external {
                result.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        result
    }

    pub fn extracted_variables(&self) -> IndexSet<String> {
        self.vars_vocabulary().keys().cloned().collect()
    }

    fn all_variables(&self) -> IndexSet<String> {
        let mut result = IndexSet::new();
        for expr in self.select.values() {
            result.extend(mentioned_variables(expr, false));
        }
        for u in &self.vars_unification {
            result.extend(mentioned_variables(&u.left, false));
            result.extend(mentioned_variables(&u.right, false));
        }
        for c in &self.constraints {
            result.extend(mentioned_variables(c, false));
        }
        for (var, list) in &self.unnestings {
            result.extend(mentioned_variables(var, false));
            result.extend(mentioned_variables(list, false));
        }
        result
    }

    pub fn internal_variables(&self) -> IndexSet<String> {
        let extracted = self.extracted_variables();
        self.all_variables()
            .into_iter()
            .filter(|v| !extracted.contains(v))
            .collect()
    }

    fn replace_variable_everywhere(&mut self, old: &str, new: &Expression) {
        if let Some(new_var) = new.as_variable() {
            let mut absorbed = vec![old.to_string()];
            absorbed.extend(self.synonym_log.get(old).cloned().unwrap_or_default());
            self.synonym_log
                .entry(new_var.to_string())
                .or_default()
                .extend(absorbed);
        }
        for (var, list) in &mut self.unnestings {
            replace_variable_in_expression(var, old, new);
            replace_variable_in_expression(list, old, new);
        }
        for expr in self.select.values_mut() {
            replace_variable_in_expression(expr, old, new);
        }
        for u in &mut self.vars_unification {
            replace_variable_in_expression(&mut u.left, old, new);
            replace_variable_in_expression(&mut u.right, old, new);
        }
        for c in &mut self.constraints {
            replace_variable_in_expression(c, old, new);
        }
    }

    fn assign_to_record(
        &mut self,
        target: &Expression,
        source: &Expression,
        variables: &IndexSet<String>,
        done: &mut bool,
    ) {
        let record = match &target.kind {
            ExprKind::Record(record) => record.clone(),
            _ => return,
        };
        for fv in &record.field_values {
            let expr = match fv.value.as_expr() {
                Some(e) => e,
                None => continue,
            };
            let new_source = Expression::synthetic(
                ExprKind::Subscript {
                    record: Box::new(source.clone()),
                    field: fv.field.sql_name(),
                },
                format!("{}.{}", source.heritage.text(), fv.field.sql_name()),
            );
            if let Some(v) = expr.as_variable() {
                let source_vars = mentioned_variables(source, true);
                if variables.contains(v) && !source_vars.contains(v) {
                    self.replace_variable_everywhere(v, &new_source);
                    *done = false;
                }
            } else if matches!(expr.kind, ExprKind::Record(_)) {
                self.assign_to_record(expr, &new_source, variables, done);
            }
        }
    }

    /// Eliminates internal variables via substitution to fixpoint.
    pub fn eliminate_internal_variables(&mut self, assert_full_elimination: bool) -> Result<()> {
        let extracted = self.extracted_variables();
        let mut variables = self.internal_variables();
        loop {
            let mut done = true;
            for i in 0..self.vars_unification.len() {
                for flip in [false, true] {
                    let u = self.vars_unification[i].clone();
                    let (k, r) = if flip { (&u.right, &u.left) } else { (&u.left, &u.right) };
                    if k == r {
                        continue;
                    }
                    let r_vars = mentioned_variables(r, false);
                    let r_vars_incl_combines = mentioned_variables(r, true);
                    if let Some(v) = k.as_variable() {
                        if variables.contains(v)
                            && !r_vars_incl_combines.contains(v)
                            && (r_vars.iter().all(|x| extracted.contains(x))
                                || !v.starts_with("x_"))
                        {
                            let v = v.to_string();
                            let r = r.clone();
                            self.replace_variable_everywhere(&v, &r);
                            done = false;
                        }
                    }
                }
                // Assignments to variables inside record fields.
                for flip in [false, true] {
                    let u = self.vars_unification[i].clone();
                    let (k, r) = if flip { (&u.right, &u.left) } else { (&u.left, &u.right) };
                    if k == r {
                        continue;
                    }
                    let r_vars = mentioned_variables(r, false);
                    if matches!(k.kind, ExprKind::Record(_))
                        && r_vars.iter().all(|x| extracted.contains(x))
                    {
                        let (k, r) = (k.clone(), r.clone());
                        let vars = variables.clone();
                        self.assign_to_record(&k, &r, &vars, &mut done);
                    }
                }
            }
            if done {
                variables = self.internal_variables();
                break;
            }
        }
        let strip_marker = |v: &str| -> String {
            v.split(DISAMBIGUATION_MARKER).next().unwrap_or(v).to_string()
        };
        if assert_full_elimination {
            if !variables.is_empty() {
                let mut violators: IndexSet<String> = IndexSet::new();
                for v in &variables {
                    violators.extend(self.synonym_log.get(v).cloned().unwrap_or_default());
                    violators.insert(v.clone());
                }
                let violators: Vec<String> = violators
                    .iter()
                    .filter(|v| !v.starts_with("x_"))
                    .map(|v| strip_marker(v))
                    .sorted()
                    .dedup()
                    .collect();
                if violators.is_empty() {
                    return Err(self.error(
                        "Internal compiler error: a purely internal variable was not \
                         eliminated. It looks like a required argument was not passed to \
                         some called predicate.",
                    ));
                }
                return Err(self.error(format!(
                    "Found no way to assign variables: {}. This error might also come from \
                     injected sub-rules.",
                    violators.join(", ")
                )));
            }
        } else {
            let unassigned: Vec<String> = variables
                .iter()
                .filter(|v| !v.starts_with("x_"))
                .map(|v| strip_marker(v))
                .sorted()
                .dedup()
                .collect();
            if !unassigned.is_empty() {
                return Err(self.error(format!(
                    "Found no way to assign variables: {}. This error might also come from \
                     injected sub-rules.",
                    unassigned.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Remaining unifications become equality constraints.
    pub fn unifications_to_constraints(&mut self) {
        let unifications = std::mem::take(&mut self.vars_unification);
        for u in unifications {
            if u.left == u.right {
                continue;
            }
            let text = format!("{} == {}", u.left.heritage.text(), u.right.heritage.text());
            self.constraints.push(Expression::synthetic(
                ExprKind::Call(Call::new(
                    "==",
                    vec![
                        FieldValue::expression(Field::Named("left".to_string()), u.left),
                        FieldValue::expression(Field::Named("right".to_string()), u.right),
                    ],
                )),
                text,
            ));
        }
    }

    /// Orders unnestings so that each list only mentions variables
    /// unnested before it.
    fn sort_unnestings(&mut self) -> Result<()> {
        let mut unnesting_of: IndexMap<String, (Expression, Expression)> = IndexMap::new();
        for (var, list) in &self.unnestings {
            let name = var
                .as_variable()
                .ok_or_else(|| self.error("Internal compiler error: unnesting of non-variable."))?;
            unnesting_of.insert(name.to_string(), (var.clone(), list.clone()));
        }
        let unnesting_variables: IndexSet<String> = unnesting_of.keys().cloned().collect();
        let mut depends_on: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for (name, (_, list)) in &unnesting_of {
            let deps = mentioned_variables(list, true)
                .into_iter()
                .filter(|v| unnesting_variables.contains(v))
                .collect();
            depends_on.insert(name.clone(), deps);
        }
        let mut unnested: IndexSet<String> = IndexSet::new();
        let mut ordered = Vec::new();
        while !unnesting_of.is_empty() {
            let next = unnesting_of
                .keys()
                .sorted()
                .find(|v| depends_on[*v].iter().all(|d| unnested.contains(d)))
                .cloned();
            match next {
                Some(v) => {
                    ordered.push(unnesting_of.shift_remove(&v).expect("present"));
                    unnested.insert(v);
                }
                None => {
                    return Err(self.error(
                        "There seem to be a circular dependency of In calls. This error \
                         might also come from injected sub-rules.",
                    ));
                }
            }
        }
        self.unnestings = ordered;
        Ok(())
    }

    /// Renders the structure as a SELECT statement.
    pub fn as_sql(&mut self, translator: &dyn SubqueryTranslator) -> Result<String> {
        let vocabulary = self.vars_vocabulary();
        let context = self.full_rule_text.clone();
        let ql = ExprTranslator::new(&vocabulary, translator, &context);
        if self.select.is_empty() {
            return Err(self.error(
                "Tables with no columns are not allowed in StandardSQL, so they are not \
                 allowed in Logica.",
            ));
        }
        let mut fields = Vec::new();
        for (k, v) in &self.select {
            match k {
                Field::Splat => fields.push(format!("{}.*", ql.convert(v)?)),
                _ => fields.push(format!("{} AS {}", ql.convert(v)?, k.sql_name())),
            }
        }
        let distinct = self.distinct_denoted && self.aggregated_fields.is_empty();
        let mut r = if distinct {
            "SELECT DISTINCT\n".to_string()
        } else {
            "SELECT\n".to_string()
        };
        r.push_str(&fields.iter().map(|f| format!("  {f}")).join(",\n"));

        let group_by_needed = !self.aggregated_fields.is_empty();
        if !self.tables.is_empty()
            || !self.unnestings.is_empty()
            || !self.constraints.is_empty()
            || group_by_needed
        {
            r.push_str("\nFROM\n");
            let mut tables = Vec::new();
            for (alias, predicate) in &self.tables {
                let sql =
                    translator.translate_table(predicate, self.external_vocabulary.as_ref())?;
                if &sql != alias {
                    tables.push(format!("{sql} AS {alias}"));
                } else {
                    tables.push(sql);
                }
            }
            self.sort_unnestings()?;
            for (var, list) in &self.unnestings {
                tables.push(
                    translator
                        .dialect()
                        .unnest_phrase(&ql.convert(list)?, &ql.convert(var)?),
                );
            }
            if tables.is_empty() {
                tables.push("(SELECT 1 AS s) AS unused_singleton".to_string());
            }
            let from_str = tables.join(", ");
            r.push_str(&from_str.split('\n').map(|l| format!("  {l}")).join("\n"));
            if !self.constraints.is_empty() {
                r.push_str("\nWHERE\n");
                let constraints = self
                    .constraints
                    .iter()
                    .map(|c| ql.convert(c))
                    .collect::<Result<Vec<_>>>()?;
                r.push_str(
                    &constraints
                        .iter()
                        .map(|c| c.split('\n').map(|l| format!("  {l}")).join("\n"))
                        .join(" AND\n"),
                );
            }
            if group_by_needed && !self.distinct_vars.is_empty() {
                r.push_str("\nGROUP BY ");
                let spec = match translator.dialect().group_by_spec() {
                    GroupBySpec::Name => self
                        .distinct_vars
                        .iter()
                        .map(|f| f.sql_name())
                        .join(", "),
                    GroupBySpec::Index => self
                        .distinct_vars
                        .iter()
                        .map(|f| {
                            (self.select.get_index_of(f).expect("distinct var selected") + 1)
                                .to_string()
                        })
                        .join(", "),
                    GroupBySpec::Expr => self
                        .distinct_vars
                        .iter()
                        .map(|f| ql.convert(&self.select[f]))
                        .collect::<Result<Vec<_>>>()?
                        .join(", "),
                };
                r.push_str(&spec);
            }
        }
        Ok(r)
    }
}

//
// Extraction of structure from a rule.
//

fn head_to_select(
    s: &mut RuleStructure,
    head: &Call,
) -> Result<()> {
    for fv in &head.record.field_values {
        match &fv.value {
            Value::AggregatedExpr(expr) => {
                s.select.insert(fv.field.clone(), expr.clone());
                s.aggregated_fields.push(fv.field.clone());
            }
            Value::Expr(expr) => {
                s.select.insert(fv.field.clone(), expr.clone());
            }
            Value::Aggregation { .. } => {
                return Err(s.error(
                    "Internal compiler error: raw aggregation survived the rewrites.",
                ));
            }
        }
    }
    Ok(())
}

fn extract_predicate_structure(
    call: &Call,
    s: &mut RuleStructure,
    allocator: &NamesAllocator,
) -> Result<()> {
    let predicate = &call.predicate_name;
    if CONSTRAINT_PREDICATES.contains(&predicate.as_str()) {
        s.constraints.push(Expression::synthetic(
            ExprKind::Call(call.clone()),
            call.predicate_name.clone(),
        ));
        return Ok(());
    }
    // Type-unification proposition: no SQL action.
    if predicate == "~" {
        return Ok(());
    }
    let table_name = allocator.allocate_table(predicate);
    s.tables.insert(table_name.clone(), predicate.clone());
    for fv in &call.record.field_values {
        let column = if fv.field == Field::Splat && !fv.except.is_empty() {
            TableColumn::Except(fv.except.clone())
        } else {
            TableColumn::Field(fv.field.clone())
        };
        let expr = fv.value.as_expr().ok_or_else(|| {
            s.error("Aggregation is only allowed in rule heads and combine expressions.")
        })?;
        let var_name = allocator.allocate_var();
        s.vars_map
            .insert((Some(table_name.clone()), column.clone()), var_name.clone());
        s.inv_vars_map
            .insert(var_name.clone(), (Some(table_name.clone()), column));
        s.vars_unification.push(Unification {
            left: Expression::variable(var_name),
            right: expr.clone(),
        });
    }
    Ok(())
}

fn extract_inclusion_structure(
    element: &Expression,
    list: &Expression,
    s: &mut RuleStructure,
    allocator: &NamesAllocator,
) {
    // A `Container` call keeps the inclusion as a WHERE constraint.
    if let ExprKind::Call(call) = &list.kind {
        if call.predicate_name == "Container" {
            let text = format!("{} in {}", element.heritage.text(), list.heritage.text());
            s.constraints.push(Expression::synthetic(
                ExprKind::Call(Call::new(
                    "in",
                    vec![
                        FieldValue::expression(Field::Named("left".to_string()), element.clone()),
                        FieldValue::expression(Field::Named("right".to_string()), list.clone()),
                    ],
                )),
                text,
            ));
            return;
        }
    }
    // Otherwise the list is unnested.
    let var_name = allocator.allocate_var();
    s.vars_map.insert(
        (None, TableColumn::Field(Field::Named(var_name.clone()))),
        var_name.clone(),
    );
    s.inv_vars_map.insert(
        var_name.clone(),
        (None, TableColumn::Field(Field::Named(var_name.clone()))),
    );
    s.unnestings
        .push((Expression::variable(var_name.clone()), list.clone()));
    s.vars_unification.push(Unification {
        left: element.clone(),
        right: Expression::call(
            "ValueOfUnnested",
            vec![FieldValue::expression(
                Field::Positional(0),
                Expression::variable(var_name),
            )],
        ),
    });
}

fn extract_conjunctive_structure(
    conjuncts: &[Proposition],
    s: &mut RuleStructure,
    allocator: &NamesAllocator,
) -> Result<()> {
    for conjunct in conjuncts {
        match conjunct {
            Proposition::Call(call) => extract_predicate_structure(call, s, allocator)?,
            Proposition::Unification { left, right } => {
                let unifiable = |e: &Expression| {
                    matches!(e.kind, ExprKind::Variable(_) | ExprKind::Record(_))
                };
                if unifiable(left) || unifiable(right) {
                    s.vars_unification.push(Unification {
                        left: left.clone(),
                        right: right.clone(),
                    });
                } else if left != right {
                    let text =
                        format!("{} == {}", left.heritage.text(), right.heritage.text());
                    s.constraints.push(Expression::synthetic(
                        ExprKind::Call(Call::new(
                            "==",
                            vec![
                                FieldValue::expression(
                                    Field::Named("left".to_string()),
                                    left.clone(),
                                ),
                                FieldValue::expression(
                                    Field::Named("right".to_string()),
                                    right.clone(),
                                ),
                            ],
                        )),
                        text,
                    ));
                }
            }
            Proposition::Inclusion { element, list } => {
                extract_inclusion_structure(element, list, s, allocator)
            }
            Proposition::Conjunction(_) | Proposition::Disjunction(_) => {
                return Err(s.error(
                    "Internal compiler error: non-conjunctive body survived the DNF rewrite.",
                ));
            }
        }
    }
    Ok(())
}

//
// Value inlining of predicate calls in expression position.
//

fn inline_in_expression(
    expr: &mut Expression,
    allocator: &NamesAllocator,
    function_exists: &dyn Fn(&str) -> bool,
    extra_conjuncts: &mut Vec<Proposition>,
) {
    match &mut expr.kind {
        ExprKind::Literal(crate::ast::Literal::List(elements)) => {
            for e in elements {
                inline_in_expression(e, allocator, function_exists, extra_conjuncts);
            }
        }
        ExprKind::Literal(_) | ExprKind::Variable(_) => {}
        ExprKind::Record(record) => {
            for fv in &mut record.field_values {
                if let Some(e) = value_expr_mut(&mut fv.value) {
                    inline_in_expression(e, allocator, function_exists, extra_conjuncts);
                }
            }
        }
        ExprKind::Call(call) => {
            for fv in &mut call.record.field_values {
                if let Some(e) = value_expr_mut(&mut fv.value) {
                    inline_in_expression(e, allocator, function_exists, extra_conjuncts);
                }
            }
        }
        ExprKind::Subscript { record, .. } => {
            inline_in_expression(record, allocator, function_exists, extra_conjuncts);
        }
        // Combine sub-rules resolve their own values.
        ExprKind::Combine(_) => {}
        ExprKind::Implication(implication) => {
            for it in &mut implication.if_thens {
                inline_in_expression(&mut it.condition, allocator, function_exists, extra_conjuncts);
                inline_in_expression(
                    &mut it.consequence,
                    allocator,
                    function_exists,
                    extra_conjuncts,
                );
            }
            inline_in_expression(
                &mut implication.otherwise,
                allocator,
                function_exists,
                extra_conjuncts,
            );
        }
    }
    if let ExprKind::Call(call) = &expr.kind {
        if !function_exists(&call.predicate_name) {
            let aux_var = allocator.allocate_var();
            let mut predicate_call = call.clone();
            predicate_call.record.field_values.push(FieldValue::expression(
                Field::Named(VALUE_FIELD.to_string()),
                Expression::variable(aux_var.clone()),
            ));
            extra_conjuncts.push(Proposition::Call(predicate_call));
            *expr = Expression::new(ExprKind::Variable(aux_var), expr.heritage.clone());
        }
    }
}

fn value_expr_mut(value: &mut Value) -> Option<&mut Expression> {
    match value {
        Value::Expr(e) | Value::AggregatedExpr(e) | Value::Aggregation { argument: e, .. } => {
            Some(e)
        }
    }
}

fn inline_in_proposition(
    prop: &mut Proposition,
    allocator: &NamesAllocator,
    function_exists: &dyn Fn(&str) -> bool,
    extra_conjuncts: &mut Vec<Proposition>,
) {
    match prop {
        Proposition::Call(call) => {
            for fv in &mut call.record.field_values {
                if let Some(e) = value_expr_mut(&mut fv.value) {
                    inline_in_expression(e, allocator, function_exists, extra_conjuncts);
                }
            }
        }
        Proposition::Unification { left, right } => {
            inline_in_expression(left, allocator, function_exists, extra_conjuncts);
            inline_in_expression(right, allocator, function_exists, extra_conjuncts);
        }
        Proposition::Inclusion { element, list } => {
            inline_in_expression(element, allocator, function_exists, extra_conjuncts);
            inline_in_expression(list, allocator, function_exists, extra_conjuncts);
        }
        Proposition::Conjunction(ps) | Proposition::Disjunction(ps) => {
            for p in ps {
                inline_in_proposition(p, allocator, function_exists, extra_conjuncts);
            }
        }
    }
}

/// Replaces calls to non-function predicates in expression position with
/// an auxiliary variable bound through an extra conjunct.
fn inline_predicate_values(
    rule: &mut Rule,
    allocator: &NamesAllocator,
    function_exists: &dyn Fn(&str) -> bool,
) {
    let mut extra_conjuncts = Vec::new();
    for fv in &mut rule.head.record.field_values {
        if let Some(e) = value_expr_mut(&mut fv.value) {
            inline_in_expression(e, allocator, function_exists, &mut extra_conjuncts);
        }
    }
    if let Some(body) = &mut rule.body {
        for p in body.iter_mut() {
            inline_in_proposition(p, allocator, function_exists, &mut extra_conjuncts);
        }
    }
    if !extra_conjuncts.is_empty() {
        rule.body.get_or_insert_with(Vec::new).extend(extra_conjuncts);
    }
}

//
// Combine variable disambiguation.
//

fn for_each_direct_combine_in_expression(
    expr: &mut Expression,
    f: &mut impl FnMut(&mut Rule),
) {
    match &mut expr.kind {
        ExprKind::Combine(rule) => f(rule),
        ExprKind::Literal(crate::ast::Literal::List(elements)) => {
            for e in elements {
                for_each_direct_combine_in_expression(e, f);
            }
        }
        ExprKind::Literal(_) | ExprKind::Variable(_) => {}
        ExprKind::Record(record) => {
            for fv in &mut record.field_values {
                if let Some(e) = value_expr_mut(&mut fv.value) {
                    for_each_direct_combine_in_expression(e, f);
                }
            }
        }
        ExprKind::Call(call) => {
            for fv in &mut call.record.field_values {
                if let Some(e) = value_expr_mut(&mut fv.value) {
                    for_each_direct_combine_in_expression(e, f);
                }
            }
        }
        ExprKind::Subscript { record, .. } => {
            for_each_direct_combine_in_expression(record, f);
        }
        ExprKind::Implication(implication) => {
            for it in &mut implication.if_thens {
                for_each_direct_combine_in_expression(&mut it.condition, f);
                for_each_direct_combine_in_expression(&mut it.consequence, f);
            }
            for_each_direct_combine_in_expression(&mut implication.otherwise, f);
        }
    }
}

fn for_each_direct_combine_in_rule(rule: &mut Rule, f: &mut impl FnMut(&mut Rule)) {
    for fv in &mut rule.head.record.field_values {
        if let Some(e) = value_expr_mut(&mut fv.value) {
            for_each_direct_combine_in_expression(e, f);
        }
    }
    if let Some(body) = &mut rule.body {
        for p in body {
            for_each_direct_combine_in_proposition(p, f);
        }
    }
}

fn for_each_direct_combine_in_proposition(
    prop: &mut Proposition,
    f: &mut impl FnMut(&mut Rule),
) {
    match prop {
        Proposition::Call(call) => {
            for fv in &mut call.record.field_values {
                if let Some(e) = value_expr_mut(&mut fv.value) {
                    for_each_direct_combine_in_expression(e, f);
                }
            }
        }
        Proposition::Unification { left, right } => {
            for_each_direct_combine_in_expression(left, f);
            for_each_direct_combine_in_expression(right, f);
        }
        Proposition::Inclusion { element, list } => {
            for_each_direct_combine_in_expression(element, f);
            for_each_direct_combine_in_expression(list, f);
        }
        Proposition::Conjunction(ps) | Proposition::Disjunction(ps) => {
            for p in ps {
                for_each_direct_combine_in_proposition(p, f);
            }
        }
    }
}

fn rename_combine_apart(
    combine: &mut Rule,
    outer_variables: &IndexSet<String>,
    allocator: &NamesAllocator,
) {
    let variables = mentioned_variables_in_rule(combine, false);
    for v in &variables {
        if outer_variables.contains(v) || v.contains(DISAMBIGUATION_MARKER) {
            continue;
        }
        let new_name = format!("{v}{DISAMBIGUATION_MARKER}{}", allocator.allocate_var());
        replace_variable_in_rule(combine, v, &Expression::variable(new_name));
    }
    let mut all_variables = outer_variables.clone();
    all_variables.extend(mentioned_variables_in_rule(combine, false));
    for_each_direct_combine_in_rule(combine, &mut |nested| {
        rename_combine_apart(nested, &all_variables, allocator);
    });
}

/// Variables of the same name in different combine expressions are
/// different variables; they are renamed apart before lowering.
fn disambiguate_combine_variables(rule: &mut Rule, allocator: &NamesAllocator) {
    let top_variables = mentioned_variables_in_rule(rule, false);
    for_each_direct_combine_in_rule(rule, &mut |combine| {
        rename_combine_apart(combine, &top_variables, allocator);
    });
}

/// Extracts the relational structure of one conjunctive rule.
pub fn extract_rule_structure(
    rule: &Rule,
    allocator: &NamesAllocator,
    external_vocabulary: Option<Vocabulary>,
    function_exists: &dyn Fn(&str) -> bool,
) -> Result<RuleStructure> {
    let mut rule = rule.clone();
    // A combine's variables were already disambiguated from the parent.
    if rule.predicate_name() != "Combine" {
        disambiguate_combine_variables(&mut rule, allocator);
    }
    let mut s = RuleStructure::new(external_vocabulary, rule.full_text.clone());
    inline_predicate_values(&mut rule, allocator, function_exists);
    s.this_predicate_name = rule.predicate_name().to_string();
    head_to_select(&mut s, &rule.head)?;
    // Unify select variables with fresh internal names so user variables
    // of injected predicates cannot collide.
    let select_exprs: Vec<(Field, Expression)> = s
        .select
        .iter()
        .filter(|(_, expr)| matches!(expr.kind, ExprKind::Variable(_)))
        .map(|(f, e)| (f.clone(), e.clone()))
        .collect();
    for (_, expr) in select_exprs {
        s.vars_unification.push(Unification {
            left: expr,
            right: Expression::variable(allocator.allocate_var()),
        });
    }
    if let Some(body) = &rule.body {
        extract_conjunctive_structure(body, &mut s, allocator)?;
    }
    s.distinct_denoted = rule.distinct_denoted;
    if !s.aggregated_fields.is_empty() && !rule.distinct_denoted {
        return Err(s.error("Aggregating predicate must be distinct denoted."));
    }
    if rule.distinct_denoted {
        s.distinct_vars = s
            .select
            .keys()
            .filter(|k| !s.aggregated_fields.contains(k))
            .cloned()
            .collect();
    }
    Ok(s)
}
