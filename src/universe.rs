//! The universe: the assembled, rewritten program, ready to compile any
//! of its predicates to a self-contained SQL statement.
//!
//! Compilation computes the program slice of the requested predicate,
//! orders it topologically, inlines injectable predicates, materializes
//! the rest as CTEs, and unrolls recursive components to a fixed depth.

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use tracing::debug;

use crate::annotations::Annotations;
use crate::ast::{
    self, rule_dependencies, ExprKind, Expression, Field, Literal, Rule, Visitor, VALUE_FIELD,
};
use crate::dialect::{self, Dialect};
use crate::error::{CompileError, Result};
use crate::expr::{function_exists, ExprTranslator, SubqueryTranslator, Vocabulary};
use crate::functors;
use crate::parser::ParsedUnit;
use crate::translate::{
    extract_rule_structure, NamesAllocator, RuleStructure, TableColumn, Unification,
};

const DEFAULT_RECURSION_DEPTH: usize = 8;
const INJECTION_ROUNDS_LIMIT: usize = 1000;
const FLAG_SUBSTITUTION_LIMIT: usize = 100;

fn indent2(s: &str) -> String {
    s.split('\n').map(|l| format!("  {l}")).join("\n")
}

/// Per-compilation state: the name allocator and the synthesized
/// recursion-step table names that may be referenced from rewritten rules.
pub struct CompileContext {
    allocator: NamesAllocator,
    step_tables: IndexSet<String>,
}

impl CompileContext {
    fn new() -> CompileContext {
        CompileContext { allocator: NamesAllocator::new(), step_tables: IndexSet::new() }
    }
}

enum PlanEntry {
    Plain(String),
    RecursiveGroup(usize),
}

#[derive(Debug)]
pub struct Universe {
    rules: Vec<Rule>,
    /// Head predicate -> indices into `rules`, in source order. CTE
    /// emission order and the multi-body rewrite depend on insertion
    /// order here.
    rules_of: IndexMap<String, Vec<usize>>,
    pub annotations: Annotations,
    dialect: Box<dyn Dialect>,
    flag_values: IndexMap<String, String>,
    /// UDF name -> inline application template.
    custom_udfs: IndexMap<String, String>,
    depends_on: IndexMap<String, IndexSet<String>>,
    recursive_group_of: IndexMap<String, usize>,
    recursive_groups: Vec<Vec<String>>,
    cte_names: IndexMap<String, String>,
}

impl Universe {
    pub fn new(
        unit: ParsedUnit,
        user_flags: IndexMap<String, String>,
        engine_override: Option<&str>,
    ) -> Result<Universe> {
        let annotations = Annotations::new(&unit.rules, &user_flags)?;
        let rules = functors::run_makes(unit.rules, &annotations)?;
        // Functor expansion creates rules and annotations; recompute.
        let annotations = Annotations::new(&rules, &user_flags)?;
        if let Some((name, subject)) = annotations.solver_only_annotation() {
            return Err(CompileError::rule(
                format!("{name} requires a solver engine; SQL engines cannot express it."),
                format!("{name}({subject})"),
            ));
        }
        let engine = match engine_override {
            Some(e) => e.to_string(),
            None => annotations.engine()?,
        };
        let dialect = dialect::get(&engine)?;
        debug!(engine = %engine, rules = rules.len(), "universe assembled");

        let mut rules_of: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (i, rule) in rules.iter().enumerate() {
            rules_of.entry(rule.predicate_name().to_string()).or_default().push(i);
        }

        let mut depends_on: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for (predicate, indices) in &rules_of {
            if predicate.starts_with('@') {
                continue;
            }
            let mut deps = IndexSet::new();
            for &i in indices {
                deps.extend(rule_dependencies(&rules[i]));
            }
            depends_on.insert(predicate.clone(), deps);
        }

        let (recursive_groups, recursive_group_of) = find_recursive_groups(&depends_on);

        let mut cte_names = IndexMap::new();
        let mut used: IndexSet<String> = IndexSet::new();
        for predicate in rules_of.keys() {
            if predicate.starts_with('@') {
                continue;
            }
            let mut name: String = predicate
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
                .collect();
            if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
                name = format!("t_{name}");
            }
            while used.contains(&name) {
                name.push('_');
            }
            used.insert(name.clone());
            cte_names.insert(predicate.clone(), name);
        }

        let flag_values = annotations.flag_values.clone();
        let mut universe = Universe {
            rules,
            rules_of,
            annotations,
            dialect,
            flag_values,
            custom_udfs: IndexMap::new(),
            depends_on,
            recursive_group_of,
            recursive_groups,
            cte_names,
        };
        universe.check_dollar_params()?;
        universe.build_udfs()?;
        Ok(universe)
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn defined_predicates(&self) -> Vec<&str> {
        self.rules_of
            .keys()
            .filter(|p| !p.starts_with('@'))
            .map(String::as_str)
            .collect()
    }

    pub fn predicate_rules(&self, predicate: &str) -> Vec<&Rule> {
        self.rules_of
            .get(predicate)
            .map(|indices| indices.iter().map(|&i| &self.rules[i]).collect())
            .unwrap_or_default()
    }

    fn is_defined(&self, predicate: &str) -> bool {
        !predicate.starts_with('@') && self.rules_of.contains_key(predicate)
    }

    pub fn is_recursive(&self, predicate: &str) -> bool {
        self.recursive_group_of.contains_key(predicate)
    }

    fn cte_name(&self, predicate: &str) -> String {
        self.cte_names
            .get(predicate)
            .cloned()
            .unwrap_or_else(|| predicate.to_string())
    }

    /// Injectable: a single non-aggregating conjunctive rule, not
    /// recursive, not grounded, not annotated away from injection.
    pub fn is_injectable(&self, predicate: &str) -> Result<bool> {
        if !self.is_defined(predicate) || self.is_recursive(predicate) {
            return Ok(false);
        }
        let indices = &self.rules_of[predicate];
        if indices.len() != 1 || self.rules[indices[0]].distinct_denoted {
            return Ok(false);
        }
        self.annotations.ok_injection(predicate)
    }

    //
    // The compile entry point.
    //

    pub fn compile(&self, predicate_name: &str) -> Result<String> {
        debug!(predicate = %predicate_name, "compiling");
        if let Some(ground) = self.annotations.ground(predicate_name) {
            if !self.is_defined(predicate_name) {
                return Ok(format!("SELECT * FROM {};", ground.table_name));
            }
        }
        if self.annotations.compile_as_udf(predicate_name) {
            return self.create_function_sql(predicate_name);
        }
        if !self.is_defined(predicate_name) {
            return Err(CompileError::rule(
                format!(
                    "No rules are defining {predicate_name}, but compilation was requested."
                ),
                predicate_name,
            ));
        }

        let plan = self.plan(predicate_name)?;
        let mut ctx = CompileContext::new();
        for entry in &plan {
            if let PlanEntry::RecursiveGroup(gi) = entry {
                let depth = self.group_depth(*gi);
                for member in &self.recursive_groups[*gi] {
                    for k in 0..=depth {
                        ctx.step_tables.insert(format!("{}_r{k}", self.cte_name(member)));
                    }
                }
            }
        }

        let mut ctes: Vec<(String, String)> = Vec::new();
        for entry in &plan {
            match entry {
                PlanEntry::Plain(p) => {
                    if p != predicate_name {
                        let sql = self.predicate_sql(p, &ctx)?;
                        ctes.push((self.cte_name(p), sql));
                    }
                }
                PlanEntry::RecursiveGroup(gi) => {
                    self.emit_recursive_group(*gi, &ctx, &mut ctes)?;
                }
            }
        }

        let main_sql = if self.is_recursive(predicate_name) {
            format!(
                "SELECT * FROM {}{}{}",
                self.cte_name(predicate_name),
                self.annotations.order_by_clause(predicate_name)?,
                self.annotations.limit_clause(predicate_name)?
            )
        } else {
            self.predicate_sql(predicate_name, &ctx)?
        };

        let sql = if ctes.is_empty() {
            main_sql
        } else {
            let cte_str = ctes
                .iter()
                .map(|(name, sql)| format!("{name} AS (\n{}\n)", indent2(sql)))
                .join(",\n");
            format!("WITH {cte_str}\n{main_sql}")
        };
        Ok(format!("{};", self.use_flags_as_parameters(&sql)?))
    }

    /// Emission plan: dependencies first, recursive components as units,
    /// injectable predicates traversed but not emitted.
    fn plan(&self, requested: &str) -> Result<Vec<PlanEntry>> {
        let mut visited: IndexSet<String> = IndexSet::new();
        let mut planned_groups: IndexSet<usize> = IndexSet::new();
        let mut order: Vec<PlanEntry> = Vec::new();
        self.visit(requested, requested, &mut visited, &mut planned_groups, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        predicate: &str,
        requested: &str,
        visited: &mut IndexSet<String>,
        planned_groups: &mut IndexSet<usize>,
        order: &mut Vec<PlanEntry>,
    ) -> Result<()> {
        if visited.contains(predicate) || !self.is_defined(predicate) {
            return Ok(());
        }
        // Grounded call sites read the materialized table.
        if self.annotations.ground(predicate).is_some() && predicate != requested {
            visited.insert(predicate.to_string());
            return Ok(());
        }
        if let Some(&gi) = self.recursive_group_of.get(predicate) {
            if planned_groups.contains(&gi) {
                return Ok(());
            }
            planned_groups.insert(gi);
            let group: IndexSet<String> =
                self.recursive_groups[gi].iter().cloned().collect();
            for member in &self.recursive_groups[gi] {
                visited.insert(member.clone());
            }
            for member in &self.recursive_groups[gi] {
                for dep in &self.depends_on[member] {
                    if !group.contains(dep) {
                        self.visit(dep, requested, visited, planned_groups, order)?;
                    }
                }
            }
            order.push(PlanEntry::RecursiveGroup(gi));
            return Ok(());
        }
        visited.insert(predicate.to_string());
        for dep in &self.depends_on[predicate] {
            self.visit(dep, requested, visited, planned_groups, order)?;
        }
        if predicate == requested || !self.is_injectable(predicate)? {
            order.push(PlanEntry::Plain(predicate.to_string()));
        }
        Ok(())
    }

    fn group_depth(&self, group_index: usize) -> usize {
        self.recursive_groups[group_index]
            .iter()
            .filter_map(|m| self.annotations.recursive_depth(m))
            .max()
            .unwrap_or(DEFAULT_RECURSION_DEPTH)
    }

    /// Unrolls one strongly connected component: `Q_r0` seeds from the
    /// non-recursive disjuncts, `Q_rk` re-lowers every disjunct with
    /// member calls renamed to the `k-1` step, and the member's final CTE
    /// reads the last step.
    fn emit_recursive_group(
        &self,
        group_index: usize,
        ctx: &CompileContext,
        ctes: &mut Vec<(String, String)>,
    ) -> Result<()> {
        let group = &self.recursive_groups[group_index];
        let members: IndexSet<&String> = group.iter().collect();
        let depth = self.group_depth(group_index);

        let has_seed = group.iter().any(|member| {
            self.rules_of[member].iter().any(|&i| {
                rule_dependencies(&self.rules[i])
                    .iter()
                    .all(|d| !members.contains(d))
            })
        });
        if !has_seed {
            return Err(CompileError::rule(
                format!(
                    "Recursive predicate {} has no non-recursive base case.",
                    group[0]
                ),
                self.rules[self.rules_of[&group[0]][0]].full_text.clone(),
            ));
        }

        for k in 0..=depth {
            for member in group {
                let step_name = format!("{}_r{k}", self.cte_name(member));
                let mut step_rules: Vec<Rule> = Vec::new();
                for &i in &self.rules_of[member] {
                    let rule = &self.rules[i];
                    let mentioned: Vec<String> = rule_dependencies(rule)
                        .into_iter()
                        .filter(|d| members.contains(d))
                        .collect();
                    if k == 0 && !mentioned.is_empty() {
                        continue;
                    }
                    let mut clone = rule.clone();
                    for m in &mentioned {
                        ast::rename_predicate(
                            &mut clone,
                            m,
                            &format!("{}_r{}", self.cte_name(m), k - 1),
                        );
                    }
                    step_rules.push(clone);
                }
                let sql = if step_rules.is_empty() {
                    self.empty_seed_sql(member)?
                } else {
                    let refs: Vec<&Rule> = step_rules.iter().collect();
                    self.rules_sql(&refs, ctx)?
                };
                ctes.push((step_name, sql));
            }
        }
        for member in group {
            ctes.push((
                self.cte_name(member),
                format!("SELECT * FROM {}_r{depth}", self.cte_name(member)),
            ));
        }
        Ok(())
    }

    /// An empty relation with the member's head columns, seeding members
    /// whose every disjunct is recursive.
    fn empty_seed_sql(&self, member: &str) -> Result<String> {
        let rule = &self.rules[self.rules_of[member][0]];
        let columns: Vec<String> = rule
            .head
            .record
            .field_values
            .iter()
            .map(|fv| format!("NULL AS {}", fv.field.sql_name()))
            .collect();
        if columns.is_empty() {
            return Err(CompileError::rule(
                "Tables with no columns are not allowed in StandardSQL, so they are not \
                 allowed in Logica.",
                rule.full_text.clone(),
            ));
        }
        Ok(format!(
            "SELECT {} FROM (SELECT 1 AS s) AS unused_singleton WHERE {}",
            columns.join(", "),
            self.dialect.bool_literal(false)
        ))
    }

    fn rules_sql(&self, rules: &[&Rule], ctx: &CompileContext) -> Result<String> {
        if rules.len() == 1 {
            return self.single_rule_sql(rules[0], ctx, None);
        }
        let mut parts = Vec::new();
        for rule in rules {
            if rule.distinct_denoted {
                return Err(CompileError::rule(
                    "For distinct denoted predicates multiple rules are not currently \
                     supported. Consider taking union of bodies manually, if that was what \
                     you intended.",
                    rule.full_text.clone(),
                ));
            }
            parts.push(indent2(&self.single_rule_sql(rule, ctx, None)?));
        }
        Ok(format!(
            "SELECT * FROM (\n{}\n) AS unused_table_name",
            parts.join("\n UNION ALL\n")
        ))
    }

    /// Full SQL of a predicate: union of its rules plus ORDER BY / LIMIT
    /// annotations.
    fn predicate_sql(&self, name: &str, ctx: &CompileContext) -> Result<String> {
        let rules = self.predicate_rules(name);
        if rules.is_empty() {
            return Err(CompileError::rule(
                format!("No rules are defining {name}, but compilation was requested."),
                name,
            ));
        }
        Ok(format!(
            "{}{}{}",
            self.rules_sql(&rules, ctx)?,
            self.annotations.order_by_clause(name)?,
            self.annotations.limit_clause(name)?
        ))
    }

    fn single_rule_sql(
        &self,
        rule: &Rule,
        ctx: &CompileContext,
        external_vocabulary: Option<Vocabulary>,
    ) -> Result<String> {
        let exists = |f: &str| function_exists(f, &self.custom_udfs);
        let mut s = extract_rule_structure(rule, &ctx.allocator, external_vocabulary, &exists)?;
        s.eliminate_internal_variables(false)?;
        self.run_injections(&mut s, ctx)?;
        s.eliminate_internal_variables(true)?;
        s.unifications_to_constraints();
        let translator = UniverseTranslator { universe: self, ctx };
        s.as_sql(&translator)
    }

    /// Structurally inlines injectable callees into the rule structure,
    /// renaming their variables into the caller's scope, to fixpoint.
    fn run_injections(&self, s: &mut RuleStructure, ctx: &CompileContext) -> Result<()> {
        let exists = |f: &str| function_exists(f, &self.custom_udfs);
        for _round in 0..INJECTION_ROUNDS_LIMIT {
            let mut new_tables: IndexMap<String, String> = IndexMap::new();
            let tables = s.tables.clone();
            for (alias, predicate) in &tables {
                if !self.is_injectable(predicate)? {
                    new_tables.insert(alias.clone(), predicate.clone());
                    continue;
                }
                let rule = &self.rules[self.rules_of[predicate][0]];
                let mut rs =
                    extract_rule_structure(rule, &ctx.allocator, None, &exists)?;
                rs.eliminate_internal_variables(false)?;
                new_tables.extend(rs.tables.clone());
                s.vars_map.extend(rs.vars_map.clone());
                s.inv_vars_map.extend(rs.inv_vars_map.clone());
                s.vars_unification.extend(rs.vars_unification.clone());
                s.unnestings.extend(rs.unnestings.clone());
                s.constraints.extend(rs.constraints.clone());

                let mut new_vars_map: IndexMap<(Option<String>, TableColumn), String> =
                    IndexMap::new();
                let mut new_inv_vars_map: IndexMap<String, (Option<String>, TableColumn)> =
                    IndexMap::new();
                for ((table, column), clause_var) in &s.vars_map {
                    if table.as_deref() != Some(alias.as_str()) {
                        new_vars_map
                            .insert((table.clone(), column.clone()), clause_var.clone());
                        new_inv_vars_map
                            .insert(clause_var.clone(), (table.clone(), column.clone()));
                        continue;
                    }
                    let field = match column {
                        TableColumn::Field(field) if *field != Field::Splat => field.clone(),
                        _ => {
                            return Err(CompileError::rule(
                                format!(
                                    "Are you using ..<rest of> for injectible predicate \
                                     {predicate}? Please list the fields that you extract \
                                     explicitly."
                                ),
                                s.full_rule_text.clone(),
                            ));
                        }
                    };
                    if let Some(expr) = rs.select.get(&field) {
                        s.vars_unification.push(Unification {
                            left: Expression::variable(clause_var.clone()),
                            right: expr.clone(),
                        });
                    } else if let Some(splat) = rs.select.get(&Field::Splat) {
                        s.vars_unification.push(Unification {
                            left: Expression::variable(clause_var.clone()),
                            right: Expression::synthetic(
                                ExprKind::Subscript {
                                    record: Box::new(splat.clone()),
                                    field: field.sql_name(),
                                },
                                format!("{}.{}", splat.heritage.text(), field.sql_name()),
                            ),
                        });
                    } else {
                        return Err(CompileError::rule(
                            format!(
                                "Predicate {predicate} does not have an argument {}, but \
                                 this rule tries to access it.",
                                field.sql_name()
                            ),
                            s.full_rule_text.clone(),
                        ));
                    }
                }
                s.vars_map = new_vars_map;
                s.inv_vars_map = new_inv_vars_map;
            }
            if s.tables == new_tables {
                return Ok(());
            }
            s.tables = new_tables;
        }
        Err(CompileError::rule(
            "The rule appears to use unbounded injection; this usually means recursion \
             the compiler could not unroll.",
            s.full_rule_text.clone(),
        ))
    }

    //
    // UDFs.
    //

    fn build_udfs(&mut self) -> Result<()> {
        let udfs = self.annotations.udf_predicates();
        if udfs.is_empty() {
            return Ok(());
        }
        for f in &udfs {
            self.custom_udfs.insert(f.clone(), "DUMMY()".to_string());
        }
        // Two passes so functions calling functions see real templates.
        for _ in 0..2 {
            for f in &udfs {
                let (_, application) = self.function_application(f, true)?;
                self.custom_udfs.insert(f.clone(), application);
            }
        }
        Ok(())
    }

    /// Compiles a single-rule predicate into a formula. With `inline`,
    /// arguments render as `{name}` placeholders for call-site
    /// substitution; otherwise as plain argument names.
    fn function_application(&self, name: &str, inline: bool) -> Result<(Vec<String>, String)> {
        let rules = self.predicate_rules(name);
        let rule = match rules.as_slice() {
            [] => {
                return Err(CompileError::rule(
                    format!("No rules are defining {name}, but compilation was requested."),
                    name,
                ))
            }
            [rule] => *rule,
            _ => {
                return Err(CompileError::rule(
                    format!(
                        "Predicate {name} is defined by more than 1 rule and can not be \
                         compiled into a function."
                    ),
                    rules.iter().map(|r| r.full_text.to_string()).join("\n\n"),
                ))
            }
        };
        let ctx = CompileContext::new();
        let exists = |f: &str| function_exists(f, &self.custom_udfs);
        let mut s = extract_rule_structure(rule, &ctx.allocator, None, &exists)?;
        let mut vocabulary = Vocabulary::new();
        let mut arg_names = Vec::new();
        for (field, expr) in &s.select {
            if field.sql_name() == VALUE_FIELD {
                continue;
            }
            let var = expr.as_variable().ok_or_else(|| {
                CompileError::rule(
                    format!(
                        "Predicate {name} must not rename arguments for compilation as a \
                         function."
                    ),
                    rule.full_text.clone(),
                )
            })?;
            let placeholder = field.sql_name();
            arg_names.push(placeholder.clone());
            let rendering = if inline {
                format!("{{{placeholder}}}")
            } else {
                placeholder
            };
            vocabulary.insert(var.to_string(), rendering);
        }
        s.external_vocabulary = Some(vocabulary);
        self.run_injections(&mut s, &ctx)?;
        s.eliminate_internal_variables(true)?;
        s.unifications_to_constraints();
        if !s.tables.is_empty() || !s.constraints.is_empty() || !s.unnestings.is_empty() {
            return Err(CompileError::rule(
                format!(
                    "Predicate {name} is not a simple function, but compilation as \
                     function was requested."
                ),
                rule.full_text.clone(),
            ));
        }
        let value = s
            .select
            .get(&Field::Named(VALUE_FIELD.to_string()))
            .cloned()
            .ok_or_else(|| {
                CompileError::rule(
                    format!(
                        "Predicate {name} does not have a value, but compilation as \
                         function was requested."
                    ),
                    rule.full_text.clone(),
                )
            })?;
        let translator = UniverseTranslator { universe: self, ctx: &ctx };
        let vocabulary = s.vars_vocabulary();
        let ql = ExprTranslator::new(&vocabulary, &translator, &s.full_rule_text);
        Ok((arg_names, ql.convert(&value)?))
    }

    /// `CREATE TEMP FUNCTION` for a `@CompileAsUdf` predicate.
    fn create_function_sql(&self, name: &str) -> Result<String> {
        if self.dialect.name() != "BigQuery" {
            return Err(CompileError::Dialect(format!(
                "Compiling {name} to a function definition requires the bigquery engine; \
                 on other engines function calls are inlined."
            )));
        }
        let (arg_names, value_sql) = self.function_application(name, false)?;
        let signature = arg_names.iter().map(|a| format!("{a} ANY TYPE")).join(", ");
        Ok(format!(
            "CREATE TEMP FUNCTION {name}({signature}) AS ({value_sql});"
        ))
    }

    //
    // Flags.
    //

    fn check_dollar_params(&self) -> Result<()> {
        struct StringCollector {
            found: IndexSet<String>,
        }
        impl Visitor for StringCollector {
            fn expression(&mut self, expr: &mut Expression) {
                if let ExprKind::Literal(Literal::Str(s)) = &expr.kind {
                    self.found.extend(dollar_params(s));
                }
            }
        }
        let mut collector = StringCollector { found: IndexSet::new() };
        for rule in &self.rules {
            let mut r = rule.clone();
            ast::walk_rule(&mut collector, &mut r);
        }
        let undefined: Vec<&String> = collector
            .found
            .iter()
            .filter(|p| !self.flag_values.contains_key(*p))
            .collect();
        if !undefined.is_empty() {
            return Err(CompileError::rule(
                format!(
                    "Parameters {} are undefined.",
                    undefined.iter().map(|s| s.as_str()).join(", ")
                ),
                undefined.iter().map(|s| s.as_str()).join(", "),
            ));
        }
        Ok(())
    }

    /// Substitutes `${flag}` placeholders to fixpoint.
    fn use_flags_as_parameters(&self, sql: &str) -> Result<String> {
        let mut sql = sql.to_string();
        for _ in 0..FLAG_SUBSTITUTION_LIMIT {
            let mut next = sql.clone();
            for (flag, value) in &self.flag_values {
                next = next.replace(&format!("${{{flag}}}"), value);
            }
            if next == sql {
                return Ok(sql);
            }
            sql = next;
        }
        Err(CompileError::rule(
            "You seem to have recursive flags. It is disallowed.",
            self.flag_values
                .iter()
                .map(|(k, v)| format!("--{k}={v}"))
                .join("\n"),
        ))
    }
}

/// `${param}` names inside a string, except the date builtins.
fn dollar_params(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let param = &after[..end];
                if !(param.starts_with("YYYY") || param == "MM" || param == "DD") {
                    result.push(param.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    result
}

/// Strongly connected components of the defined-predicate dependency
/// graph that are genuinely recursive: size > 1 or self-referential.
fn find_recursive_groups(
    depends_on: &IndexMap<String, IndexSet<String>>,
) -> (Vec<Vec<String>>, IndexMap<String, usize>) {
    // Transitive reachability over defined predicates, to fixpoint.
    let mut reach: IndexMap<String, IndexSet<String>> = IndexMap::new();
    for (p, deps) in depends_on {
        let defined: IndexSet<String> = deps
            .iter()
            .filter(|d| depends_on.contains_key(*d))
            .cloned()
            .collect();
        reach.insert(p.clone(), defined);
    }
    loop {
        let mut changed = false;
        let predicates: Vec<String> = reach.keys().cloned().collect();
        for p in &predicates {
            let current: Vec<String> = reach[p].iter().cloned().collect();
            let mut additions = IndexSet::new();
            for q in &current {
                for a in &reach[q] {
                    if !reach[p].contains(a) {
                        additions.insert(a.clone());
                    }
                }
            }
            if !additions.is_empty() {
                reach.get_mut(p).unwrap().extend(additions);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut group_of: IndexMap<String, usize> = IndexMap::new();
    for p in reach.keys() {
        if group_of.contains_key(p) || !reach[p].contains(p) {
            continue;
        }
        let group: Vec<String> = reach
            .keys()
            .filter(|q| reach[p].contains(*q) && reach[*q].contains(p))
            .cloned()
            .collect();
        let index = groups.len();
        for member in &group {
            group_of.insert(member.clone(), index);
        }
        groups.push(group);
    }
    (groups, group_of)
}

struct UniverseTranslator<'a> {
    universe: &'a Universe,
    ctx: &'a CompileContext,
}

impl SubqueryTranslator for UniverseTranslator<'_> {
    fn translate_table(
        &self,
        predicate: &str,
        _external_vocabulary: Option<&Vocabulary>,
    ) -> Result<String> {
        if let Some(ground) = self.universe.annotations.ground(predicate) {
            return Ok(ground.table_name);
        }
        if self.universe.is_defined(predicate) {
            return Ok(self.universe.cte_name(predicate));
        }
        if self.ctx.step_tables.contains(predicate) {
            return Ok(predicate.to_string());
        }
        // Direct SQL in backticked parentheses: `(SELECT ...)`.
        if predicate.len() > 4 && predicate.starts_with("`(") && predicate.ends_with(")`") {
            return Ok(predicate[1..predicate.len() - 1].to_string());
        }
        if predicate.len() >= 2 && predicate.starts_with('`') && predicate.ends_with('`') {
            return Ok(self
                .universe
                .dialect
                .quote_identifier(&predicate[1..predicate.len() - 1]));
        }
        // External table references: dotted or lowercase names.
        if predicate.contains('.')
            || predicate.chars().next().map_or(false, |c| c.is_ascii_lowercase())
        {
            return Ok(predicate.to_string());
        }
        Err(CompileError::rule(
            format!("Unknown predicate: {predicate}."),
            predicate,
        ))
    }

    fn translate_combine(&self, rule: &Rule, vocabulary: &Vocabulary) -> Result<String> {
        self.universe
            .single_rule_sql(rule, self.ctx, Some(vocabulary.clone()))
    }

    fn dialect(&self) -> &dyn Dialect {
        self.universe.dialect.as_ref()
    }

    fn flag_values(&self) -> &IndexMap<String, String> {
        &self.universe.flag_values
    }

    fn custom_udfs(&self) -> &IndexMap<String, String> {
        &self.universe.custom_udfs
    }
}
