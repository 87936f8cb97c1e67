//! Functor instantiation: running `@Make` instructions.
//!
//! Every predicate is also a functor: a mapping from the predicates its
//! definition uses (its arguments) to itself. `@Make(R, F, {A: V, ...})`
//! clones the rules of `F` (and of every argument predicate affected by
//! the substitution), substitutes slot predicates throughout, and defines
//! `R`. Instantiation iterates to fixpoint; unresolvable orders are
//! errors.

use indexmap::{IndexMap, IndexSet};

use crate::annotations::{AnnotationArgs, AnnotationValue, Annotations};
use crate::ast::{self, rule_dependencies, ExprKind, Expression, Field, Literal, Rule, Visitor};
use crate::error::{CompileError, Result};

fn functor_error(functor: &str, message: impl Into<String>) -> CompileError {
    CompileError::Functor { functor: functor.to_string(), message: message.into() }
}

/// Annotations inherited by predicates a functor call creates.
const INHERITED_ANNOTATIONS: &[&str] =
    &["@Limit", "@OrderBy", "@Ground", "@NoInject", "@Recursive"];

struct MapRenamer<'a> {
    map: &'a IndexMap<String, String>,
}

impl Visitor for MapRenamer<'_> {
    fn predicate_name(&mut self, name: &mut String) {
        if let Some(new) = self.map.get(name) {
            *name = new.clone();
        }
    }

    fn field_name(&mut self, name: &mut String) {
        if let Some(new) = self.map.get(name) {
            *name = new.clone();
        }
    }
}

/// One simultaneous rename pass over a rule; map values never chain.
fn rename_by_map(rule: &mut Rule, map: &IndexMap<String, String>) {
    ast::walk_rule(&mut MapRenamer { map }, rule);
}

pub struct Functors {
    pub extended_rules: Vec<Rule>,
    rules_of: IndexMap<String, Vec<Rule>>,
    /// Transitive predicate arguments of each defined predicate. A
    /// predicate on a dependency cycle is its own argument.
    args_of: IndexMap<String, IndexSet<String>>,
    creation_count: usize,
    cached_calls: IndexMap<String, String>,
}

impl Functors {
    pub fn new(rules: &[Rule]) -> Functors {
        let mut functors = Functors {
            extended_rules: rules.to_vec(),
            rules_of: IndexMap::new(),
            args_of: IndexMap::new(),
            creation_count: 0,
            cached_calls: IndexMap::new(),
        };
        functors.update_structure();
        functors
    }

    fn update_structure(&mut self) {
        self.rules_of = IndexMap::new();
        for rule in &self.extended_rules {
            self.rules_of
                .entry(rule.predicate_name().to_string())
                .or_default()
                .push(rule.clone());
        }
        // Direct arguments, then transitive closure to fixpoint. The
        // closure keeps cycle members among their own arguments, which
        // downstream recursion analysis relies on.
        let mut args: IndexMap<String, IndexSet<String>> = IndexMap::new();
        for (predicate, rules) in &self.rules_of {
            let mut direct = IndexSet::new();
            for rule in rules {
                direct.extend(rule_dependencies(rule));
            }
            args.insert(predicate.clone(), direct);
        }
        loop {
            let mut changed = false;
            let predicates: Vec<String> = args.keys().cloned().collect();
            for p in &predicates {
                let current: Vec<String> = args[p].iter().cloned().collect();
                let mut additions = IndexSet::new();
                for q in &current {
                    if let Some(q_args) = args.get(q) {
                        for a in q_args {
                            if !args[p].contains(a) {
                                additions.insert(a.clone());
                            }
                        }
                    }
                }
                if !additions.is_empty() {
                    args.get_mut(p).unwrap().extend(additions);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.args_of = args;
    }

    pub fn args_of(&self, functor: &str) -> IndexSet<String> {
        self.args_of.get(functor).cloned().unwrap_or_default()
    }

    /// All rules relevant to a functor: its own and its arguments'.
    fn all_rules_of(&self, functor: &str) -> Result<Vec<Rule>> {
        let mut result = Vec::new();
        let own = match self.rules_of.get(functor) {
            Some(rules) => rules,
            None => return Ok(result),
        };
        result.extend(own.iter().cloned());
        for arg in &self.args_of[functor] {
            if arg == functor {
                return Err(functor_error(
                    functor,
                    format!("Failed to eliminate recursion of {functor}."),
                ));
            }
            if let Some(rules) = self.rules_of.get(arg) {
                result.extend(rules.iter().cloned());
            }
        }
        Ok(result)
    }

    /// A canonical key of a functor application, for structure sharing.
    fn call_key(&self, functor: &str, args_map: &IndexMap<String, String>) -> String {
        let relevant = self.args_of(functor);
        let mut args: Vec<String> = args_map
            .iter()
            .filter(|(k, _)| relevant.contains(*k))
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        args.sort();
        format!("{functor}({})", args.join(","))
    }

    fn collect_annotations(&self, predicates: &IndexSet<String>) -> Vec<Rule> {
        let mut result = Vec::new();
        for annotation in INHERITED_ANNOTATIONS {
            if let Some(rules) = self.rules_of.get(*annotation) {
                for rule in rules {
                    let subject = rule
                        .head
                        .record
                        .field(&Field::Positional(0))
                        .and_then(|fv| fv.value.as_expr())
                        .and_then(|e| match &e.kind {
                            ExprKind::Literal(Literal::Predicate(p)) => Some(p.clone()),
                            _ => None,
                        });
                    if let Some(subject) = subject {
                        if predicates.contains(&subject) {
                            result.push(rule.clone());
                        }
                    }
                }
            }
        }
        result
    }

    fn call_functor(
        &mut self,
        name: &str,
        applicant: &str,
        args_map: &IndexMap<String, String>,
    ) -> Result<()> {
        let applicant_args = self.args_of(applicant);
        let bad_args: Vec<&String> =
            args_map.keys().filter(|k| !applicant_args.contains(*k)).collect();
        if !bad_args.is_empty() {
            return Err(functor_error(
                name,
                format!(
                    "Functor {applicant} is applied to arguments {}, which it does not have.",
                    bad_args.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
                ),
            ));
        }
        self.creation_count += 1;
        let all_rules = self.all_rules_of(applicant)?;
        let args: IndexSet<String> = args_map.keys().cloned().collect();
        let mut rules: Vec<Rule> = all_rules
            .into_iter()
            .filter(|r| {
                r.predicate_name() == applicant
                    || self
                        .args_of(r.predicate_name())
                        .iter()
                        .any(|a| args.contains(a))
            })
            .collect();
        if rules.is_empty() {
            return Err(functor_error(
                name,
                format!("Rules for {applicant} when making {name} are not found"),
            ));
        }
        rules.sort_by_key(|r| (r.predicate_name().to_string(), r.full_text.to_string()));

        let mut extended_args_map: IndexMap<String, String> = args_map.clone();
        let mut rules_to_update: Vec<Rule> = Vec::new();
        let mut predicates_to_annotate: IndexSet<String> = IndexSet::new();
        for rule in rules {
            let rule_predicate = rule.predicate_name().to_string();
            if rule_predicate == applicant {
                extended_args_map.insert(rule_predicate.clone(), name.to_string());
                predicates_to_annotate.insert(rule_predicate);
                rules_to_update.push(rule);
            } else {
                if args_map.contains_key(&rule_predicate) {
                    continue;
                }
                let call_key = self.call_key(&rule_predicate, args_map);
                if let Some(shared) = self.cached_calls.get(&call_key) {
                    extended_args_map.insert(rule_predicate, shared.clone());
                } else {
                    let new_name = format!("{rule_predicate}_f{}", self.creation_count);
                    extended_args_map.insert(rule_predicate.clone(), new_name.clone());
                    self.cached_calls.insert(call_key, new_name);
                    predicates_to_annotate.insert(rule_predicate);
                    rules_to_update.push(rule);
                }
            }
        }
        // Created predicates inherit annotations of the predicates they
        // were created from; functor argument values do not.
        let annotations = self.collect_annotations(&predicates_to_annotate);
        rules_to_update.extend(annotations);
        for rule in &mut rules_to_update {
            rename_by_map(rule, &extended_args_map);
        }
        self.extended_rules.extend(rules_to_update);
        self.update_structure();
        Ok(())
    }

    /// Runs all `@Make` instructions in dependency order.
    pub fn make_all(&mut self, instructions: &IndexMap<String, AnnotationArgs>) -> Result<()> {
        let parsed: Vec<(String, String, IndexMap<String, String>)> = instructions
            .iter()
            .map(|(subject, args)| parse_make_instruction(subject, args))
            .collect::<Result<Vec<_>>>()?;
        let mut needs_building: IndexSet<String> =
            parsed.iter().map(|(name, _, _)| name.clone()).collect();
        let mut ordered = parsed;
        ordered.sort_by_key(|(name, _, _)| name.clone());
        while !needs_building.is_empty() {
            let mut something_built = false;
            for (name, applicant, args_map) in &ordered {
                if !needs_building.contains(name)
                    || needs_building.contains(applicant)
                    || self.args_of(applicant).iter().any(|a| needs_building.contains(a))
                    || args_map.values().any(|v| needs_building.contains(v))
                {
                    continue;
                }
                self.call_functor(name, applicant, args_map)?;
                something_built = true;
                needs_building.shift_remove(name);
            }
            if !needs_building.is_empty() && !something_built {
                return Err(functor_error(
                    &needs_building.iter().cloned().collect::<Vec<_>>().join(", "),
                    "Could not resolve Make order.",
                ));
            }
        }
        Ok(())
    }
}

fn parse_make_instruction(
    subject: &str,
    args: &AnnotationArgs,
) -> Result<(String, String, IndexMap<String, String>)> {
    let error = || {
        functor_error(
            subject,
            format!("Bad functor call (aka @Make instruction) for {subject}."),
        )
    };
    let applicant = args
        .get("1")
        .and_then(AnnotationValue::as_predicate)
        .ok_or_else(error)?;
    let record = match args.get("2") {
        Some(AnnotationValue::Record(record)) => record,
        _ => return Err(error()),
    };
    let mut args_map = IndexMap::new();
    for (slot, value) in record {
        let value = value.as_predicate().ok_or_else(error)?;
        args_map.insert(slot.clone(), value.to_string());
    }
    Ok((subject.to_string(), applicant.to_string(), args_map))
}

/// Applies all `@Make` instructions of the program, returning the extended
/// rule set. A program without functor calls is returned unchanged.
pub fn run_makes(rules: Vec<Rule>, annotations: &Annotations) -> Result<Vec<Rule>> {
    if annotations.make_instructions().is_empty() {
        return Ok(rules);
    }
    let mut functors = Functors::new(&rules);
    functors.make_all(annotations.make_instructions())?;
    Ok(functors.extended_rules)
}

/// The expression form `F` of a functor argument, used in tests and
/// diagnostics.
pub fn predicate_literal_name(expr: &Expression) -> Option<&str> {
    match &expr.kind {
        ExprKind::Literal(Literal::Predicate(name)) => Some(name),
        _ => None,
    }
}
