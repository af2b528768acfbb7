//! [`RuleEngine`] – stratified fixpoint evaluation and verification.
//!
//! A program is accepted only if it parses, is range-restricted and can be
//! stratified; otherwise [`RuleEngine::load`] fails and nothing is
//! evaluated. Evaluation computes the least fixed point of each stratum in
//! order, then checks every integrity constraint against the result.
//!
//! # Example
//!
//! ```
//! use neuros_kernel::{Fact, RuleEngine};
//! use neuros_types::VerificationOutcome;
//!
//! let engine = RuleEngine::load(
//!     "deadline_of(P, D) :- project(R, P), deadline(R, D).
//!      [one_deadline] :- deadline_of(P, A), deadline_of(P, B), A != B.",
//! )
//! .unwrap();
//!
//! let facts = vec![
//!     Fact::new("project", ["r1", "X"]),
//!     Fact::new("deadline", ["r1", "Q1"]),
//!     Fact::new("project", ["r2", "X"]),
//!     Fact::new("deadline", ["r2", "Q2"]),
//! ];
//! let v = engine.verify(facts, Vec::new(), |_| 1.0);
//! assert!(matches!(v.outcome, VerificationOutcome::Contradiction { .. }));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use neuros_types::{NeurosError, RuleFiring, VerificationOutcome};
use tracing::{debug, info};

use crate::facts::{Fact, FactSet};
use crate::parser::parse_program;
use crate::program::{Atom, Literal, Program, Term};
use crate::stratify::{Strata, constraint_support, stratify};

/// Rules whose learned confidence falls below this are not evaluated,
/// unless an integrity constraint depends on them.
pub const DEFAULT_DISABLE_THRESHOLD: f32 = 0.2;

type Bindings = BTreeMap<String, String>;

fn resolve<'a>(term: &'a Term, b: &'a Bindings) -> Option<&'a str> {
    match term {
        Term::Const(c) => Some(c.as_str()),
        Term::Var(v) => b.get(v).map(String::as_str),
    }
}

fn instantiate(atom: &Atom, b: &Bindings) -> Option<Vec<String>> {
    atom.args
        .iter()
        .map(|t| resolve(t, b).map(str::to_string))
        .collect()
}

fn unify(atom: &Atom, tuple: &[String], b: &Bindings) -> Option<Bindings> {
    if atom.args.len() != tuple.len() {
        return None;
    }
    let mut out = b.clone();
    for (term, value) in atom.args.iter().zip(tuple) {
        match term {
            Term::Const(c) if c != value => return None,
            Term::Const(_) => {}
            Term::Var(v) => match out.get(v) {
                Some(bound) if bound != value => return None,
                Some(_) => {}
                None => {
                    out.insert(v.clone(), value.clone());
                }
            },
        }
    }
    Some(out)
}

/// All bindings satisfying `body` against `facts`, in deterministic order.
fn solve(body: &[Literal], facts: &FactSet) -> Vec<Bindings> {
    let mut frontier = vec![Bindings::new()];
    for lit in body {
        let Literal::Pos(atom) = lit else {
            continue;
        };
        let mut next = Vec::new();
        for b in &frontier {
            for tuple in facts.tuples(&atom.predicate) {
                if let Some(extended) = unify(atom, tuple, b) {
                    next.push(extended);
                }
            }
        }
        frontier = next;
        if frontier.is_empty() {
            return frontier;
        }
    }
    frontier.retain(|b| {
        body.iter().all(|lit| match lit {
            Literal::Pos(_) => true,
            Literal::Neg(a) => {
                instantiate(a, b).is_none_or(|args| !facts.contains(&a.predicate, &args))
            }
            Literal::Neq(l, r) => resolve(l, b) != resolve(r, b),
        })
    });
    frontier
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Output of a fixpoint evaluation.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Input facts plus everything derived.
    pub facts: FactSet,
    /// Newly derived facts, in derivation order.
    pub derived: Vec<Fact>,
    /// Rules that derived at least one new fact, in program order.
    pub firings: Vec<RuleFiring>,
}

/// Output of [`RuleEngine::verify`].
#[derive(Debug, Clone)]
pub struct Verification {
    pub outcome: VerificationOutcome,
    pub firings: Vec<RuleFiring>,
    pub derived: Vec<Fact>,
    /// Lowest learned confidence among the rules that fired, or `1.0`.
    pub confidence: f32,
    /// Rules skipped because their confidence fell below the threshold.
    pub disabled: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// RuleEngine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RuleEngine {
    program: Program,
    strata: Strata,
    /// Ids of rules that feed a constraint; never disabled.
    guarded: BTreeSet<String>,
    disable_below: f32,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::empty()
    }
}

impl RuleEngine {
    /// An engine with no rules; every fact base is consistent.
    pub fn empty() -> Self {
        Self {
            program: Program::default(),
            strata: Strata::new(),
            guarded: BTreeSet::new(),
            disable_below: DEFAULT_DISABLE_THRESHOLD,
        }
    }

    /// Parse, check and stratify `source`.
    ///
    /// Fails with [`NeurosError::InvalidRule`] on syntax or safety errors and
    /// with [`NeurosError::RuleCycle`] when negation is not stratifiable.
    pub fn load(source: &str) -> Result<Self, NeurosError> {
        Self::from_program(parse_program(source)?)
    }

    pub fn from_program(program: Program) -> Result<Self, NeurosError> {
        program.check_safety()?;
        let strata = stratify(&program)?;
        let guarded: BTreeSet<String> = constraint_support(&program)
            .into_iter()
            .map(|i| program.rules[i].id.clone())
            .collect();
        info!(
            rules = program.rules.len(),
            constraints = program.constraints.len(),
            facts = program.facts.len(),
            strata = strata.len(),
            guarded = guarded.len(),
            "rule program loaded"
        );
        Ok(Self {
            program,
            strata,
            guarded,
            disable_below: DEFAULT_DISABLE_THRESHOLD,
        })
    }

    pub fn with_disable_threshold(mut self, threshold: f32) -> Self {
        self.disable_below = threshold;
        self
    }

    pub fn disable_threshold(&self) -> f32 {
        self.disable_below
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.program.rule_ids()
    }

    /// Whether an integrity constraint depends on rule `id`.
    pub fn is_guarded(&self, id: &str) -> bool {
        self.guarded.contains(id)
    }

    /// Least fixed point of `facts` under the enabled rules.
    pub fn evaluate(&self, facts: FactSet, enabled: impl Fn(&str) -> bool) -> Evaluation {
        let mut facts = facts;
        facts.extend(self.program.facts.iter().cloned());
        let mut derived = Vec::new();
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();

        for stratum in &self.strata {
            loop {
                let mut fresh: Vec<(usize, Fact)> = Vec::new();
                for &i in stratum {
                    let rule = &self.program.rules[i];
                    if !enabled(&rule.id) {
                        continue;
                    }
                    for b in solve(&rule.body, &facts) {
                        let Some(args) = instantiate(&rule.head, &b) else {
                            continue;
                        };
                        if !facts.contains(&rule.head.predicate, &args) {
                            fresh.push((i, Fact::new(rule.head.predicate.clone(), args)));
                        }
                    }
                }
                if fresh.is_empty() {
                    break;
                }
                for (i, fact) in fresh {
                    if facts.insert(fact.clone()) {
                        *counts.entry(i).or_insert(0) += 1;
                        derived.push(fact);
                    }
                }
            }
        }

        let firings = counts
            .into_iter()
            .map(|(i, derived)| RuleFiring {
                rule: self.program.rules[i].id.clone(),
                derived,
            })
            .collect();
        Evaluation {
            facts,
            derived,
            firings,
        }
    }

    /// First violated constraint, rendered with the facts that violate it.
    pub fn check_constraints(&self, facts: &FactSet) -> Option<String> {
        for c in &self.program.constraints {
            let Some(b) = solve(&c.body, facts).into_iter().next() else {
                continue;
            };
            let witnesses: Vec<String> = c
                .body
                .iter()
                .filter_map(|lit| match lit {
                    Literal::Pos(a) => instantiate(a, &b)
                        .map(|args| Fact::new(a.predicate.clone(), args).to_string()),
                    _ => None,
                })
                .collect();
            return Some(format!("{} violated by {}", c.id, witnesses.join(", ")));
        }
        None
    }

    /// Evaluate `base ∪ candidate` and check the hard constraints.
    ///
    /// `confidence` maps a rule id to its learned confidence; rules below
    /// the disable threshold are skipped unless a constraint depends on
    /// them. Constraints are always checked.
    pub fn verify(
        &self,
        base: impl IntoIterator<Item = Fact>,
        candidate: impl IntoIterator<Item = Fact>,
        confidence: impl Fn(&str) -> f32,
    ) -> Verification {
        let disabled: Vec<String> = self
            .rule_ids()
            .filter(|id| !self.is_guarded(id) && confidence(id) < self.disable_below)
            .map(str::to_string)
            .collect();
        let facts: FactSet = base.into_iter().chain(candidate).collect();
        let input = facts.len();

        let eval = self.evaluate(facts, |id| !disabled.iter().any(|d| d == id));
        let outcome = match self.check_constraints(&eval.facts) {
            Some(explanation) => VerificationOutcome::Contradiction { explanation },
            None => VerificationOutcome::Consistent,
        };
        let confidence = eval
            .firings
            .iter()
            .map(|f| confidence(&f.rule))
            .fold(1.0f32, f32::min);

        debug!(
            input_facts = input,
            derived = eval.derived.len(),
            fired = eval.firings.len(),
            disabled = disabled.len(),
            consistent = outcome.is_consistent(),
            "verification finished"
        );
        Verification {
            outcome,
            firings: eval.firings,
            derived: eval.derived,
            confidence,
            disabled,
        }
    }
}
