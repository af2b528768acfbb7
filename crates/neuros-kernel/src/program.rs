//! Rule program representation.
//!
//! A [`Program`] is a set of ground facts, Horn-clause [`Rule`]s and
//! integrity [`Constraint`]s. Programs are built by the
//! [`parser`][crate::parser] and checked for range restriction by
//! [`Program::check_safety`] before the engine accepts them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use neuros_types::NeurosError;
use serde::{Deserialize, Serialize};

use crate::facts::Fact;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Var(String),
    Const(String),
}

impl Term {
    pub fn var(&self) -> Option<&str> {
        match self {
            Term::Var(v) => Some(v),
            Term::Const(_) => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(v) => f.write_str(v),
            Term::Const(c) => write!(f, "{c:?}"),
        }
    }
}

/// `predicate(arg, …)` with possibly non-ground arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub predicate: String,
    pub args: Vec<Term>,
}

impl Atom {
    fn vars(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(Term::var)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// One conjunct of a rule or constraint body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    Pos(Atom),
    /// `not p(…)`: negation as failure.
    Neg(Atom),
    /// `A != B`.
    Neq(Term, Term),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub head: Atom,
    pub body: Vec<Literal>,
}

/// `:- body.`: the body must never be satisfiable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub body: Vec<Literal>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub facts: Vec<Fact>,
    pub rules: Vec<Rule>,
    pub constraints: Vec<Constraint>,
}

fn positive_vars(body: &[Literal]) -> BTreeSet<&str> {
    body.iter()
        .filter_map(|l| match l {
            Literal::Pos(a) => Some(a.vars()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Every variable outside positive literals must be bound by one.
fn check_body(id: &str, body: &[Literal], extra: &[&str]) -> Result<(), NeurosError> {
    let bound = positive_vars(body);
    let mut needed: Vec<&str> = extra.to_vec();
    for lit in body {
        match lit {
            Literal::Pos(_) => {}
            Literal::Neg(a) => needed.extend(a.vars()),
            Literal::Neq(l, r) => needed.extend(l.var().into_iter().chain(r.var())),
        }
    }
    match needed.into_iter().find(|v| !bound.contains(v)) {
        Some(v) => Err(NeurosError::InvalidRule(format!(
            "{id}: variable {v} is not bound by a positive body atom"
        ))),
        None => Ok(()),
    }
}

impl Program {
    /// Merge `other` into `self`.
    pub fn extend(&mut self, other: Program) {
        self.facts.extend(other.facts);
        self.rules.extend(other.rules);
        self.constraints.extend(other.constraints);
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.id.as_str())
    }

    /// Range restriction, unique ids and consistent arities.
    pub fn check_safety(&self) -> Result<(), NeurosError> {
        let mut ids = BTreeSet::new();
        for id in self
            .rules
            .iter()
            .map(|r| &r.id)
            .chain(self.constraints.iter().map(|c| &c.id))
        {
            if !ids.insert(id.as_str()) {
                return Err(NeurosError::InvalidRule(format!("duplicate rule id {id}")));
            }
        }

        for rule in &self.rules {
            if !rule.body.iter().any(|l| matches!(l, Literal::Pos(_))) {
                return Err(NeurosError::InvalidRule(format!(
                    "{}: rule body needs at least one positive atom",
                    rule.id
                )));
            }
            let head_vars: Vec<&str> = rule.head.vars().collect();
            check_body(&rule.id, &rule.body, &head_vars)?;
        }
        for c in &self.constraints {
            if !c.body.iter().any(|l| matches!(l, Literal::Pos(_))) {
                return Err(NeurosError::InvalidRule(format!(
                    "{}: constraint body needs at least one positive atom",
                    c.id
                )));
            }
            check_body(&c.id, &c.body, &[])?;
        }

        let mut arity: BTreeMap<&str, usize> = BTreeMap::new();
        let atoms = self
            .rules
            .iter()
            .flat_map(|r| std::iter::once(&r.head).chain(body_atoms(&r.body)))
            .chain(self.constraints.iter().flat_map(|c| body_atoms(&c.body)));
        let signatures = atoms
            .map(|a| (a.predicate.as_str(), a.args.len()))
            .chain(self.facts.iter().map(|f| (f.predicate.as_str(), f.args.len())));
        for (pred, n) in signatures {
            match arity.insert(pred, n) {
                Some(prev) if prev != n => {
                    return Err(NeurosError::InvalidRule(format!(
                        "predicate {pred} used with arity {prev} and {n}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub(crate) fn body_atoms(body: &[Literal]) -> impl Iterator<Item = &Atom> {
    body.iter().filter_map(|l| match l {
        Literal::Pos(a) | Literal::Neg(a) => Some(a),
        Literal::Neq(..) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    #[test]
    fn unbound_head_variable_is_rejected() {
        let err = parse_program("p(X, Y) :- q(X).").unwrap_err();
        assert!(matches!(err, NeurosError::InvalidRule(m) if m.contains("variable Y")));
    }

    #[test]
    fn negated_variable_must_be_bound() {
        assert!(parse_program("p(X) :- q(X), not r(Y).").is_err());
        assert!(parse_program("p(X) :- q(X), not r(X).").is_ok());
    }

    #[test]
    fn inequality_variables_must_be_bound() {
        assert!(parse_program(":- q(A), A != B.").is_err());
        assert!(parse_program(":- q(A), q(B), A != B.").is_ok());
    }

    #[test]
    fn arity_must_be_consistent() {
        let err = parse_program("p(X) :- q(X). r(X) :- q(X, X).").unwrap_err();
        assert!(matches!(err, NeurosError::InvalidRule(m) if m.contains("arity")));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(parse_program("[a] p(X) :- q(X). [a] r(X) :- q(X).").is_err());
    }

    #[test]
    fn atom_display_quotes_constants() {
        let atom = Atom {
            predicate: "deadline".into(),
            args: vec![Term::Var("P".into()), Term::Const("Q1".into())],
        };
        assert_eq!(atom.to_string(), "deadline(P, \"Q1\")");
    }
}
