//! Stratification.
//!
//! Assigns every derived predicate a stratum such that a rule's head sits at
//! or above each positive body predicate and strictly above each negated
//! one. If no such assignment exists the program has a cycle through
//! negation and is rejected before anything is evaluated.
//!
//! [`constraint_support`] walks the same dependency graph backwards from the
//! integrity constraints to find the rules they rely on.

use std::collections::{BTreeMap, BTreeSet};

use neuros_types::NeurosError;

use crate::program::{Literal, Program};

/// Rule indices grouped by stratum, lowest first.
pub type Strata = Vec<Vec<usize>>;

pub fn stratify(program: &Program) -> Result<Strata, NeurosError> {
    let mut stratum: BTreeMap<&str, usize> = BTreeMap::new();
    for rule in &program.rules {
        stratum.insert(rule.head.predicate.as_str(), 0);
    }
    // A legal assignment never needs more strata than there are predicates.
    let limit = stratum.len();

    loop {
        let mut changed = false;
        for rule in &program.rules {
            let head = rule.head.predicate.as_str();
            let mut required = stratum.get(head).copied().unwrap_or(0);
            for lit in &rule.body {
                let (pred, offset) = match lit {
                    Literal::Pos(a) => (a.predicate.as_str(), 0),
                    Literal::Neg(a) => (a.predicate.as_str(), 1),
                    Literal::Neq(..) => continue,
                };
                // Base predicates never appear in a head and sit below everything.
                let Some(&s) = stratum.get(pred) else {
                    continue;
                };
                required = required.max(s + offset);
            }
            if required > limit {
                return Err(NeurosError::RuleCycle(format!(
                    "rule {} makes {head} depend negatively on itself",
                    rule.id
                )));
            }
            if stratum.get(head) != Some(&required) {
                stratum.insert(head, required);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let depth = stratum.values().copied().max().map_or(0, |m| m + 1);
    let mut strata: Strata = vec![Vec::new(); depth];
    for (i, rule) in program.rules.iter().enumerate() {
        let s = stratum.get(rule.head.predicate.as_str()).copied().unwrap_or(0);
        strata[s].push(i);
    }
    strata.retain(|s| !s.is_empty());
    Ok(strata)
}

fn body_predicates(body: &[Literal]) -> impl Iterator<Item = &str> {
    body.iter().filter_map(|lit| match lit {
        Literal::Pos(a) | Literal::Neg(a) => Some(a.predicate.as_str()),
        Literal::Neq(..) => None,
    })
}

/// Indices of the rules some integrity constraint depends on, directly or
/// through other rules, positively or negatively.
pub fn constraint_support(program: &Program) -> BTreeSet<usize> {
    let mut needed: BTreeSet<&str> = program
        .constraints
        .iter()
        .flat_map(|c| body_predicates(&c.body))
        .collect();
    let mut support = BTreeSet::new();
    loop {
        let mut changed = false;
        for (i, rule) in program.rules.iter().enumerate() {
            if support.contains(&i) || !needed.contains(rule.head.predicate.as_str()) {
                continue;
            }
            support.insert(i);
            needed.extend(body_predicates(&rule.body));
            changed = true;
        }
        if !changed {
            return support;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    #[test]
    fn positive_recursion_is_one_stratum() {
        let p = parse_program(
            "reach(X, Y) :- edge(X, Y).
             reach(X, Z) :- reach(X, Y), edge(Y, Z).",
        )
        .unwrap();
        assert_eq!(stratify(&p).unwrap(), vec![vec![0, 1]]);
    }

    #[test]
    fn negation_pushes_head_up() {
        let p = parse_program(
            "blocked(T) :- task(T), not done(T).
             done(T) :- finished(T).
             urgent(T) :- blocked(T), flagged(T).",
        )
        .unwrap();
        // done < blocked <= urgent
        assert_eq!(stratify(&p).unwrap(), vec![vec![1], vec![0, 2]]);
    }

    #[test]
    fn negation_cycle_is_rejected() {
        let p = parse_program(
            "p(X) :- base(X), not q(X).
             q(X) :- base(X), not p(X).",
        )
        .unwrap();
        assert!(matches!(stratify(&p), Err(NeurosError::RuleCycle(_))));
    }

    #[test]
    fn self_negation_is_rejected() {
        let p = parse_program("p(X) :- base(X), not p(X).").unwrap();
        assert!(matches!(stratify(&p), Err(NeurosError::RuleCycle(_))));
    }

    #[test]
    fn constraint_support_follows_rule_chains() {
        let p = parse_program(
            "owner(R, P) :- project(R, P).
             deadline_of(P, D) :- owner(R, P), deadline(R, D).
             late(T) :- task(T), not done(T).
             done(T) :- finished(T).
             [one_deadline] :- deadline_of(P, A), deadline_of(P, B), A != B.",
        )
        .unwrap();
        assert_eq!(constraint_support(&p), BTreeSet::from([0, 1]));
    }

    #[test]
    fn negated_constraint_atoms_need_their_rules() {
        let p = parse_program(
            "done(T) :- finished(T).
             [unfinished] :- task(T), not done(T), urgent(T).",
        )
        .unwrap();
        assert_eq!(constraint_support(&p), BTreeSet::from([0]));
    }

    #[test]
    fn empty_program_has_no_strata() {
        assert!(stratify(&Program::default()).unwrap().is_empty());
    }
}
