//! `neuros-kernel` – Symbolic Rule Engine
//!
//! Catches contradictions in retrieved evidence before the orchestrator
//! commits to an answer. It does not rank or retrieve; it derives and checks.
//!
//! # Modules
//!
//! - [`parser`] – rule notation: Horn clauses, `not` atoms, `!=`, integrity
//!   constraints and ground facts.
//! - [`program`] – the parsed [`Program`][program::Program] and its
//!   range-restriction check.
//! - [`stratify`] – predicate stratification; negation cycles are rejected
//!   with [`RuleCycle`][neuros_types::NeurosError::RuleCycle] at load time.
//! - [`rule_engine`] – [`RuleEngine`][rule_engine::RuleEngine]: stratum-by-stratum
//!   fixpoint evaluation and constraint verification.
//! - [`facts`] – ground [`Fact`][facts::Fact]s and the facts derived from a
//!   memory record's context.

pub mod facts;
pub mod parser;
pub mod program;
pub mod rule_engine;
pub mod stratify;

pub use facts::{Fact, FactSet, facts_from_record};
pub use parser::{parse_fact, parse_program};
pub use program::{Atom, Constraint, Literal, Program, Rule, Term};
pub use rule_engine::{DEFAULT_DISABLE_THRESHOLD, Evaluation, RuleEngine, Verification};
