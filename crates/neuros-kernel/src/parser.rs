//! Rule notation parser.
//!
//! ```text
//! % comment                                   (also `#`)
//! project_of(R, P) :- project(R, P).          rule
//! [one_deadline] :- deadline_of(P, A),        labelled constraint
//!                   deadline_of(P, B), A != B.
//! blocked(T) :- task(T), not done(T).         negation as failure
//! owner(r1, "Alice").                         ground fact
//! ```
//!
//! In rules and constraints, identifiers starting with an uppercase letter
//! or `_` are variables; lowercase identifiers, numbers and quoted strings
//! are constants. [`parse_fact`] reads a single ground fact, where every
//! bare identifier is a constant, so `deadline(X, Q1)` is accepted there.
//!
//! Unlabelled statements get positional ids `rule_N` / `constraint_N`.

use neuros_types::NeurosError;

use crate::facts::Fact;
use crate::program::{Atom, Constraint, Literal, Program, Rule, Term};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Implies,
    Neq,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn invalid(line: usize, msg: impl std::fmt::Display) -> NeurosError {
    NeurosError::InvalidRule(format!("line {line}: {msg}"))
}

fn tokenize(src: &str) -> Result<Vec<Token>, NeurosError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        let tok = match c {
            '\n' => {
                line += 1;
                chars.next();
                continue;
            }
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '%' | '#' => {
                while chars.next_if(|&c| c != '\n').is_some() {}
                continue;
            }
            '(' | ')' | '[' | ']' | ',' | '.' => {
                chars.next();
                match c {
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ',' => Tok::Comma,
                    _ => Tok::Dot,
                }
            }
            ':' => {
                chars.next();
                if chars.next_if_eq(&'-').is_none() {
                    return Err(invalid(line, "expected `:-`"));
                }
                Tok::Implies
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(invalid(line, "expected `!=`"));
                }
                Tok::Neq
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => s.push(escaped),
                            None => return Err(invalid(line, "unterminated string")),
                        },
                        Some('\n') | None => return Err(invalid(line, "unterminated string")),
                        Some(ch) => s.push(ch),
                    }
                }
                Tok::Str(s)
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    s.push(d);
                }
                if s == "-" {
                    return Err(invalid(line, "expected a number after `-`"));
                }
                // A dot is a decimal point only when a digit follows it.
                let mut lookahead = chars.clone();
                if lookahead.next() == Some('.') && lookahead.peek().is_some_and(char::is_ascii_digit) {
                    chars.next();
                    s.push('.');
                    while let Some(d) = chars.next_if(char::is_ascii_digit) {
                        s.push(d);
                    }
                }
                Tok::Num(s)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                    s.push(ch);
                }
                Tok::Ident(s)
            }
            other => return Err(invalid(line, format!("unexpected character {other:?}"))),
        };
        tokens.push(Token { tok, line });
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Bare identifiers are constants (fact mode).
    ground: bool,
}

impl Parser {
    fn new(src: &str, ground: bool) -> Result<Self, NeurosError> {
        Ok(Self {
            tokens: tokenize(src)?,
            pos: 0,
            ground,
        })
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Tok) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Tok, what: &str) -> Result<(), NeurosError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, what: &str) -> NeurosError {
        match self.peek() {
            Some(tok) => invalid(self.line(), format!("expected {what}, found {tok:?}")),
            None => invalid(self.line(), format!("expected {what}, found end of input")),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, NeurosError> {
        match self.peek() {
            Some(Tok::Ident(_)) => match self.next() {
                Some(Tok::Ident(s)) => Ok(s),
                _ => Err(self.unexpected(what)),
            },
            _ => Err(self.unexpected(what)),
        }
    }

    fn term(&mut self) -> Result<Term, NeurosError> {
        match self.peek() {
            Some(Tok::Ident(_) | Tok::Str(_) | Tok::Num(_)) => {}
            _ => return Err(self.unexpected("a term")),
        }
        Ok(match self.next() {
            Some(Tok::Ident(s)) => {
                let is_var = s.starts_with(|c: char| c.is_uppercase() || c == '_');
                if is_var && !self.ground {
                    Term::Var(s)
                } else {
                    Term::Const(s)
                }
            }
            Some(Tok::Str(s) | Tok::Num(s)) => Term::Const(s),
            _ => return Err(self.unexpected("a term")),
        })
    }

    fn atom(&mut self) -> Result<Atom, NeurosError> {
        let predicate = self.ident("a predicate name")?;
        self.expect(Tok::LParen, "`(`")?;
        let mut args = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                args.push(self.term()?);
                if self.eat(&Tok::RParen) {
                    break;
                }
                self.expect(Tok::Comma, "`,` or `)`")?;
            }
        }
        Ok(Atom { predicate, args })
    }

    fn literal(&mut self) -> Result<Literal, NeurosError> {
        let is_negation = matches!(self.peek(), Some(Tok::Ident(s)) if s == "not")
            && matches!(self.peek_at(1), Some(Tok::Ident(_)));
        if is_negation {
            self.pos += 1;
            return Ok(Literal::Neg(self.atom()?));
        }
        let is_atom = matches!(self.peek(), Some(Tok::Ident(_)))
            && matches!(self.peek_at(1), Some(Tok::LParen));
        if is_atom {
            return Ok(Literal::Pos(self.atom()?));
        }
        let lhs = self.term()?;
        self.expect(Tok::Neq, "`!=`")?;
        let rhs = self.term()?;
        Ok(Literal::Neq(lhs, rhs))
    }

    /// Body literals up to and including the closing `.`.
    fn body(&mut self) -> Result<Vec<Literal>, NeurosError> {
        let mut body = vec![self.literal()?];
        while self.eat(&Tok::Comma) {
            body.push(self.literal()?);
        }
        self.expect(Tok::Dot, "`,` or `.`")?;
        Ok(body)
    }

    fn statement(&mut self, program: &mut Program) -> Result<(), NeurosError> {
        let label = if self.eat(&Tok::LBracket) {
            let id = self.ident("a rule id")?;
            self.expect(Tok::RBracket, "`]`")?;
            Some(id)
        } else {
            None
        };

        if self.eat(&Tok::Implies) {
            let body = self.body()?;
            let id = label.unwrap_or_else(|| format!("constraint_{}", program.constraints.len() + 1));
            program.constraints.push(Constraint { id, body });
            return Ok(());
        }

        let line = self.line();
        let head = self.atom()?;
        if self.eat(&Tok::Dot) {
            program.facts.push(ground(head).ok_or_else(|| invalid(line, "facts must be ground"))?);
            return Ok(());
        }
        self.expect(Tok::Implies, "`:-` or `.`")?;
        let body = self.body()?;
        let id = label.unwrap_or_else(|| format!("rule_{}", program.rules.len() + 1));
        program.rules.push(Rule { id, head, body });
        Ok(())
    }
}

fn ground(atom: Atom) -> Option<Fact> {
    let args = atom
        .args
        .into_iter()
        .map(|t| match t {
            Term::Const(c) => Some(c),
            Term::Var(_) => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Fact {
        predicate: atom.predicate,
        args,
    })
}

/// Parse a rule program and check it for range restriction.
pub fn parse_program(src: &str) -> Result<Program, NeurosError> {
    let mut parser = Parser::new(src, false)?;
    let mut program = Program::default();
    while !parser.at_end() {
        parser.statement(&mut program)?;
    }
    program.check_safety()?;
    Ok(program)
}

/// Parse one ground fact; the trailing `.` is optional.
pub fn parse_fact(src: &str) -> Result<Fact, NeurosError> {
    let mut parser = Parser::new(src, true)?;
    let line = parser.line();
    let atom = parser.atom()?;
    parser.eat(&Tok::Dot);
    if !parser.at_end() {
        return Err(parser.unexpected("end of fact"));
    }
    ground(atom).ok_or_else(|| invalid(line, "facts must be ground"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_constraints_and_facts() {
        let program = parse_program(
            r#"
            % projects and their deadlines
            deadline_of(P, D) :- project(R, P), deadline(R, D).
            [one_deadline] :- deadline_of(P, A), deadline_of(P, B), A != B.
            owner(r1, "Alice Smith").
            "#,
        )
        .unwrap();

        assert_eq!(program.rules.len(), 1);
        assert_eq!(program.rules[0].id, "rule_1");
        assert_eq!(program.rules[0].body.len(), 2);
        assert_eq!(program.constraints[0].id, "one_deadline");
        assert!(matches!(program.constraints[0].body[2], Literal::Neq(..)));
        assert_eq!(program.facts, vec![Fact::new("owner", ["r1", "Alice Smith"])]);
    }

    #[test]
    fn variables_and_constants_are_distinguished() {
        let program = parse_program("p(X) :- q(X, abc, \"Q\", 42, _Y).").unwrap();
        let Literal::Pos(atom) = &program.rules[0].body[0] else {
            panic!("expected positive atom");
        };
        assert_eq!(
            atom.args,
            vec![
                Term::Var("X".into()),
                Term::Const("abc".into()),
                Term::Const("Q".into()),
                Term::Const("42".into()),
                Term::Var("_Y".into()),
            ]
        );
    }

    #[test]
    fn negation_is_parsed() {
        let program = parse_program("blocked(T) :- task(T), not done(T).").unwrap();
        assert!(matches!(program.rules[0].body[1], Literal::Neg(_)));
    }

    #[test]
    fn decimal_numbers_do_not_swallow_the_terminator() {
        let program = parse_program("w(1.5). v(2).").unwrap();
        assert_eq!(
            program.facts,
            vec![Fact::new("w", ["1.5"]), Fact::new("v", ["2"])]
        );
    }

    #[test]
    fn fact_mode_treats_identifiers_as_constants() {
        assert_eq!(
            parse_fact("deadline(X, Q1)").unwrap(),
            Fact::new("deadline", ["X", "Q1"])
        );
        assert_eq!(parse_fact("p(a).").unwrap(), Fact::new("p", ["a"]));
        assert!(parse_fact("p(a) q(b)").is_err());
    }

    #[test]
    fn syntax_errors_report_the_line() {
        let err = parse_program("p(X) :- q(X).\nr(X) :- q(X)").unwrap_err();
        assert!(matches!(err, NeurosError::InvalidRule(m) if m.starts_with("line 2")));
        assert!(parse_program("p(X) : q(X).").is_err());
    }

    #[test]
    fn non_ground_program_fact_is_rejected() {
        assert!(parse_program("p(X).").is_err());
    }
}
