//! Arithmetic billing formulas over named variables.
//!
//! Grammar: `expr := term (('+' | '-') term)*`, `term := unary (('*' | '/') unary)*`,
//! `unary := '-' unary | atom`, `atom := number | ident | '(' expr ')'`.

use crate::error::FormulaError;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
}

/// A parsed formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| FormulaError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(FormulaError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(other) => Err(FormulaError::UnexpectedToken(format!("{:?}", other))),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some(other) => Err(FormulaError::UnexpectedToken(format!("{:?}", other))),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

fn collect_vars<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Var(name) => out.push(name),
        Expr::Neg(inner) => collect_vars(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_vars(lhs, out);
            collect_vars(rhs, out);
        }
    }
}

fn eval(expr: &Expr, vars: &HashMap<&str, f64>) -> Result<f64, FormulaError> {
    Ok(match expr {
        Expr::Number(n) => *n,
        Expr::Var(name) => *vars
            .get(name.as_str())
            .ok_or_else(|| FormulaError::UnknownVariable(name.clone()))?,
        Expr::Neg(inner) => -eval(inner, vars)?,
        Expr::Binary(op, lhs, rhs) => {
            let (a, b) = (eval(lhs, vars)?, eval(rhs, vars)?);
            match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                _ => a / b,
            }
        }
    })
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        // Template braces are accepted and ignored
        let cleaned = source.replace("{{", "").replace("}}", "");
        let cleaned = cleaned.trim();
        let mut parser = Parser {
            tokens: tokenize(cleaned)?,
            pos: 0,
        };
        let expr = parser.expr()?;
        if let Some(extra) = parser.next() {
            return Err(FormulaError::UnexpectedToken(format!("{:?}", extra)));
        }
        Ok(Self {
            source: cleaned.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fails on the first variable not in `known`
    pub fn check_variables(&self, known: &[&str]) -> Result<(), FormulaError> {
        let mut used = Vec::new();
        collect_vars(&self.expr, &mut used);
        match used.into_iter().find(|v| !known.contains(v)) {
            Some(unknown) => Err(FormulaError::UnknownVariable(unknown.to_string())),
            None => Ok(()),
        }
    }

    pub fn evaluate(&self, vars: &HashMap<&str, f64>) -> Result<f64, FormulaError> {
        eval(&self.expr, vars)
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, f64)]) -> HashMap<&'static str, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let f = Formula::parse("1 + 2 * 3").unwrap();
        assert_eq!(f.evaluate(&HashMap::new()).unwrap(), 7.0);

        let f = Formula::parse("(1 + 2) * 3").unwrap();
        assert_eq!(f.evaluate(&HashMap::new()).unwrap(), 9.0);

        let f = Formula::parse("-2 * -3 - 1").unwrap();
        assert_eq!(f.evaluate(&HashMap::new()).unwrap(), 5.0);

        let f = Formula::parse("24 / 2 / 3").unwrap();
        assert_eq!(f.evaluate(&HashMap::new()).unwrap(), 4.0);
    }

    #[test]
    fn test_variables_and_template_braces() {
        let f = Formula::parse("{{ electricity_tax * iva_tax * kwh_eur * kwh }}").unwrap();
        assert_eq!(f.source(), "electricity_tax * iva_tax * kwh_eur * kwh");
        let value = f
            .evaluate(&vars(&[
                ("electricity_tax", 1.0),
                ("iva_tax", 2.0),
                ("kwh_eur", 0.5),
                ("kwh", 3.0),
            ]))
            .unwrap();
        assert_eq!(value, 3.0);
    }

    #[test]
    fn test_unknown_variable() {
        let f = Formula::parse("kwh * price").unwrap();
        assert_eq!(
            f.check_variables(&["kwh"]),
            Err(FormulaError::UnknownVariable("price".to_string()))
        );
        assert!(matches!(
            f.evaluate(&vars(&[("kwh", 1.0)])),
            Err(FormulaError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(Formula::parse("1 +"), Err(FormulaError::UnexpectedEnd));
        assert!(matches!(
            Formula::parse("(1 + 2"),
            Err(FormulaError::UnexpectedEnd)
        ));
        assert!(matches!(
            Formula::parse("1 2"),
            Err(FormulaError::UnexpectedToken(_))
        ));
        assert_eq!(
            Formula::parse("kwh % 2"),
            Err(FormulaError::UnexpectedChar('%', 4))
        );
    }
}
