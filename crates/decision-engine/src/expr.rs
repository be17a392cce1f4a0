use std::collections::BTreeSet;
use std::fmt;

use trading_core::KtrdrError;

/// Comparison operators allowed in rule expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// Parsed rule expression. There is no arbitrary code here: identifiers,
/// numeric literals, comparisons and boolean connectives only.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Ident(String),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Every identifier referenced anywhere in the expression.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Ident(name) => {
                out.insert(name.clone());
            }
            Expr::Cmp { lhs, rhs, .. } => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            }
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.collect_identifiers(out);
                b.collect_identifiers(out);
            }
            Expr::Not(inner) => inner.collect_identifiers(out),
        }
    }

    /// Boolean evaluation against a column lookup. Comparisons with an
    /// undefined (NaN) operand are false, so warm-up rows never fire.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> f64) -> bool {
        match self {
            Expr::Cmp { op, lhs, rhs } => {
                let l = lhs.eval_num(lookup);
                let r = rhs.eval_num(lookup);
                if l.is_nan() || r.is_nan() {
                    return false;
                }
                match op {
                    CmpOp::Lt => l < r,
                    CmpOp::Le => l <= r,
                    CmpOp::Gt => l > r,
                    CmpOp::Ge => l >= r,
                    CmpOp::Eq => l == r,
                    CmpOp::Ne => l != r,
                }
            }
            Expr::And(a, b) => a.eval(lookup) && b.eval(lookup),
            Expr::Or(a, b) => a.eval(lookup) || b.eval(lookup),
            Expr::Not(inner) => !inner.eval(lookup),
            // A bare identifier or number is not a predicate; the parser
            // rejects these at the top level.
            Expr::Num(_) | Expr::Ident(_) => false,
        }
    }

    fn eval_num(&self, lookup: &dyn Fn(&str) -> f64) -> f64 {
        match self {
            Expr::Num(v) => *v,
            Expr::Ident(name) => lookup(name),
            _ => f64::NAN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str, path: &str) -> Result<Vec<Token>, KtrdrError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let two = i + 1 < bytes.len() && bytes[i + 1] as char == '=';
                let op = match (c, two) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    _ => {
                        return Err(KtrdrError::config(
                            path,
                            format!("unexpected character '{c}' at offset {i}"),
                        ))
                    }
                };
                tokens.push(Token::Op(op));
                i += if two { 2 } else { 1 };
            }
            _ if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] as char == '.')
                {
                    i += 1;
                }
                let text = &input[start..i];
                let value: f64 = text.parse().map_err(|_| {
                    KtrdrError::config(path, format!("invalid number '{text}'"))
                })?;
                tokens.push(Token::Num(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => {
                return Err(KtrdrError::config(
                    path,
                    format!("unexpected character '{other}' at offset {i}"),
                ))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    path: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> KtrdrError {
        KtrdrError::config(self.path, message)
    }

    fn parse_or(&mut self) -> Result<Expr, KtrdrError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, KtrdrError> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, KtrdrError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, KtrdrError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.next();
            let inner = self.parse_or()?;
            match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(self.error("missing closing parenthesis")),
            }
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, KtrdrError> {
        let lhs = self.parse_term()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(self.error(format!(
                    "expected a comparison operator, got {other:?}"
                )))
            }
        };
        let rhs = self.parse_term()?;
        Ok(Expr::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_term(&mut self) -> Result<Expr, KtrdrError> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            other => Err(self.error(format!("expected a value or column name, got {other:?}"))),
        }
    }
}

/// Parse one rule expression. `path` identifies the rule in config error
/// messages (e.g. `rules.entry[0]`).
pub fn parse(input: &str, path: &str) -> Result<Expr, KtrdrError> {
    let tokens = tokenize(input, path)?;
    if tokens.is_empty() {
        return Err(KtrdrError::config(path, "empty rule expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        path,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing tokens after expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup_from(pairs: &[(&str, f64)]) -> impl Fn(&str) -> f64 {
        let map: BTreeMap<String, f64> =
            pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        move |name: &str| map.get(name).copied().unwrap_or(f64::NAN)
    }

    #[test]
    fn parses_and_evaluates_comparisons() {
        let expr = parse("rsi < 30", "rules.entry[0]").unwrap();
        let lookup = lookup_from(&[("rsi", 25.0)]);
        assert!(expr.eval(&lookup));
        let lookup = lookup_from(&[("rsi", 55.0)]);
        assert!(!expr.eval(&lookup));
    }

    #[test]
    fn boolean_connectives_and_precedence() {
        // and binds tighter than or.
        let expr = parse("a > 1 or b > 1 and c > 1", "r").unwrap();
        let hit = lookup_from(&[("a", 2.0), ("b", 0.0), ("c", 0.0)]);
        assert!(expr.eval(&hit));
        let miss = lookup_from(&[("a", 0.0), ("b", 2.0), ("c", 0.0)]);
        assert!(!expr.eval(&miss));
    }

    #[test]
    fn parentheses_and_not() {
        let expr = parse("not (rsi_low > 0.5 or rsi_high > 0.5)", "r").unwrap();
        let lookup = lookup_from(&[("rsi_low", 0.2), ("rsi_high", 0.1)]);
        assert!(expr.eval(&lookup));
        let lookup = lookup_from(&[("rsi_low", 0.9), ("rsi_high", 0.1)]);
        assert!(!expr.eval(&lookup));
    }

    #[test]
    fn dotted_identifiers_parse() {
        let expr = parse("macd.line > macd.signal", "r").unwrap();
        assert!(expr.identifiers().contains("macd.line"));
        let lookup = lookup_from(&[("macd.line", 1.0), ("macd.signal", 0.5)]);
        assert!(expr.eval(&lookup));
    }

    #[test]
    fn nan_operands_never_fire() {
        let expr = parse("sma > 0", "r").unwrap();
        let lookup = |_: &str| f64::NAN;
        assert!(!expr.eval(&lookup));
        // Negation of an undefined comparison does fire; rules over
        // warm-up data should guard with the column itself.
        let expr = parse("not sma > 0", "r").unwrap();
        assert!(expr.eval(&lookup));
    }

    #[test]
    fn syntax_errors_name_the_rule() {
        let err = parse("rsi <", "rules.entry[2]").unwrap_err();
        assert!(err.to_string().contains("rules.entry[2]"), "{err}");
        assert!(parse("rsi ** 2", "r").is_err());
        assert!(parse("", "r").is_err());
        assert!(parse("(rsi > 1", "r").is_err());
        assert!(parse("rsi > 1 banana", "r").is_err());
    }
}
