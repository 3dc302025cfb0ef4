//! Tokenizer and recursive-descent parser for formula text.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! comparison := concat (("=" | "!=" | "<>" | "<" | "<=" | ">" | ">=") concat)*
//! concat     := additive ("&" additive)*
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/" | "%") unary)*
//! unary      := "-" unary | primary
//! primary    := number | string | TRUE | FALSE | {fieldId} | NAME "(" args ")" | "(" comparison ")"
//! ```

use crate::id::FieldId;
use crate::value::CellValue;

use super::{BinaryOp, Expr, FormulaError, Function, UnaryOp};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    FieldRef(FieldId),
    Ident(String),
    Op(BinaryOp),
    Minus,
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("\"{s}\""),
            Token::FieldRef(id) => format!("{{{id}}}"),
            Token::Ident(name) => name.clone(),
            Token::Op(op) => op.symbol().to_string(),
            Token::Minus => "-".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Comma => ",".to_string(),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, ch) = chars[i];
        match ch {
            c if c.is_whitespace() => {
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let n: f64 = text.parse().map_err(|_| FormulaError::UnexpectedToken {
                    offset,
                    found: text.clone(),
                })?;
                tokens.push((offset, Token::Number(n)));
            }
            '"' | '\'' => {
                let quote = ch;
                i += 1;
                let mut text = String::new();
                loop {
                    let Some(&(_, c)) = chars.get(i) else {
                        return Err(FormulaError::UnterminatedString { offset });
                    };
                    i += 1;
                    if c == quote {
                        break;
                    }
                    if c == '\\' {
                        if let Some(&(_, escaped)) = chars.get(i) {
                            text.push(escaped);
                            i += 1;
                            continue;
                        }
                    }
                    text.push(c);
                }
                tokens.push((offset, Token::Str(text)));
            }
            '{' => {
                let start = i + 1;
                while i < chars.len() && chars[i].1 != '}' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(FormulaError::UnexpectedEnd);
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                i += 1;
                let id = FieldId::parse(text.trim())
                    .map_err(|_| FormulaError::InvalidFieldRef { text: text.clone() })?;
                tokens.push((offset, Token::FieldRef(id)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push((offset, Token::Ident(text)));
            }
            _ => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (token, width) = match (ch, next) {
                    ('!', Some('=')) => (Token::Op(BinaryOp::NotEq), 2),
                    ('<', Some('>')) => (Token::Op(BinaryOp::NotEq), 2),
                    ('<', Some('=')) => (Token::Op(BinaryOp::LtEq), 2),
                    ('>', Some('=')) => (Token::Op(BinaryOp::GtEq), 2),
                    ('<', _) => (Token::Op(BinaryOp::Lt), 1),
                    ('>', _) => (Token::Op(BinaryOp::Gt), 1),
                    ('=', _) => (Token::Op(BinaryOp::Eq), 1),
                    ('&', _) => (Token::Op(BinaryOp::Concat), 1),
                    ('+', _) => (Token::Op(BinaryOp::Add), 1),
                    ('-', _) => (Token::Minus, 1),
                    ('*', _) => (Token::Op(BinaryOp::Mul), 1),
                    ('/', _) => (Token::Op(BinaryOp::Div), 1),
                    ('%', _) => (Token::Op(BinaryOp::Mod), 1),
                    ('(', _) => (Token::LParen, 1),
                    (')', _) => (Token::RParen, 1),
                    (',', _) => (Token::Comma, 1),
                    _ => return Err(FormulaError::UnexpectedChar { offset, ch }),
                };
                tokens.push((offset, token));
                i += width;
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn expect(&mut self, wanted: Token) -> Result<(), FormulaError> {
        match self.next() {
            Some((_, t)) if t == wanted => Ok(()),
            Some((offset, t)) => Err(FormulaError::UnexpectedToken {
                offset,
                found: t.describe(),
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn peek_binary(&self, allowed: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op(op)) if allowed.contains(op) => Some(*op),
            Some(Token::Minus) if allowed.contains(&BinaryOp::Sub) => Some(BinaryOp::Sub),
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        allowed: &[BinaryOp],
        next: fn(&mut Parser) -> Result<Expr, FormulaError>,
    ) -> Result<Expr, FormulaError> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_binary(allowed) {
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(
            &[
                BinaryOp::Eq,
                BinaryOp::NotEq,
                BinaryOp::Lt,
                BinaryOp::LtEq,
                BinaryOp::Gt,
                BinaryOp::GtEq,
            ],
            Parser::concat,
        )
    }

    fn concat(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(&[BinaryOp::Concat], Parser::additive)
    }

    fn additive(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(&[BinaryOp::Add, BinaryOp::Sub], Parser::term)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        self.binary_level(&[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod], Parser::unary)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let (offset, token) = self.next().ok_or(FormulaError::UnexpectedEnd)?;
        match token {
            Token::Number(n) => Ok(Expr::Literal(CellValue::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(CellValue::Text(s))),
            Token::FieldRef(id) => Ok(Expr::Field(id)),
            Token::LParen => {
                let inner = self.comparison()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if !matches!(self.peek(), Some(Token::LParen)) {
                    return match name.to_ascii_uppercase().as_str() {
                        "TRUE" => Ok(Expr::Literal(CellValue::Bool(true))),
                        "FALSE" => Ok(Expr::Literal(CellValue::Bool(false))),
                        _ => Err(FormulaError::UnexpectedToken { offset, found: name }),
                    };
                }
                let function = Function::from_name(&name)
                    .ok_or_else(|| FormulaError::UnknownFunction { name: name.clone() })?;
                self.pos += 1;
                let mut args = Vec::new();
                if !matches!(self.peek(), Some(Token::RParen)) {
                    loop {
                        args.push(self.comparison()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                function.check_arity(args.len())?;
                Ok(Expr::Call { function, args })
            }
            other => Err(FormulaError::UnexpectedToken {
                offset,
                found: other.describe(),
            }),
        }
    }
}

/// Parses formula text into an expression tree.
pub fn parse(src: &str) -> Result<Expr, FormulaError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.comparison()?;
    if let Some((offset, token)) = parser.next() {
        return Err(FormulaError::UnexpectedToken {
            offset,
            found: token.describe(),
        });
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "fldAAAAAAAAAAAAAAAA";

    fn field(id: &str) -> Expr {
        Expr::Field(FieldId::parse(id).unwrap())
    }

    #[test]
    fn precedence_multiplication_binds_tighter() {
        let expr = parse(&format!("{{{A}}} + 1 * 2")).unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(field(A)),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    left: Box::new(Expr::Literal(CellValue::Number(1.0))),
                    right: Box::new(Expr::Literal(CellValue::Number(2.0))),
                }),
            }
        );
    }

    #[test]
    fn parentheses_and_unary_minus() {
        let expr = parse("-(1 - 2)").unwrap();
        assert!(matches!(expr, Expr::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn function_calls_check_arity() {
        assert!(parse("IF(TRUE, 1, 2)").is_ok());
        assert!(matches!(
            parse("IF(TRUE)"),
            Err(FormulaError::Arity { function: "IF", .. })
        ));
        assert!(matches!(
            parse("FOO(1)"),
            Err(FormulaError::UnknownFunction { .. })
        ));
        assert!(parse("BLANK()").is_ok());
    }

    #[test]
    fn malformed_field_reference_is_rejected() {
        assert!(matches!(
            parse("{not-a-field} + 1"),
            Err(FormulaError::InvalidFieldRef { .. })
        ));
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(matches!(
            parse("1 2"),
            Err(FormulaError::UnexpectedToken { offset: 2, .. })
        ));
        assert_eq!(parse("1 +"), Err(FormulaError::UnexpectedEnd));
        assert!(matches!(
            parse("'abc"),
            Err(FormulaError::UnterminatedString { offset: 0 })
        ));
    }

    #[test]
    fn comparison_operators() {
        for src in ["1 = 1", "1 != 2", "1 <> 2", "1 <= 2", "1 >= 2", "1 < 2", "1 > 2"] {
            assert!(matches!(parse(src).unwrap(), Expr::Binary { op, .. } if op.is_comparison()));
        }
    }
}
