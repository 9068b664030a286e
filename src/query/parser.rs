//! Tokeniser and recursive-descent parser for the query language.

use crate::error::{GraphError, Result};
use crate::model::AttrValue;
use crate::query::ast::{CmpOp, Expr, Ordering, Query, ShowItem, TraversalStep};

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Num(f64),
    Int(i64),
    Punct(char),
    Op(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: u32,
    column: u32,
}

fn syntax_error(detail: impl Into<String>, token: &Token) -> GraphError {
    GraphError::QuerySyntax {
        detail: detail.into(),
        line: token.line,
        column: token.column,
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut line = 1u32;
    let mut column = 0u32;
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        column += 1;
        match c {
            '\n' => {
                line += 1;
                column = 0;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' => {
                tokens.push(Token {
                    kind: TokenKind::Punct(c),
                    line,
                    column,
                });
                chars.next();
            }
            '=' => {
                tokens.push(Token {
                    kind: TokenKind::Op("="),
                    line,
                    column,
                });
                chars.next();
            }
            '!' | '>' | '<' => {
                chars.next();
                let op = if chars.peek() == Some(&'=') {
                    chars.next();
                    column += 1;
                    match c {
                        '!' => "!=",
                        '>' => ">=",
                        _ => "<=",
                    }
                } else {
                    match c {
                        '>' => ">",
                        '<' => "<",
                        _ => {
                            return Err(GraphError::QuerySyntax {
                                detail: "unexpected character '!'".into(),
                                line,
                                column,
                            })
                        }
                    }
                };
                tokens.push(Token {
                    kind: TokenKind::Op(op),
                    line,
                    column,
                });
            }
            '\'' | '"' => {
                let quote = c;
                let start_column = column;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    column += 1;
                    if inner == quote {
                        closed = true;
                        break;
                    }
                    if inner == '\n' {
                        line += 1;
                        column = 0;
                    }
                    value.push(inner);
                }
                if !closed {
                    return Err(GraphError::QuerySyntax {
                        detail: "unterminated string literal".into(),
                        line,
                        column: start_column,
                    });
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    line,
                    column: start_column,
                });
            }
            c if c.is_alphanumeric() || c == '_' || c == ':' || c == '-' => {
                let start_column = column;
                let mut word = String::new();
                while let Some(&inner) = chars.peek() {
                    if inner.is_alphanumeric() || matches!(inner, '_' | ':' | '.' | '-') {
                        word.push(inner);
                        chars.next();
                    } else {
                        break;
                    }
                }
                column = start_column + word.chars().count() as u32 - 1;
                let kind = if let Ok(i) = word.parse::<i64>() {
                    TokenKind::Int(i)
                } else if let Ok(f) = word.parse::<f64>() {
                    TokenKind::Num(f)
                } else {
                    TokenKind::Ident(word)
                };
                tokens.push(Token {
                    kind,
                    line,
                    column: start_column,
                });
            }
            other => {
                return Err(GraphError::QuerySyntax {
                    detail: format!("unexpected character '{other}'"),
                    line,
                    column,
                })
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line,
        column: column + 1,
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        self.pos += 1;
        token
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current().kind, TokenKind::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(syntax_error(format!("expected '{keyword}'"), self.current()))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match &self.current().kind {
            TokenKind::Ident(word) => {
                let word = word.clone();
                self.pos += 1;
                Ok(word)
            }
            _ => Err(syntax_error(format!("expected {what}"), self.current())),
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        if self.current().kind == TokenKind::Punct(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax_error(format!("expected '{c}'"), self.current()))
        }
    }

    fn parse_query(&mut self) -> Result<Query> {
        self.expect_keyword("get")?;
        let kind = self.expect_ident("a node kind after 'get'")?;

        let mut query = Query {
            kind,
            where_clause: None,
            traversals: Vec::new(),
            primary: None,
            ordering: None,
            show: Vec::new(),
        };
        let mut open_traversals = 0usize;

        loop {
            if self.eat_keyword("where") {
                let expr = self.parse_expr()?;
                let slot = if open_traversals == 0 {
                    &mut query.where_clause
                } else {
                    &mut query
                        .traversals
                        .last_mut()
                        .expect("traversal open")
                        .where_clause
                };
                if slot.is_some() {
                    return Err(syntax_error(
                        "duplicate where clause",
                        self.current(),
                    ));
                }
                *slot = Some(expr);
            } else if self.eat_keyword("traverse") {
                let spec = self.expect_ident("a traversal spec")?;
                if spec.split(':').count() != 4 {
                    return Err(syntax_error(
                        format!("invalid traversal spec '{spec}'"),
                        self.current(),
                    ));
                }
                query.traversals.push(TraversalStep {
                    spec,
                    where_clause: None,
                });
                open_traversals += 1;
            } else if self.eat_keyword("end") {
                if open_traversals == 0 {
                    return Err(syntax_error("'end' without traversal", self.current()));
                }
                open_traversals -= 1;
            } else if self.eat_keyword("primary") {
                query.primary = Some(self.expect_ident("a kind after 'primary'")?);
            } else if self.eat_keyword("with") {
                self.expect_keyword("ordering")?;
                self.expect_punct('(')?;
                let ascending = if self.eat_keyword("ascending") {
                    true
                } else if self.eat_keyword("descending") {
                    false
                } else {
                    return Err(syntax_error(
                        "expected 'ascending' or 'descending'",
                        self.current(),
                    ));
                };
                let attr = self.expect_ident("an attribute to order by")?;
                self.expect_punct(')')?;
                query.ordering = Some(Ordering { ascending, attr });
            } else if self.eat_keyword("show") {
                loop {
                    let item = self.expect_ident("a column")?;
                    query.show.push(parse_show_item(&item));
                    if self.current().kind == TokenKind::Punct(',') {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            } else if self.current().kind == TokenKind::Eof {
                if open_traversals > 0 {
                    return Err(syntax_error(
                        "traversal is missing its 'end'",
                        self.current(),
                    ));
                }
                break;
            } else {
                return Err(syntax_error(
                    "expected a query clause",
                    self.current(),
                ));
            }
        }
        Ok(query)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let left = self.parse_value()?;
        let op = match &self.current().kind {
            TokenKind::Op("=") => Some(CmpOp::Eq),
            TokenKind::Op("!=") => Some(CmpOp::Ne),
            TokenKind::Op(">") => Some(CmpOp::Gt),
            TokenKind::Op(">=") => Some(CmpOp::Ge),
            TokenKind::Op("<") => Some(CmpOp::Lt),
            TokenKind::Op("<=") => Some(CmpOp::Le),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("contains") => {
                Some(CmpOp::Contains)
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("beginswith") => {
                Some(CmpOp::BeginsWith)
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("endswith") => {
                Some(CmpOp::EndsWith)
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("like") => Some(CmpOp::Like),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.parse_value()?;
                Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_value(&mut self) -> Result<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::Punct('(') => {
                let inner = self.parse_expr()?;
                self.expect_punct(')')?;
                Ok(inner)
            }
            TokenKind::Str(value) => Ok(Expr::Lit(AttrValue::Str(value))),
            TokenKind::Int(value) => Ok(Expr::Lit(AttrValue::Int(value))),
            TokenKind::Num(value) => Ok(Expr::Lit(AttrValue::Float(value))),
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("true") => {
                Ok(Expr::Lit(AttrValue::Bool(true)))
            }
            TokenKind::Ident(word) if word.eq_ignore_ascii_case("false") => {
                Ok(Expr::Lit(AttrValue::Bool(false)))
            }
            TokenKind::Ident(word) => Ok(Expr::Attr(word)),
            _ => Err(syntax_error("expected a value", &token)),
        }
    }
}

fn parse_show_item(item: &str) -> ShowItem {
    if let Some((pos, attr)) = item.split_once(':') {
        if let Ok(pos) = pos.parse::<usize>() {
            if pos >= 1 && !attr.is_empty() {
                return ShowItem {
                    pos: pos - 1,
                    attr: attr.to_string(),
                };
            }
        }
    }
    ShowItem {
        pos: 0,
        attr: item.to_string(),
    }
}

/// Parses the query text into its AST.
pub fn parse(text: &str) -> Result<Query> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_query()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_query() {
        let query = parse("get Song").expect("parse");
        assert_eq!(query.kind, "Song");
        assert!(query.where_clause.is_none());
        assert!(query.show.is_empty());
    }

    #[test]
    fn full_query_shape() {
        let query = parse(
            "get Song where name contains 'aria' and rating > 3 \
             traverse song:wrote:author:Author where key != 'anon' end \
             primary Author with ordering(ascending key) show key, name, 2:name",
        )
        .expect("parse");

        assert_eq!(query.kind, "Song");
        assert!(matches!(query.where_clause, Some(Expr::And(_, _))));
        assert_eq!(query.traversals.len(), 1);
        assert_eq!(query.traversals[0].spec, "song:wrote:author:Author");
        assert!(query.traversals[0].where_clause.is_some());
        assert_eq!(query.primary.as_deref(), Some("Author"));
        let ordering = query.ordering.expect("ordering");
        assert!(ordering.ascending);
        assert_eq!(ordering.attr, "key");
        assert_eq!(
            query.show,
            vec![
                ShowItem { pos: 0, attr: "key".into() },
                ShowItem { pos: 0, attr: "name".into() },
                ShowItem { pos: 1, attr: "name".into() },
            ]
        );
    }

    #[test]
    fn wildcard_spec_is_accepted() {
        let query = parse("get Song traverse ::: end").expect("parse");
        assert_eq!(query.traversals[0].spec, ":::");
    }

    #[test]
    fn syntax_errors_carry_position() {
        let err = parse("get Song where name @ 3").expect_err("bad character");
        match err {
            GraphError::QuerySyntax { line, column, .. } => {
                assert_eq!(line, 1);
                assert!(column > 0);
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert!(parse("get Song where").is_err());
        assert!(parse("get Song traverse bad:spec end").is_err());
        assert!(parse("get Song end").is_err());
    }

    #[test]
    fn unclosed_traversal_is_rejected() {
        assert!(parse("get Song traverse :::").is_err());
        assert!(parse("get Song traverse ::: where key = 'x' show key").is_err());
        assert!(parse("get Song traverse ::: traverse ::: end").is_err());
        assert!(parse("get Song traverse ::: end").is_ok());
    }

    #[test]
    fn numbers_and_strings() {
        let query = parse("get Song where rating >= 4.5 or name = \"x\"").expect("parse");
        let Some(Expr::Or(left, right)) = query.where_clause else {
            panic!("expected or");
        };
        assert!(matches!(
            *left,
            Expr::Cmp(CmpOp::Ge, _, ref rhs) if **rhs == Expr::Lit(AttrValue::Float(4.5))
        ));
        assert!(matches!(
            *right,
            Expr::Cmp(CmpOp::Eq, _, ref rhs) if **rhs == Expr::Lit(AttrValue::Str("x".into()))
        ));
    }
}
