//! Recursive-descent parser for the closed expression grammar.
//!
//! Precedence, lowest first: `OR`/`||`, `AND`/`&&`, `NOT`/`!`, comparison
//! (`= != < <= > >= IS IN BETWEEN LIKE`), additive, multiplicative, unary
//! minus, primary.

use super::ast::{
    AggregateFunction, BinaryOp, Expr, OrderKey, UnaryOp, WindowFunction, WindowSpec,
};
use super::functions::ScalarFunction;
use super::lexer::{Lexer, Spanned, Token};
use crate::core::Value;
use crate::errors::ExpressionError;

const RESERVED: &[&str] = &[
    "AND", "OR", "NOT", "WHEN", "THEN", "ELSE", "END", "IS", "IN", "LIKE", "BETWEEN",
];

/// Parses expression text into an AST.
///
/// # Errors
///
/// Returns a syntax error, or `UnknownFunction` for calls outside the
/// allow-list.
pub fn parse_expression(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(input).tokenize()?;
    Parser::new(tokens).parse()
}

/// Parser state over a token buffer.
pub struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    next_slot: usize,
}

impl Parser {
    /// Creates a parser over tokens produced by [`Lexer::tokenize`].
    #[must_use]
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            index: 0,
            next_slot: 0,
        }
    }

    /// Parses a complete expression, requiring all input to be consumed.
    ///
    /// # Errors
    ///
    /// Returns a syntax error on trailing or malformed input.
    pub fn parse(mut self) -> Result<Expr, ExpressionError> {
        if self.check(&Token::Eof) {
            return Err(ExpressionError::syntax(0, "empty expression"));
        }
        let expr = self.parse_or()?;
        if !self.check(&Token::Eof) {
            return Err(self.unexpected("end of expression"));
        }
        Ok(expr)
    }

    fn current(&self) -> &Token {
        self.tokens
            .get(self.index)
            .map_or(&Token::Eof, |spanned| &spanned.token)
    }

    fn peek(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.index + offset)
            .map_or(&Token::Eof, |spanned| &spanned.token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map_or(0, |spanned| spanned.position)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.current() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.current().is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExpressionError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ExpressionError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    fn unexpected(&self, expected: &str) -> ExpressionError {
        ExpressionError::syntax(
            self.position(),
            format!("expected {expected}, found {:?}", self.current()),
        )
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) || self.eat_keyword("OR") {
            let right = self.parse_and()?;
            left = Self::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::AndAnd) || self.eat_keyword("AND") {
            let right = self.parse_not()?;
            left = Self::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Bang) || self.eat_keyword("NOT") {
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        match self.current() {
            Token::Eq => Some(BinaryOp::Eq),
            Token::NotEq => Some(BinaryOp::NotEq),
            Token::Lt => Some(BinaryOp::Lt),
            Token::LtEq => Some(BinaryOp::LtEq),
            Token::Gt => Some(BinaryOp::Gt),
            Token::GtEq => Some(BinaryOp::GtEq),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;

        loop {
            if let Some(op) = self.comparison_op() {
                self.advance();
                let right = self.parse_additive()?;
                left = Self::binary(op, left, right);
                continue;
            }

            if self.eat_keyword("IS") {
                let negated = self.eat_keyword("NOT");
                self.expect_keyword("NULL")?;
                left = Expr::IsNull {
                    expr: Box::new(left),
                    negated,
                };
                continue;
            }

            let negated = self.current().is_keyword("NOT")
                && ["IN", "BETWEEN", "LIKE"]
                    .iter()
                    .any(|kw| self.peek(1).is_keyword(kw));
            if negated {
                self.advance();
            }

            if self.eat_keyword("IN") {
                self.expect(&Token::LParen, "'(' after IN")?;
                let list = self.parse_list(&Token::RParen)?;
                left = Expr::InList {
                    expr: Box::new(left),
                    list,
                    negated,
                };
            } else if self.eat_keyword("BETWEEN") {
                let low = self.parse_additive()?;
                self.expect_keyword("AND")?;
                let high = self.parse_additive()?;
                left = Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                };
            } else if self.eat_keyword("LIKE") {
                let pattern = self.parse_additive()?;
                left = Expr::Like {
                    expr: Box::new(left),
                    pattern: Box::new(pattern),
                    negated,
                };
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Minus) {
            let expr = self.parse_unary()?;
            return Ok(match expr {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                Expr::Literal(Value::Float(f)) => Expr::Literal(Value::Float(-f)),
                other => Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(other),
                },
            });
        }
        if self.eat(&Token::Plus) {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Token::Integer(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::String(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Param(name) => Ok(Expr::Param(name)),
            Token::QuotedIdent(name) => Ok(Expr::Field(name)),
            Token::LParen => {
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::Ident(name) => {
                let upper = name.to_ascii_uppercase();
                match upper.as_str() {
                    "NULL" => return Ok(Expr::Literal(Value::Null)),
                    "TRUE" => return Ok(Expr::Literal(Value::Bool(true))),
                    "FALSE" => return Ok(Expr::Literal(Value::Bool(false))),
                    "CASE" => return self.parse_case(),
                    _ => {}
                }
                if self.check(&Token::LParen) {
                    return self.parse_call(&name, position);
                }
                if RESERVED.contains(&upper.as_str()) {
                    return Err(ExpressionError::syntax(
                        position,
                        format!("unexpected keyword {upper}"),
                    ));
                }
                Ok(Expr::Field(name))
            }
            other => Err(ExpressionError::syntax(
                position,
                format!("unexpected token {other:?}"),
            )),
        }
    }

    fn parse_list(&mut self, close: &Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&Token::Comma, "',' or closing parenthesis")?;
        }
    }

    fn parse_call(&mut self, name: &str, position: usize) -> Result<Expr, ExpressionError> {
        let upper = name.to_ascii_uppercase();
        self.expect(&Token::LParen, "'('")?;

        let ranking = match upper.as_str() {
            "ROW_NUMBER" => Some(WindowFunction::RowNumber),
            "RANK" => Some(WindowFunction::Rank),
            "DENSE_RANK" => Some(WindowFunction::DenseRank),
            _ => None,
        };
        if let Some(func) = ranking {
            self.expect(&Token::RParen, "')'")?;
            self.expect_keyword("OVER")
                .map_err(|_| ExpressionError::syntax(position, format!("{upper} requires OVER (...)")))?;
            return self.parse_over(func);
        }

        if let Some(func) = Self::aggregate_by_sql_name(&upper) {
            let (func, arg) = self.parse_aggregate_args(func, &upper, position)?;
            if self.eat_keyword("OVER") {
                return self.parse_over(WindowFunction::Aggregate { func, arg });
            }
            return Ok(Expr::Aggregate { func, arg });
        }

        let func = ScalarFunction::from_name(&upper).ok_or_else(|| {
            ExpressionError::UnknownFunction {
                name: name.to_string(),
            }
        })?;
        let args = self.parse_list(&Token::RParen)?;
        let (min, max) = func.arity();
        if args.len() < min || args.len() > max {
            return Err(ExpressionError::syntax(
                position,
                format!("{} takes {min}..{max} arguments, got {}", func.name(), args.len()),
            ));
        }
        Ok(Expr::Call { func, args })
    }

    fn aggregate_by_sql_name(upper: &str) -> Option<AggregateFunction> {
        match upper {
            "SUM" => Some(AggregateFunction::Sum),
            "COUNT" => Some(AggregateFunction::Count),
            "AVG" | "MEAN" => Some(AggregateFunction::Avg),
            "MIN" => Some(AggregateFunction::Min),
            "MAX" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    fn parse_aggregate_args(
        &mut self,
        func: AggregateFunction,
        name: &str,
        position: usize,
    ) -> Result<(AggregateFunction, Option<Box<Expr>>), ExpressionError> {
        if func == AggregateFunction::Count && self.eat(&Token::Star) {
            self.expect(&Token::RParen, "')'")?;
            return Ok((func, None));
        }

        let distinct = self.eat_keyword("DISTINCT");
        let arg = self.parse_or()?;
        self.expect(&Token::RParen, "')'")?;

        let func = match (func, distinct) {
            (AggregateFunction::Count, true) => AggregateFunction::CountDistinct,
            (_, true) => {
                return Err(ExpressionError::syntax(
                    position,
                    format!("DISTINCT is only supported in COUNT, not {name}"),
                ))
            }
            (func, false) => func,
        };
        Ok((func, Some(Box::new(arg))))
    }

    fn parse_over(&mut self, func: WindowFunction) -> Result<Expr, ExpressionError> {
        self.expect(&Token::LParen, "'(' after OVER")?;

        let mut partition_by = Vec::new();
        if self.eat_keyword("PARTITION") {
            self.expect_keyword("BY")?;
            loop {
                partition_by.push(self.parse_additive()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.parse_additive()?;
                let descending = if self.eat_keyword("DESC") {
                    true
                } else {
                    self.eat_keyword("ASC");
                    false
                };
                order_by.push(OrderKey { expr, descending });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }

        self.expect(&Token::RParen, "')' closing OVER")?;

        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(Expr::Window {
            slot,
            spec: WindowSpec {
                func,
                partition_by,
                order_by,
            },
        })
    }

    fn parse_case(&mut self) -> Result<Expr, ExpressionError> {
        let operand = if self.current().is_keyword("WHEN") {
            None
        } else {
            Some(Box::new(self.parse_or()?))
        };

        let mut branches = Vec::new();
        while self.eat_keyword("WHEN") {
            let when = self.parse_or()?;
            self.expect_keyword("THEN")?;
            let then = self.parse_or()?;
            branches.push((when, then));
        }
        if branches.is_empty() {
            return Err(self.unexpected("WHEN"));
        }

        let otherwise = if self.eat_keyword("ELSE") {
            Some(Box::new(self.parse_or()?))
        } else {
            None
        };
        self.expect_keyword("END")?;

        Ok(Expr::Case {
            operand,
            branches,
            otherwise,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> Box<Expr> {
        Box::new(Expr::Field(name.to_string()))
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("a + b * 2 > 10 AND NOT c").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                assert!(matches!(*left, Expr::Binary { op: BinaryOp::Gt, .. }));
                assert!(matches!(*right, Expr::Unary { op: UnaryOp::Not, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_gate_expression() {
        let expr = parse_expression("$region != null && $year == 2024").unwrap();
        assert_eq!(expr.params(), vec!["region", "year"]);
    }

    #[test]
    fn test_case_when() {
        let expr = parse_expression(
            "CASE WHEN total > 100 THEN 'high' WHEN total > 10 THEN 'mid' ELSE 'low' END",
        )
        .unwrap();
        match expr {
            Expr::Case {
                operand: None,
                branches,
                otherwise: Some(_),
            } => assert_eq!(branches.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_in_between_like_is() {
        assert!(matches!(
            parse_expression("x NOT IN (1, 2)").unwrap(),
            Expr::InList { negated: true, .. }
        ));
        assert_eq!(
            parse_expression("x BETWEEN 1 AND 5 AND y = 2").unwrap(),
            Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(Expr::Between {
                    expr: field("x"),
                    low: Box::new(Expr::Literal(Value::Int(1))),
                    high: Box::new(Expr::Literal(Value::Int(5))),
                    negated: false,
                }),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Eq,
                    left: field("y"),
                    right: Box::new(Expr::Literal(Value::Int(2))),
                }),
            }
        );
        assert!(matches!(
            parse_expression("name LIKE 'A%'").unwrap(),
            Expr::Like { negated: false, .. }
        ));
        assert!(matches!(
            parse_expression("name IS NOT NULL").unwrap(),
            Expr::IsNull { negated: true, .. }
        ));
    }

    #[test]
    fn test_aggregates_and_windows() {
        let expr = parse_expression("SUM(amount) / COUNT(*)").unwrap();
        assert!(expr.contains_aggregate());

        let window =
            parse_expression("ROW_NUMBER() OVER (PARTITION BY d ORDER BY v DESC)").unwrap();
        match window {
            Expr::Window { slot: 0, spec } => {
                assert_eq!(spec.func, WindowFunction::RowNumber);
                assert_eq!(spec.partition_by, vec![Expr::Field("d".into())]);
                assert!(spec.order_by[0].descending);
            }
            other => panic!("unexpected {other:?}"),
        }

        let two = parse_expression("RANK() OVER (ORDER BY a) + SUM(v) OVER (PARTITION BY d)")
            .unwrap();
        let slots: Vec<usize> = two.windows().iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![0, 1]);
    }

    #[test]
    fn test_count_distinct() {
        assert_eq!(
            parse_expression("COUNT(DISTINCT customer)").unwrap(),
            Expr::Aggregate {
                func: AggregateFunction::CountDistinct,
                arg: Some(field("customer")),
            }
        );
        assert!(parse_expression("SUM(DISTINCT x)").is_err());
    }

    #[test]
    fn test_rejects_unknown_functions() {
        assert_eq!(
            parse_expression("exec('rm -rf /')").unwrap_err(),
            ExpressionError::UnknownFunction {
                name: "exec".into()
            }
        );
        assert!(parse_expression("__import__('os')").is_err());
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("a +").is_err());
        assert!(parse_expression("(a").is_err());
        assert!(parse_expression("a b").is_err());
        assert!(parse_expression("CASE END").is_err());
        assert!(parse_expression("ROUND(1, 2, 3)").is_err());
        assert!(parse_expression("RANK()").is_err());
    }

    #[test]
    fn test_negative_literals_fold() {
        assert_eq!(
            parse_expression("-5").unwrap(),
            Expr::Literal(Value::Int(-5))
        );
    }
}
