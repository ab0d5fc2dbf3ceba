use crate::functions::Builtin;
use crate::tokenizer::{Token, TokenSubType, TokenType, Tokenizer, TokenizerError};
use fieldcalc_common::{Value, format_number};

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashSet};
use std::error::Error;
use std::fmt::{self, Display};
use std::hash::BuildHasher;

/// A custom error type for the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserError {
    pub message: String,
    pub position: Option<usize>,
}

impl ParserError {
    fn at(message: impl Into<String>, position: usize) -> Self {
        ParserError {
            message: message.into(),
            position: Some(position),
        }
    }
}

impl Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pos) = self.position {
            write!(f, "ParserError at position {}: {}", pos, self.message)
        } else {
            write!(f, "ParserError: {}", self.message)
        }
    }
}

impl Error for ParserError {}

impl From<TokenizerError> for ParserError {
    fn from(err: TokenizerError) -> Self {
        ParserError {
            message: err.message,
            position: Some(err.pos),
        }
    }
}

/// The set of sibling field names a formula may reference.
pub trait FieldNames {
    fn contains_name(&self, name: &str) -> bool;
}

impl<S: BuildHasher> FieldNames for HashSet<String, S> {
    fn contains_name(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl FieldNames for BTreeSet<String> {
    fn contains_name(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl FieldNames for [&str] {
    fn contains_name(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

impl<const N: usize> FieldNames for [&str; N] {
    fn contains_name(&self, name: &str) -> bool {
        self.contains(&name)
    }
}

impl FieldNames for Vec<String> {
    fn contains_name(&self, name: &str) -> bool {
        self.iter().any(|n| n == name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Plus,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    fn from_symbol(s: &str) -> Option<Self> {
        Some(match s {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "&" => BinaryOp::Concat,
            "=" => BinaryOp::Eq,
            "<>" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Concat => "&",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }

    /// All binary operators are left-associative.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Mul | BinaryOp::Div => 4,
            BinaryOp::Add | BinaryOp::Sub => 3,
            BinaryOp::Concat => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 1,
        }
    }

    pub fn is_comparison(self) -> bool {
        self.precedence() == 1
    }
}

/// The different types of AST nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum ASTNodeType {
    Literal(Value),
    /// A `[Name]` reference to a sibling field.
    FieldRef(String),
    UnaryOp {
        op: UnaryOp,
        expr: Box<ASTNode>,
    },
    BinaryOp {
        op: BinaryOp,
        left: Box<ASTNode>,
        right: Box<ASTNode>,
    },
    Function {
        func: Builtin,
        args: Vec<ASTNode>,
    },
}

/// An AST node represents a parsed formula element.
#[derive(Debug, Clone, PartialEq)]
pub struct ASTNode {
    pub node_type: ASTNodeType,
    pub source_token: Option<Token>,
}

impl ASTNode {
    pub fn new(node_type: ASTNodeType, source_token: Option<Token>) -> Self {
        ASTNode {
            node_type,
            source_token,
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ASTNode::new(ASTNodeType::Literal(value.into()), None)
    }

    pub fn field_ref(name: impl Into<String>) -> Self {
        ASTNode::new(ASTNodeType::FieldRef(name.into()), None)
    }

    /// Distinct referenced field names, in first-occurrence order.
    pub fn field_references(&self) -> SmallVec<[&str; 4]> {
        let mut out = SmallVec::new();
        let mut seen = FxHashSet::default();
        self.collect_references(&mut out, &mut seen);
        out
    }

    fn collect_references<'a>(
        &'a self,
        out: &mut SmallVec<[&'a str; 4]>,
        seen: &mut FxHashSet<&'a str>,
    ) {
        match &self.node_type {
            ASTNodeType::FieldRef(name) => {
                if seen.insert(name.as_str()) {
                    out.push(name.as_str());
                }
            }
            ASTNodeType::UnaryOp { expr, .. } => expr.collect_references(out, seen),
            ASTNodeType::BinaryOp { left, right, .. } => {
                left.collect_references(out, seen);
                right.collect_references(out, seen);
            }
            ASTNodeType::Function { args, .. } => {
                for arg in args {
                    arg.collect_references(out, seen);
                }
            }
            ASTNodeType::Literal(_) => {}
        }
    }

    /// Whether the AST calls a function whose result depends on the clock.
    pub fn contains_volatile(&self) -> bool {
        match &self.node_type {
            ASTNodeType::Function { func, args } => {
                *func == Builtin::Today || args.iter().any(ASTNode::contains_volatile)
            }
            ASTNodeType::UnaryOp { expr, .. } => expr.contains_volatile(),
            ASTNodeType::BinaryOp { left, right, .. } => {
                left.contains_volatile() || right.contains_volatile()
            }
            ASTNodeType::Literal(_) | ASTNodeType::FieldRef(_) => false,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, parent: u8, right: bool) -> fmt::Result {
        let needs_parens = match &self.node_type {
            ASTNodeType::BinaryOp { op, .. } => {
                op.precedence() < parent || (right && op.precedence() == parent)
            }
            _ => false,
        };
        if needs_parens {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

/// Canonical source form: `CONCAT([First], " ", [Last])`.
impl Display for ASTNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_type {
            ASTNodeType::Literal(Value::Text(s)) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
            ASTNodeType::Literal(Value::Number(n)) => write!(f, "{}", format_number(*n)),
            ASTNodeType::Literal(Value::Boolean(b)) => {
                write!(f, "{}", if *b { "TRUE" } else { "FALSE" })
            }
            ASTNodeType::Literal(other) => write!(f, "\"{}\"", other.to_text()),
            ASTNodeType::FieldRef(name) => write!(f, "[{name}]"),
            ASTNodeType::UnaryOp { op, expr } => {
                write!(f, "{}", op.symbol())?;
                expr.fmt_operand(f, u8::MAX, false)
            }
            ASTNodeType::BinaryOp { op, left, right } => {
                left.fmt_operand(f, op.precedence(), false)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_operand(f, op.precedence(), true)
            }
            ASTNodeType::Function { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A parser for converting tokens into an AST, validating field references
/// and function names as it goes.
pub struct Parser<'n, N: FieldNames + ?Sized> {
    tokens: Vec<Token>,
    position: usize,
    names: &'n N,
    source_len: usize,
}

impl<'n, N: FieldNames + ?Sized> Parser<'n, N> {
    pub fn new(tokens: Vec<Token>, names: &'n N) -> Self {
        let source_len = tokens.last().map(|t| t.end).unwrap_or(0);
        let tokens = tokens
            .into_iter()
            .filter(|t| t.token_type != TokenType::Whitespace)
            .collect();
        Parser {
            tokens,
            position: 0,
            names,
            source_len,
        }
    }

    /// Byte offset of the current token, for error reporting.
    fn offset(&self) -> usize {
        self.tokens
            .get(self.position)
            .map(|t| t.start)
            .unwrap_or(self.source_len)
    }

    /// Parse the tokens into an AST.
    pub fn parse(&mut self) -> Result<ASTNode, ParserError> {
        if self.tokens.is_empty() {
            return Err(ParserError {
                message: "Empty formula".to_string(),
                position: None,
            });
        }

        let ast = self.parse_binary_op(0)?;
        if let Some(token) = self.tokens.get(self.position) {
            return Err(ParserError::at(
                format!("Unexpected token '{}'", token.value),
                token.start,
            ));
        }
        Ok(ast)
    }

    fn parse_binary_op(&mut self, min_precedence: u8) -> Result<ASTNode, ParserError> {
        let mut left = self.parse_unary_op()?;

        while let Some(token) = self.tokens.get(self.position) {
            if token.token_type != TokenType::OpInfix {
                break;
            }
            let Some(op) = BinaryOp::from_symbol(&token.value) else {
                return Err(ParserError::at(
                    format!("Unknown operator '{}'", token.value),
                    token.start,
                ));
            };
            if op.precedence() < min_precedence {
                break;
            }

            let op_token = token.clone();
            self.position += 1;
            let right = self.parse_binary_op(op.precedence() + 1)?;
            left = ASTNode::new(
                ASTNodeType::BinaryOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                Some(op_token),
            );
        }

        Ok(left)
    }

    fn parse_unary_op(&mut self) -> Result<ASTNode, ParserError> {
        let prefix = self
            .tokens
            .get(self.position)
            .filter(|t| t.token_type == TokenType::OpPrefix)
            .cloned();
        if let Some(op_token) = prefix {
            let op = if op_token.value == "-" {
                UnaryOp::Neg
            } else {
                UnaryOp::Plus
            };
            self.position += 1;
            let expr = self.parse_unary_op()?;
            return Ok(ASTNode::new(
                ASTNodeType::UnaryOp {
                    op,
                    expr: Box::new(expr),
                },
                Some(op_token),
            ));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ASTNode, ParserError> {
        let Some(token) = self.tokens.get(self.position).cloned() else {
            return Err(ParserError::at("Unexpected end of formula", self.offset()));
        };

        match (token.token_type, token.subtype) {
            (TokenType::Operand, _) => {
                self.position += 1;
                self.parse_operand(token)
            }
            (TokenType::Func, TokenSubType::Open) => {
                self.position += 1;
                self.parse_function(token)
            }
            (TokenType::Paren, TokenSubType::Open) => {
                self.position += 1;
                let expr = self.parse_binary_op(0)?;
                match self.tokens.get(self.position) {
                    Some(t) if t.token_type == TokenType::Paren && t.subtype == TokenSubType::Close => {
                        self.position += 1;
                        Ok(expr)
                    }
                    _ => Err(ParserError::at("Expected closing parenthesis", self.offset())),
                }
            }
            _ => Err(ParserError::at(
                format!("Unexpected token '{}'", token.value),
                token.start,
            )),
        }
    }

    fn parse_operand(&mut self, token: Token) -> Result<ASTNode, ParserError> {
        let node_type = match token.subtype {
            TokenSubType::Number => {
                let value = token.value.parse::<f64>().map_err(|_| {
                    ParserError::at(format!("Invalid number: {}", token.value), token.start)
                })?;
                ASTNodeType::Literal(Value::Number(value))
            }
            TokenSubType::Text => {
                let inner = &token.value[1..token.value.len() - 1];
                ASTNodeType::Literal(Value::Text(inner.replace("\"\"", "\"")))
            }
            TokenSubType::Logical => {
                ASTNodeType::Literal(Value::Boolean(token.value.eq_ignore_ascii_case("TRUE")))
            }
            TokenSubType::Field => {
                let name = &token.value[1..token.value.len() - 1];
                if !self.names.contains_name(name) {
                    return Err(ParserError::at(
                        format!("Unknown field reference [{name}]"),
                        token.start,
                    ));
                }
                ASTNodeType::FieldRef(name.to_string())
            }
            other => {
                return Err(ParserError::at(
                    format!("Unexpected operand subtype: {other:?}"),
                    token.start,
                ));
            }
        };
        Ok(ASTNode::new(node_type, Some(token)))
    }

    fn parse_function(&mut self, func_token: Token) -> Result<ASTNode, ParserError> {
        let name = func_token.value.trim_end_matches('(').trim_end();
        let Some(func) = Builtin::from_name(name) else {
            return Err(ParserError::at(
                format!("Unknown function {name}"),
                func_token.start,
            ));
        };

        let args = self.parse_function_arguments()?;
        let arity = func.arity();
        if !arity.accepts(args.len()) {
            return Err(ParserError::at(
                format!(
                    "{} expects {} argument(s), got {}",
                    func.name(),
                    arity,
                    args.len()
                ),
                func_token.start,
            ));
        }

        Ok(ASTNode::new(
            ASTNodeType::Function { func, args },
            Some(func_token),
        ))
    }

    fn is_func_close(&self) -> bool {
        matches!(
            self.tokens.get(self.position),
            Some(t) if t.token_type == TokenType::Func && t.subtype == TokenSubType::Close
        )
    }

    fn parse_function_arguments(&mut self) -> Result<Vec<ASTNode>, ParserError> {
        let mut args = Vec::new();

        if self.is_func_close() {
            self.position += 1;
            return Ok(args);
        }

        loop {
            args.push(self.parse_binary_op(0)?);
            match self.tokens.get(self.position) {
                Some(t) if t.token_type == TokenType::Sep => {
                    self.position += 1;
                }
                Some(t) if t.token_type == TokenType::Func && t.subtype == TokenSubType::Close => {
                    self.position += 1;
                    return Ok(args);
                }
                Some(t) => {
                    return Err(ParserError::at(
                        format!("Expected ',' or ')' in function arguments, got '{}'", t.value),
                        t.start,
                    ));
                }
                None => {
                    return Err(ParserError::at(
                        "Unexpected end of formula in function arguments",
                        self.offset(),
                    ));
                }
            }
        }
    }
}

/// Parse `expression`, resolving every `[Name]` against `available`.
///
/// Unknown field references, unknown function names and wrong argument counts
/// are all reported here, before the formula is ever evaluated.
pub fn parse<N: FieldNames + ?Sized>(
    expression: &str,
    available: &N,
) -> Result<ASTNode, ParserError> {
    let tokens = Tokenizer::new(expression)?.items;
    Parser::new(tokens, available).parse()
}
