pub mod functions;
pub mod parser;
pub mod tokenizer;

pub use functions::{Arity, Builtin};
pub use parser::{ASTNode, ASTNodeType, BinaryOp, FieldNames, Parser, ParserError, UnaryOp, parse};
pub use tokenizer::{Token, TokenSubType, TokenType, Tokenizer, TokenizerError};

// Re-export common types
pub use fieldcalc_common::Value;
