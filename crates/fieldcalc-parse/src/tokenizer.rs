use std::error::Error;
use std::fmt::{self, Display};

/// A custom error type for the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerError {
    pub message: String,
    pub pos: usize,
}

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenizerError: {}", self.message)
    }
}

impl Error for TokenizerError {}

/// The type of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Operand,
    Func,
    Paren,
    Sep,
    OpPrefix,
    OpInfix,
    Whitespace,
}

impl Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The subtype of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenSubType {
    None,
    Text,
    Number,
    Logical,
    Field,
    Open,
    Close,
    Arg,
}

impl Display for TokenSubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A token in a formula expression. `start..end` is the byte span in the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    pub value: String,
    pub token_type: TokenType,
    pub subtype: TokenSubType,
    pub start: usize,
    pub end: usize,
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{} subtype: {:?} value: {}>",
            self.token_type, self.subtype, self.value
        )
    }
}

impl Token {
    fn from_slice(
        source: &str,
        token_type: TokenType,
        subtype: TokenSubType,
        start: usize,
        end: usize,
    ) -> Self {
        Token {
            value: source[start..end].to_string(),
            token_type,
            subtype,
            start,
            end,
        }
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.token_type, TokenType::OpPrefix | TokenType::OpInfix)
    }

    /// Whether an operator following this token must be a prefix operator.
    fn expects_operand_after(&self) -> bool {
        match self.token_type {
            TokenType::OpPrefix | TokenType::OpInfix | TokenType::Sep => true,
            TokenType::Func | TokenType::Paren => self.subtype == TokenSubType::Open,
            TokenType::Operand | TokenType::Whitespace => false,
        }
    }
}

/// A tokenizer for field formulas.
///
/// Grammar at the lexical level: `[Field Name]` references, `"text"` literals
/// (`""` escapes a quote), numbers with optional exponent, `TRUE`/`FALSE`,
/// `NAME(` function openers, `( ) ,` and the operators
/// `+ - * / & = <> < <= > >=`. A single leading `=` is ignored.
#[derive(Debug)]
pub struct Tokenizer {
    formula: String,
    pub items: Vec<Token>,
    paren_stack: Vec<TokenType>,
    offset: usize,
}

impl Tokenizer {
    /// Create a new tokenizer and immediately tokenize the formula.
    pub fn new(formula: &str) -> Result<Self, TokenizerError> {
        let mut tokenizer = Tokenizer {
            formula: formula.to_string(),
            items: Vec::with_capacity(formula.len() / 2),
            paren_stack: Vec::with_capacity(8),
            offset: 0,
        };
        tokenizer.tokenize()?;
        Ok(tokenizer)
    }

    #[inline]
    fn current_byte(&self) -> Option<u8> {
        self.formula.as_bytes().get(self.offset).copied()
    }

    #[inline]
    fn peek_byte(&self, ahead: usize) -> Option<u8> {
        self.formula.as_bytes().get(self.offset + ahead).copied()
    }

    fn last_significant(&self) -> Option<&Token> {
        self.items
            .iter()
            .rev()
            .find(|t| t.token_type != TokenType::Whitespace)
    }

    fn push(&mut self, token_type: TokenType, subtype: TokenSubType, start: usize, end: usize) {
        self.items.push(Token::from_slice(
            &self.formula,
            token_type,
            subtype,
            start,
            end,
        ));
    }

    fn tokenize(&mut self) -> Result<(), TokenizerError> {
        let leading = self.formula.len() - self.formula.trim_start().len();
        self.offset = leading;
        if self.current_byte() == Some(b'=') {
            self.offset += 1;
        }

        while let Some(curr) = self.current_byte() {
            match curr {
                b'"' => self.parse_string()?,
                b'[' => self.parse_field_ref()?,
                b' ' | b'\t' | b'\n' | b'\r' => self.parse_whitespace(),
                b'0'..=b'9' | b'.' => self.parse_number()?,
                b'+' | b'-' | b'*' | b'/' | b'&' | b'=' | b'<' | b'>' => self.parse_operator(),
                b'(' => self.parse_opener(),
                b')' => self.parse_closer()?,
                b',' => self.parse_separator()?,
                c if c.is_ascii_alphabetic() || c == b'_' => self.parse_identifier()?,
                _ => {
                    let ch = self.formula[self.offset..].chars().next().unwrap_or('?');
                    return Err(TokenizerError {
                        message: format!("Unexpected character '{ch}'"),
                        pos: self.offset,
                    });
                }
            }
        }

        if !self.paren_stack.is_empty() {
            return Err(TokenizerError {
                message: "Unmatched opening parenthesis".to_string(),
                pos: self.offset,
            });
        }

        Ok(())
    }

    fn parse_string(&mut self) -> Result<(), TokenizerError> {
        let start = self.offset;
        self.offset += 1;

        while let Some(curr) = self.current_byte() {
            self.offset += 1;
            if curr == b'"' {
                if self.current_byte() == Some(b'"') {
                    self.offset += 1;
                    continue;
                }
                self.push(TokenType::Operand, TokenSubType::Text, start, self.offset);
                return Ok(());
            }
        }

        Err(TokenizerError {
            message: "Reached end of formula while parsing string".to_string(),
            pos: self.offset,
        })
    }

    fn parse_field_ref(&mut self) -> Result<(), TokenizerError> {
        let start = self.offset;
        self.offset += 1;

        while let Some(curr) = self.current_byte() {
            self.offset += 1;
            match curr {
                b']' => {
                    if self.offset - start == 2 {
                        return Err(TokenizerError {
                            message: "Empty field reference '[]'".to_string(),
                            pos: start,
                        });
                    }
                    self.push(TokenType::Operand, TokenSubType::Field, start, self.offset);
                    return Ok(());
                }
                b'[' => {
                    return Err(TokenizerError {
                        message: "Nested '[' inside field reference".to_string(),
                        pos: self.offset - 1,
                    });
                }
                _ => {}
            }
        }

        Err(TokenizerError {
            message: "Encountered unmatched '['".to_string(),
            pos: start,
        })
    }

    fn parse_whitespace(&mut self) {
        let start = self.offset;
        while matches!(self.current_byte(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.offset += 1;
        }
        self.push(TokenType::Whitespace, TokenSubType::None, start, self.offset);
    }

    fn parse_number(&mut self) -> Result<(), TokenizerError> {
        let start = self.offset;
        while matches!(self.current_byte(), Some(b'0'..=b'9' | b'.')) {
            self.offset += 1;
        }
        // Exponent: 1.5e3, 2E-4
        if matches!(self.current_byte(), Some(b'e' | b'E')) {
            let sign = matches!(self.peek_byte(1), Some(b'+' | b'-')) as usize;
            if matches!(self.peek_byte(1 + sign), Some(b'0'..=b'9')) {
                self.offset += 1 + sign;
                while matches!(self.current_byte(), Some(b'0'..=b'9')) {
                    self.offset += 1;
                }
            }
        }

        let text = &self.formula[start..self.offset];
        if text.parse::<f64>().is_err() {
            return Err(TokenizerError {
                message: format!("Invalid number '{text}'"),
                pos: start,
            });
        }
        self.push(TokenType::Operand, TokenSubType::Number, start, self.offset);
        Ok(())
    }

    fn parse_identifier(&mut self) -> Result<(), TokenizerError> {
        let start = self.offset;
        while matches!(self.current_byte(), Some(c) if c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
        {
            self.offset += 1;
        }
        let ident_end = self.offset;

        // A function name is an identifier followed (possibly after spaces) by '('.
        let mut lookahead = self.offset;
        while matches!(self.formula.as_bytes().get(lookahead), Some(b' ' | b'\t')) {
            lookahead += 1;
        }
        if self.formula.as_bytes().get(lookahead) == Some(&b'(') {
            self.offset = lookahead + 1;
            self.push(TokenType::Func, TokenSubType::Open, start, self.offset);
            self.paren_stack.push(TokenType::Func);
            return Ok(());
        }

        let ident = &self.formula[start..ident_end];
        if ident.eq_ignore_ascii_case("TRUE") || ident.eq_ignore_ascii_case("FALSE") {
            self.push(TokenType::Operand, TokenSubType::Logical, start, ident_end);
            return Ok(());
        }

        Err(TokenizerError {
            message: format!(
                "Unexpected name '{ident}'; field references must be written as [{ident}]"
            ),
            pos: start,
        })
    }

    fn parse_operator(&mut self) {
        let start = self.offset;
        let two = (self.current_byte(), self.peek_byte(1));
        if matches!(
            two,
            (Some(b'<'), Some(b'=')) | (Some(b'>'), Some(b'=')) | (Some(b'<'), Some(b'>'))
        ) {
            self.offset += 2;
            self.push(TokenType::OpInfix, TokenSubType::None, start, self.offset);
            return;
        }

        let curr = self.formula.as_bytes()[self.offset];
        self.offset += 1;
        let token_type = match curr {
            b'+' | b'-' => match self.last_significant() {
                None => TokenType::OpPrefix,
                Some(prev) if prev.expects_operand_after() => TokenType::OpPrefix,
                Some(_) => TokenType::OpInfix,
            },
            _ => TokenType::OpInfix,
        };
        self.push(token_type, TokenSubType::None, start, self.offset);
    }

    fn parse_opener(&mut self) {
        let start = self.offset;
        self.offset += 1;
        self.push(TokenType::Paren, TokenSubType::Open, start, self.offset);
        self.paren_stack.push(TokenType::Paren);
    }

    fn parse_closer(&mut self) -> Result<(), TokenizerError> {
        let start = self.offset;
        let Some(opener) = self.paren_stack.pop() else {
            return Err(TokenizerError {
                message: "Unmatched closing parenthesis".to_string(),
                pos: start,
            });
        };
        self.offset += 1;
        self.push(opener, TokenSubType::Close, start, self.offset);
        Ok(())
    }

    fn parse_separator(&mut self) -> Result<(), TokenizerError> {
        if self.paren_stack.last() != Some(&TokenType::Func) {
            return Err(TokenizerError {
                message: "',' is only allowed between function arguments".to_string(),
                pos: self.offset,
            });
        }
        let start = self.offset;
        self.offset += 1;
        self.push(TokenType::Sep, TokenSubType::Arg, start, self.offset);
        Ok(())
    }

    /// Render the token stream back to source text.
    pub fn render(&self) -> String {
        self.items.iter().map(|t| t.value.as_str()).collect()
    }
}
