//! Scalar expression language used by conditional attributes.
//!
//! Grammar:
//! ```text
//! or-expr    ::= and-expr ( 'Or' and-expr )*
//! and-expr   ::= comparison ( 'And' comparison )*
//! comparison ::= scalar ( ('=='|'!='|'<'|'<='|'>'|'>=') scalar )?
//! scalar     ::= '(' or-expr ')' | '!' scalar
//!              | 'Exists' '(' scalar ')' | 'HasTrailingSlash' '(' scalar ')'
//!              | quoted-string | bare-identifier
//! ```
//!
//! The sole value type is the scalar: a case-insensitive string, coerced to
//! boolean or integer on demand. `And`/`Or` always evaluate both operands so
//! that errors on the "dead" branch are still surfaced.

use gantry_types::{GantryError, Result};

fn make_error(token: &str, message: impl Into<String>) -> GantryError {
    GantryError::Expression {
        message: message.into(),
        token: token.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Split the input into tokens: digit runs, identifier runs, the operators
/// `!` `<` `>` `=` (each optionally absorbing a trailing `=`), parentheses,
/// and quoted strings (kept with their surrounding quotes). A trailing empty
/// token marks end of stream.
fn tokenize(text: &str) -> Result<Vec<String>> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < len {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < len && bytes[i].is_ascii_digit() {
                i += 1;
            }
            tokens.push(text[start..i].to_string());
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(text[start..i].to_string());
        } else if c == b'!' || c == b'<' || c == b'>' || c == b'=' {
            let start = i;
            i += 1;
            if i < len && bytes[i] == b'=' {
                i += 1;
            }
            tokens.push(text[start..i].to_string());
        } else if c == b'(' || c == b')' {
            tokens.push((c as char).to_string());
            i += 1;
        } else if c == b'\'' || c == b'"' {
            let quote = c;
            let start = i;
            i += 1;
            while i < len && bytes[i] != quote {
                i += 1;
            }
            if i == len {
                return Err(make_error(&text[start..], "unterminated string literal"));
            }
            i += 1;
            tokens.push(text[start..i].to_string());
        } else {
            return Err(make_error(
                &(c as char).to_string(),
                "unknown character in expression",
            ));
        }
    }

    tokens.push(String::new());
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct Evaluator {
    tokens: Vec<String>,
    pos: usize,
}

fn bool_scalar(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn coerce_to_bool(scalar: &str) -> Result<bool> {
    if scalar.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if scalar.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(make_error(scalar, "cannot coerce to a boolean"))
    }
}

fn coerce_to_int(scalar: &str) -> Result<i64> {
    scalar
        .parse::<i64>()
        .map_err(|_| make_error(scalar, "cannot coerce to an integer"))
}

impl Evaluator {
    fn current(&self) -> &str {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn evaluate_or(&mut self) -> Result<String> {
        let mut lhs = self.evaluate_and()?;
        while self.current().eq_ignore_ascii_case("or") {
            self.advance();
            // Both operands are always evaluated; no short-circuiting.
            let rhs = self.evaluate_and()?;
            lhs = bool_scalar(coerce_to_bool(&lhs)? | coerce_to_bool(&rhs)?);
        }
        Ok(lhs)
    }

    fn evaluate_and(&mut self) -> Result<String> {
        let mut lhs = self.evaluate_comparison()?;
        while self.current().eq_ignore_ascii_case("and") {
            self.advance();
            let rhs = self.evaluate_comparison()?;
            lhs = bool_scalar(coerce_to_bool(&lhs)? & coerce_to_bool(&rhs)?);
        }
        Ok(lhs)
    }

    fn evaluate_comparison(&mut self) -> Result<String> {
        let lhs = self.evaluate_scalar()?;
        let result = match self.current() {
            "==" => {
                self.advance();
                let rhs = self.evaluate_scalar()?;
                bool_scalar(lhs.eq_ignore_ascii_case(&rhs))
            }
            "!=" => {
                self.advance();
                let rhs = self.evaluate_scalar()?;
                bool_scalar(!lhs.eq_ignore_ascii_case(&rhs))
            }
            "<" => {
                self.advance();
                let rhs = self.evaluate_scalar()?;
                bool_scalar(coerce_to_int(&lhs)? < coerce_to_int(&rhs)?)
            }
            "<=" => {
                self.advance();
                let rhs = self.evaluate_scalar()?;
                bool_scalar(coerce_to_int(&lhs)? <= coerce_to_int(&rhs)?)
            }
            ">" => {
                self.advance();
                let rhs = self.evaluate_scalar()?;
                bool_scalar(coerce_to_int(&lhs)? > coerce_to_int(&rhs)?)
            }
            ">=" => {
                self.advance();
                let rhs = self.evaluate_scalar()?;
                bool_scalar(coerce_to_int(&lhs)? >= coerce_to_int(&rhs)?)
            }
            _ => lhs,
        };
        Ok(result)
    }

    fn evaluate_scalar(&mut self) -> Result<String> {
        let token = self.current().to_string();
        if token.is_empty() {
            return Err(make_error("", "unexpected end of expression"));
        }
        if token == "(" {
            self.advance();
            let value = self.evaluate_or()?;
            self.expect_close_paren()?;
            return Ok(value);
        }
        if token == "!" {
            self.advance();
            let value = self.evaluate_scalar()?;
            return Ok(bool_scalar(!coerce_to_bool(&value)?));
        }
        if token.eq_ignore_ascii_case("exists") {
            self.advance();
            let arg = self.evaluate_function_argument(&token)?;
            return Ok(bool_scalar(std::path::Path::new(&arg).exists()));
        }
        if token.eq_ignore_ascii_case("hastrailingslash") {
            self.advance();
            let arg = self.evaluate_function_argument(&token)?;
            let has_slash = arg
                .chars()
                .last()
                .map(|c| c == '/' || c == std::path::MAIN_SEPARATOR)
                .unwrap_or(false);
            return Ok(bool_scalar(has_slash));
        }
        let Some(first) = token.chars().next() else {
            return Err(make_error("", "unexpected end of expression"));
        };
        if first == '\'' || first == '"' {
            self.advance();
            return Ok(token[1..token.len() - 1].to_string());
        }
        if first.is_ascii_alphanumeric() || first == '_' {
            self.advance();
            return Ok(token);
        }
        Err(make_error(&token, "unexpected token"))
    }

    fn evaluate_function_argument(&mut self, function: &str) -> Result<String> {
        if self.current() != "(" {
            return Err(make_error(
                function,
                format!("expected '(' after {function}"),
            ));
        }
        self.advance();
        let arg = self.evaluate_scalar()?;
        self.expect_close_paren()?;
        Ok(arg)
    }

    fn expect_close_paren(&mut self) -> Result<()> {
        if self.current() != ")" {
            return Err(make_error(self.current(), "expected ')'"));
        }
        self.advance();
        Ok(())
    }
}

/// Evaluate a full expression to its scalar result.
pub fn evaluate(text: &str) -> Result<String> {
    let tokens = tokenize(text)?;
    let mut evaluator = Evaluator { tokens, pos: 0 };
    let result = evaluator.evaluate_or()?;
    if !evaluator.current().is_empty() {
        return Err(make_error(
            evaluator.current(),
            "garbage after end of expression",
        ));
    }
    Ok(result)
}

/// Evaluate an expression and coerce the result to a boolean.
pub fn evaluate_condition(text: &str) -> Result<bool> {
    coerce_to_bool(&evaluate(text)?)
}
