//! Parser for OData filter text
//!
//! Produces the same [`Expr`] tree the query builder produces, so parsed
//! filters can be rendered again or run against the local store.
//! Parenthesized input becomes [`Expr::Group`], which keeps re-rendering
//! exact.

use winnow::ascii::{digit1, multispace0, multispace1};
use winnow::combinator::{alt, cut_err, delimited, not, preceded, repeat, separated};
use winnow::error::{ContextError, ErrMode, StrContext};
use winnow::prelude::*;
use winnow::token::{one_of, take_while};

use crate::ast::{BinOp, Expr, Function, Literal, UnaryOp, parse_timestamp};

type PResult<T> = winnow::ModalResult<T>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {}, offset {})",
            self.message, self.line, self.column, self.offset
        )
    }
}

impl std::error::Error for ParseError {}

/// Parse an OData filter expression
pub fn parse_filter(input: &str) -> Result<Expr, ParseError> {
    let input = input.trim();
    let mut stream = input;
    match expr.parse_next(&mut stream) {
        Ok(parsed) => {
            if stream.trim().is_empty() {
                Ok(parsed)
            } else {
                let offset = trailing_input_offset(input, stream);
                Err(build_parse_error(
                    "unexpected trailing input".to_string(),
                    input,
                    offset,
                ))
            }
        }
        Err(e) => {
            let offset = input.len().saturating_sub(stream.len());
            let message = match e {
                ErrMode::Backtrack(ctx) | ErrMode::Cut(ctx) => describe(&ctx),
                ErrMode::Incomplete(_) => "incomplete input".to_string(),
            };
            Err(build_parse_error(message, input, offset))
        }
    }
}

fn describe(ctx: &ContextError) -> String {
    let rendered = ctx.to_string();
    if rendered.is_empty() {
        "invalid filter expression".to_string()
    } else {
        rendered
    }
}

fn build_parse_error(message: String, input: &str, offset: usize) -> ParseError {
    let (line, column) = offset_to_line_column(input, offset);
    ParseError {
        message,
        offset,
        line,
        column,
    }
}

fn offset_to_line_column(input: &str, offset: usize) -> (usize, usize) {
    let bounded = offset.min(input.len());
    let mut line = 1usize;
    let mut column = 1usize;

    for ch in input[..bounded].chars() {
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }

    (line, column)
}

fn trailing_input_offset(input: &str, trailing: &str) -> usize {
    let base = input.len().saturating_sub(trailing.len());
    let non_ws = trailing
        .char_indices()
        .find(|(_, ch)| !ch.is_whitespace())
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    base + non_ws
}

// ============ Binary operators (handles precedence) ============

fn expr(input: &mut &str) -> PResult<Expr> {
    or_expr.parse_next(input)
}

/// One left-associative precedence level
fn binary_level(
    input: &mut &str,
    operand: fn(&mut &str) -> PResult<Expr>,
    ops: &[BinOp],
) -> PResult<Expr> {
    let first = operand(input)?;
    let rest: Vec<(BinOp, Expr)> = repeat(
        0..,
        (multispace1, |i: &mut &str| operator(i, ops), multispace0, operand)
            .map(|(_, op, _, e)| (op, e)),
    )
    .parse_next(input)?;
    Ok(rest
        .into_iter()
        .fold(first, |l, (op, r)| Expr::binop(l, op, r)))
}

fn operator(input: &mut &str, ops: &[BinOp]) -> PResult<BinOp> {
    for op in ops {
        let checkpoint = *input;
        if keyword(op.keyword()).parse_next(input).is_ok() {
            return Ok(*op);
        }
        *input = checkpoint;
    }
    Err(ErrMode::Backtrack(ContextError::new()))
}

fn or_expr(input: &mut &str) -> PResult<Expr> {
    binary_level(input, and_expr, &[BinOp::Or])
}

fn and_expr(input: &mut &str) -> PResult<Expr> {
    binary_level(input, cmp_expr, &[BinOp::And])
}

fn cmp_expr(input: &mut &str) -> PResult<Expr> {
    binary_level(
        input,
        add_expr,
        &[BinOp::Eq, BinOp::Ne, BinOp::Gt, BinOp::Ge, BinOp::Lt, BinOp::Le],
    )
}

fn add_expr(input: &mut &str) -> PResult<Expr> {
    binary_level(input, mul_expr, &[BinOp::Add, BinOp::Sub])
}

fn mul_expr(input: &mut &str) -> PResult<Expr> {
    binary_level(input, unary_expr, &[BinOp::Mul, BinOp::Div, BinOp::Mod])
}

fn unary_expr(input: &mut &str) -> PResult<Expr> {
    alt((
        preceded((keyword("not"), multispace0), unary_expr)
            .map(|e| Expr::unary(UnaryOp::Not, e)),
        negative_number,
        preceded(('-', multispace0), unary_expr).map(|e| Expr::unary(UnaryOp::Negate, e)),
        primary,
    ))
    .parse_next(input)
}

/// `-` directly in front of a number folds into the literal
fn negative_number(input: &mut &str) -> PResult<Expr> {
    preceded('-', number)
        .map(|lit| match lit {
            Literal::Int(n) => Literal::Int(-n),
            Literal::Float(n) => Literal::Float(-n),
            other => other,
        })
        .map(Expr::Literal)
        .parse_next(input)
}

// ============ Primary expressions ============

fn primary(input: &mut &str) -> PResult<Expr> {
    alt((
        paren_expr,
        literal.map(Expr::Literal),
        call,
        ident.map(Expr::Field),
    ))
    .context(StrContext::Label("operand"))
    .parse_next(input)
}

fn paren_expr(input: &mut &str) -> PResult<Expr> {
    delimited(('(', multispace0), cut_err(expr), (multispace0, cut_err(')')))
        .map(Expr::group)
        .parse_next(input)
}

fn call(input: &mut &str) -> PResult<Expr> {
    let function = ident
        .verify_map(|name| Function::from_name(&name))
        .parse_next(input)?;
    let args: Vec<Expr> = preceded(
        multispace0,
        delimited(
            ('(', multispace0),
            separated(0.., expr, (multispace0, ',', multispace0)),
            (multispace0, cut_err(')')),
        ),
    )
    .parse_next(input)?;
    let (min, max) = function.arity();
    if args.len() < min || args.len() > max {
        return Err(ErrMode::Cut(ContextError::new()));
    }
    Ok(Expr::call(function, args))
}

// ============ Identifiers ============

fn ident(input: &mut &str) -> PResult<String> {
    (
        one_of(|c: char| c.is_ascii_alphabetic() || c == '_' || c == '$'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '/'),
    )
        .take()
        .map(str::to_string)
        .parse_next(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '/'
}

/// A keyword not followed by more identifier characters
fn keyword<'a>(word: &'static str) -> impl Parser<&'a str, &'a str, ErrMode<ContextError>> {
    (word, not(one_of(is_ident_char))).map(|(w, _)| w)
}

// ============ Literals ============

fn literal(input: &mut &str) -> PResult<Literal> {
    alt((
        keyword("true").value(Literal::Bool(true)),
        keyword("false").value(Literal::Bool(false)),
        keyword("null").value(Literal::Null),
        date_lit,
        number,
        string_lit.map(Literal::String),
    ))
    .parse_next(input)
}

fn number(input: &mut &str) -> PResult<Literal> {
    alt((float_lit, int_lit)).parse_next(input)
}

fn int_lit(input: &mut &str) -> PResult<Literal> {
    terminated_number(digit1)
        .try_map(|s: &str| s.parse::<i64>())
        .map(Literal::Int)
        .parse_next(input)
}

fn float_lit(input: &mut &str) -> PResult<Literal> {
    terminated_number((digit1, '.', digit1).take())
        .try_map(|s: &str| s.parse::<f64>())
        .map(Literal::Float)
        .parse_next(input)
}

/// Numbers may not run into identifier characters (`12abc`)
fn terminated_number<'a, P>(inner: P) -> impl Parser<&'a str, &'a str, ErrMode<ContextError>>
where
    P: Parser<&'a str, &'a str, ErrMode<ContextError>>,
{
    (inner, not(one_of(is_ident_char))).map(|(s, _)| s)
}

/// `datetime'1986-06-30T00:00:00.000Z'`
fn date_lit(input: &mut &str) -> PResult<Literal> {
    preceded("datetime", string_lit)
        .verify_map(|s| parse_timestamp(&s))
        .map(Literal::Date)
        .parse_next(input)
}

/// Single-quoted string; `''` is an escaped quote
fn string_lit(input: &mut &str) -> PResult<String> {
    delimited(
        '\'',
        repeat(
            0..,
            alt((
                "''".map(|_: &str| "'".to_string()),
                take_while(1.., |c: char| c != '\'').map(str::to_string),
            )),
        )
        .fold(String::new, |mut acc: String, chunk: String| {
            acc.push_str(&chunk);
            acc
        }),
        cut_err('\''),
    )
    .parse_next(input)
}

// ============ Sanity Tests ============
// Rendering roundtrips are covered in tests/property.rs
