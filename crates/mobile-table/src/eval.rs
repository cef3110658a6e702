//! Compiles filter expressions into Polars expressions over a local table
//!
//! Local columns are physically typed (see [`ColumnType::dtype`]), so each
//! compiled sub-expression carries a [`Kind`] that says how to coerce it
//! when it meets another operand: booleans are 0/1 integers, dates are
//! ISO-8601 text.

use polars::prelude::*;

use crate::ast::{BinOp, Expr, Function, Literal, UnaryOp};
use crate::render::DATE_FORMAT;
use crate::store::{ColumnType, LocalStoreError, TableSchema};

type Result<T> = std::result::Result<T, LocalStoreError>;
type PlExpr = polars::prelude::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Boolean-valued Polars expression
    Predicate,
    /// Integer-coded boolean
    Flag,
    Number,
    Text,
    Null,
}

struct Typed {
    expr: PlExpr,
    kind: Kind,
}

impl Typed {
    fn new(expr: PlExpr, kind: Kind) -> Self {
        Self { expr, kind }
    }
}

/// Compile a filter into a row predicate for `schema`
pub(crate) fn compile_filter(expr: &Expr, schema: &TableSchema) -> Result<PlExpr> {
    let compiled = compile(expr, schema)?;
    log::debug!("compiled filter `{}` for table {}", expr, schema.name());
    predicate(compiled)
}

fn compile(expr: &Expr, schema: &TableSchema) -> Result<Typed> {
    match expr {
        Expr::Literal(value) => Ok(literal(value)),
        Expr::Field(name) => {
            let def = schema.require(name)?;
            let kind = match def.ty {
                ColumnType::Boolean => Kind::Flag,
                ColumnType::Number => Kind::Number,
                ColumnType::String | ColumnType::Date | ColumnType::Other => Kind::Text,
            };
            Ok(Typed::new(col(def.key.as_str()), kind))
        }
        Expr::Group(inner) => compile(inner, schema),
        Expr::UnaryOp(UnaryOp::Not, inner) => {
            let operand = predicate(compile(inner, schema)?)?;
            Ok(Typed::new(operand.not(), Kind::Predicate))
        }
        Expr::UnaryOp(UnaryOp::Negate, inner) => {
            let operand = numeric(compile(inner, schema)?, "-")?;
            Ok(Typed::new(lit(0i64) - operand, Kind::Number))
        }
        Expr::BinaryOp(left, op, right) => {
            binary(compile(left, schema)?, *op, compile(right, schema)?)
        }
        Expr::Call(func, args) => call(*func, args, schema),
    }
}

fn literal(value: &Literal) -> Typed {
    match value {
        Literal::String(s) => Typed::new(lit(s.clone()), Kind::Text),
        Literal::Int(n) => Typed::new(lit(*n), Kind::Number),
        Literal::Float(n) => Typed::new(lit(*n), Kind::Number),
        Literal::Bool(b) => Typed::new(lit(*b as i64), Kind::Flag),
        Literal::Date(d) => Typed::new(lit(d.format(DATE_FORMAT).to_string()), Kind::Text),
        Literal::Null => Typed::new(lit(NULL), Kind::Null),
    }
}

// ============ Coercions ============

/// Value in a logical position
fn predicate(value: Typed) -> Result<PlExpr> {
    match value.kind {
        Kind::Predicate => Ok(value.expr),
        Kind::Flag | Kind::Number => Ok(value.expr.neq(lit(0i64))),
        Kind::Null => Ok(value.expr.cast(DataType::Boolean)),
        Kind::Text => Err(LocalStoreError::Filter(
            "a text value cannot be used as a condition".to_string(),
        )),
    }
}

/// Value in an arithmetic position
fn numeric(value: Typed, context: &str) -> Result<PlExpr> {
    match value.kind {
        Kind::Number | Kind::Flag | Kind::Null => Ok(value.expr),
        Kind::Predicate => Ok(value.expr.cast(DataType::Int64)),
        Kind::Text => Err(LocalStoreError::Filter(format!(
            "'{context}' expects a number, found text"
        ))),
    }
}

/// Value in a string position
fn text(value: Typed, context: &str) -> Result<PlExpr> {
    match value.kind {
        Kind::Text => Ok(value.expr),
        Kind::Number | Kind::Flag | Kind::Null => Ok(value.expr.cast(DataType::String)),
        Kind::Predicate => Err(LocalStoreError::Filter(format!(
            "'{context}' expects text, found a condition"
        ))),
    }
}

/// Bring both sides of a comparison to a common representation
fn align(left: Typed, right: Typed) -> (PlExpr, PlExpr) {
    let numeric_like = |k: Kind| matches!(k, Kind::Flag | Kind::Number | Kind::Predicate);
    match (left.kind, right.kind) {
        (Kind::Predicate, Kind::Flag | Kind::Number) => {
            (left.expr.cast(DataType::Int64), right.expr)
        }
        (Kind::Flag | Kind::Number, Kind::Predicate) => {
            (left.expr, right.expr.cast(DataType::Int64))
        }
        (Kind::Text, other) if numeric_like(other) => {
            (left.expr, right.expr.cast(DataType::String))
        }
        (other, Kind::Text) if numeric_like(other) => {
            (left.expr.cast(DataType::String), right.expr)
        }
        _ => (left.expr, right.expr),
    }
}

// ============ Operators ============

fn binary(left: Typed, op: BinOp, right: Typed) -> Result<Typed> {
    match op {
        BinOp::And => Ok(Typed::new(
            predicate(left)?.and(predicate(right)?),
            Kind::Predicate,
        )),
        BinOp::Or => Ok(Typed::new(
            predicate(left)?.or(predicate(right)?),
            Kind::Predicate,
        )),
        // `eq null` / `ne null` are null checks
        BinOp::Eq | BinOp::Ne if left.kind == Kind::Null || right.kind == Kind::Null => {
            let other = if left.kind == Kind::Null { right } else { left };
            let expr = if op == BinOp::Eq {
                other.expr.is_null()
            } else {
                other.expr.is_not_null()
            };
            Ok(Typed::new(expr, Kind::Predicate))
        }
        _ if op.is_comparison() => {
            let (l, r) = align(left, right);
            let expr = match op {
                BinOp::Eq => l.eq(r),
                BinOp::Ne => l.neq(r),
                BinOp::Gt => l.gt(r),
                BinOp::Ge => l.gt_eq(r),
                BinOp::Lt => l.lt(r),
                _ => l.lt_eq(r),
            };
            Ok(Typed::new(expr, Kind::Predicate))
        }
        _ => {
            let l = numeric(left, op.keyword())?;
            let r = numeric(right, op.keyword())?;
            let expr = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                _ => l % r,
            };
            Ok(Typed::new(expr, Kind::Number))
        }
    }
}

// ============ Functions ============

fn call(func: Function, args: &[Expr], schema: &TableSchema) -> Result<Typed> {
    let (min, max) = func.arity();
    if args.len() < min || args.len() > max {
        return Err(LocalStoreError::Filter(format!(
            "{} takes {} argument(s), got {}",
            func,
            if min == max {
                min.to_string()
            } else {
                format!("{min} to {max}")
            },
            args.len()
        )));
    }
    let mut compiled = args
        .iter()
        .map(|arg| compile(arg, schema))
        .collect::<Result<Vec<_>>>()?
        .into_iter();
    let name = func.name();
    let mut next = || {
        compiled
            .next()
            .ok_or_else(|| LocalStoreError::Filter(format!("{name}: missing argument")))
    };

    let typed = match func {
        Function::Year => date_part(text(next()?, name)?, 0, 4),
        Function::Month => date_part(text(next()?, name)?, 5, 2),
        Function::Day => date_part(text(next()?, name)?, 8, 2),
        Function::Hour => date_part(text(next()?, name)?, 11, 2),
        Function::Minute => date_part(text(next()?, name)?, 14, 2),
        Function::Second => date_part(text(next()?, name)?, 17, 2),
        Function::Floor => Typed::new(numeric(next()?, name)?.floor(), Kind::Number),
        Function::Ceiling => Typed::new(numeric(next()?, name)?.ceil(), Kind::Number),
        Function::Round => Typed::new(round_half_away(numeric(next()?, name)?), Kind::Number),
        Function::StartsWith => {
            let subject = text(next()?, name)?;
            let prefix = text(next()?, name)?;
            Typed::new(subject.str().starts_with(prefix), Kind::Predicate)
        }
        Function::EndsWith => {
            let subject = text(next()?, name)?;
            let suffix = text(next()?, name)?;
            Typed::new(subject.str().ends_with(suffix), Kind::Predicate)
        }
        Function::SubstringOf => {
            let needle = text(next()?, name)?;
            let subject = text(next()?, name)?;
            Typed::new(subject.str().contains_literal(needle), Kind::Predicate)
        }
        Function::Concat => {
            let first = text(next()?, name)?;
            let second = text(next()?, name)?;
            Typed::new(concat_str([first, second], "", false), Kind::Text)
        }
        Function::IndexOf => {
            let subject = text(next()?, name)?;
            let needle = text(next()?, name)?;
            let found = subject
                .clone()
                .str()
                .find_literal(needle)
                .cast(DataType::Int64)
                .fill_null(lit(-1i64));
            let expr = when(subject.is_null())
                .then(lit(NULL).cast(DataType::Int64))
                .otherwise(found);
            Typed::new(expr, Kind::Number)
        }
        Function::Substring => {
            let subject = text(next()?, name)?;
            let start = numeric(next()?, name)?.cast(DataType::Int64);
            let length = match next() {
                Ok(len) => numeric(len, name)?.cast(DataType::UInt64),
                Err(_) => lit(NULL).cast(DataType::UInt64),
            };
            Typed::new(subject.str().slice(start, length), Kind::Text)
        }
        Function::Replace => {
            let subject = text(next()?, name)?;
            let find = text(next()?, name)?;
            let replacement = text(next()?, name)?;
            Typed::new(
                subject.str().replace_all(find, replacement, true),
                Kind::Text,
            )
        }
        Function::ToLower => Typed::new(text(next()?, name)?.str().to_lowercase(), Kind::Text),
        Function::ToUpper => Typed::new(text(next()?, name)?.str().to_uppercase(), Kind::Text),
        Function::Trim => Typed::new(text(next()?, name)?.str().strip_chars(lit(NULL)), Kind::Text),
        Function::Length => Typed::new(
            text(next()?, name)?.str().len_chars().cast(DataType::Int64),
            Kind::Number,
        ),
    };
    Ok(typed)
}

/// Fixed-position field of `yyyy-MM-ddTHH:mm:ss.SSSZ` text
fn date_part(value: PlExpr, offset: i64, len: u64) -> Typed {
    let part = value
        .str()
        .slice(lit(offset), lit(len))
        .cast(DataType::Int64);
    Typed::new(part, Kind::Number)
}

/// Round half away from zero
fn round_half_away(value: PlExpr) -> PlExpr {
    when(value.clone().gt_eq(lit(0.0)))
        .then((value.clone() + lit(0.5)).floor())
        .otherwise((value - lit(0.5)).ceil())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_filter;

    fn schema() -> TableSchema {
        TableSchema::new(
            "items",
            [
                ("name", ColumnType::String),
                ("price", ColumnType::Number),
                ("done", ColumnType::Boolean),
                ("due", ColumnType::Date),
            ],
        )
        .unwrap()
    }

    fn frame() -> DataFrame {
        df! {
            "id" => ["a", "b", "c", "d"],
            "name" => [Some(" Apple "), Some("banana"), None, Some("cherry")],
            "price" => [Some(1.5), Some(2.5), Some(-2.5), None],
            "done" => [Some(1i64), Some(0), Some(0), None],
            "due" => [
                Some("2013-01-05T10:30:00.000Z"),
                Some("2014-06-30T00:00:00.000Z"),
                None,
                Some("2013-12-31T23:59:59.000Z"),
            ],
        }
        .unwrap()
    }

    fn ids(filter: &str) -> Vec<String> {
        let expr = parse_filter(filter).unwrap();
        let predicate = compile_filter(&expr, &schema()).unwrap();
        let out = frame().lazy().filter(predicate).collect().unwrap();
        out.column("id")
            .unwrap()
            .str()
            .unwrap()
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn boolean_columns_compare_with_boolean_literals() {
        assert_eq!(ids("done eq true"), ["a"]);
        assert_eq!(ids("done eq false"), ["b", "c"]);
        assert_eq!(ids("done"), ["a"]);
        assert_eq!(ids("not done"), ["b", "c"]);
    }

    #[test]
    fn null_comparisons_are_null_checks() {
        assert_eq!(ids("name eq null"), ["c"]);
        assert_eq!(ids("price ne null"), ["a", "b", "c"]);
    }

    #[test]
    fn dates_compare_as_text() {
        assert_eq!(ids("due lt '2014-01-01T00:00:00.000Z'"), ["a", "d"]);
        assert_eq!(ids("due ge datetime'2014-06-30T00:00:00.000Z'"), ["b"]);
        assert_eq!(ids("year(due) eq 2013 and month(due) eq 12"), ["d"]);
        assert_eq!(ids("hour(due) eq 10 and minute(due) eq 30"), ["a"]);
    }

    #[test]
    fn arithmetic_and_rounding() {
        assert_eq!(ids("price mul 2 gt 4"), ["b"]);
        assert_eq!(ids("round(price) eq 3"), ["b"]);
        assert_eq!(ids("round(price) eq -3"), ["c"]);
        assert_eq!(ids("floor(price) eq 1"), ["a"]);
        assert_eq!(ids("ceiling(price) eq -2"), ["c"]);
        assert_eq!(ids("-price gt 0"), ["c"]);
    }

    #[test]
    fn string_functions() {
        assert_eq!(ids("startswith(name,'ban')"), ["b"]);
        assert_eq!(ids("endswith(name,'rry')"), ["d"]);
        assert_eq!(ids("substringof('nan',name)"), ["b"]);
        assert_eq!(ids("trim(name) eq 'Apple'"), ["a"]);
        assert_eq!(ids("tolower(trim(name)) eq 'apple'"), ["a"]);
        assert_eq!(ids("toupper(name) eq 'CHERRY'"), ["d"]);
        assert_eq!(ids("length(name) eq 6"), ["b", "d"]);
        assert_eq!(ids("indexof(name,'an') eq 1"), ["b"]);
        assert_eq!(ids("indexof(name,'zz') eq -1"), ["a", "b", "d"]);
        assert_eq!(ids("substring(name,1) eq 'anana'"), ["b"]);
        assert_eq!(ids("substring(name,0,2) eq 'ch'"), ["d"]);
        assert_eq!(ids("replace(name,'a','o') eq 'bonono'"), ["b"]);
        assert_eq!(ids("concat(name,id) eq 'cherryd'"), ["d"]);
    }

    #[test]
    fn unknown_columns_are_errors() {
        let expr = parse_filter("missing eq 1").unwrap();
        let err = compile_filter(&expr, &schema()).unwrap_err();
        assert!(matches!(err, LocalStoreError::UnknownColumn { .. }));
    }

    #[test]
    fn text_is_not_a_condition() {
        let expr = parse_filter("name and done").unwrap();
        assert!(matches!(
            compile_filter(&expr, &schema()),
            Err(LocalStoreError::Filter(_))
        ));
    }
}
