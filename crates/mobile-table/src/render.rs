//! OData rendering
//!
//! Filter text comes from the `Display` impls of the expression tree. The
//! row-set modifier string comes from [`RowSetModifiers`]. Filter text is
//! never URL-encoded; modifier values always are.

use std::fmt::{self, Display, Write};

use crate::ast::{BinOp, Expr, Function, Literal, UnaryOp};
use crate::query::{Query, QueryOrder, RowSetModifiers};

/// Timestamp layout used on the wire and in local Date columns
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

// ============ Display (filter text) ============

impl Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "'{}'", escape_string(s)),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Float(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    write!(f, "{n:.1}")
                } else {
                    write!(f, "{}", n)
                }
            }
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Date(d) => write!(f, "'{}'", d.format(DATE_FORMAT)),
            Literal::Null => write!(f, "null"),
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Not => "not ",
            UnaryOp::Negate => "-",
        };
        f.write_str(s)
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::Field(name) => f.write_str(name),
            Expr::UnaryOp(op, operand) => write!(f, "{}{}", op, operand),
            Expr::BinaryOp(left, op, right) => write!(f, "{} {} {}", left, op, right),
            Expr::Call(func, args) => {
                write!(f, "{}(", func)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_char(')')
            }
            Expr::Group(inner) => write!(f, "({})", inner),
        }
    }
}

fn escape_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Filter text of the query, or the empty string when no filter was set.
///
/// A chain that stops after an operator renders the dangling keyword, so the
/// text shows where it was cut off.
impl Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(expr) = &self.filter {
            write!(f, "{}", expr)?;
        }
        if let Some(op) = self.pending_op {
            write!(f, " {}", op)?;
        }
        for prefix in &self.pending_prefix {
            write!(f, " {}", prefix.to_string().trim_end())?;
        }
        Ok(())
    }
}

impl Query {
    /// Rendered filter text (`""` without a filter)
    pub fn filter_text(&self) -> String {
        self.to_string()
    }

    /// Rendered row-set modifier query string (`""` without modifiers)
    pub fn row_set_modifiers(&self) -> String {
        self.modifiers().to_string()
    }
}

// ============ Row-set modifiers ============

impl Display for QueryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Segments are written in a fixed order: inline count, `$top`, `$skip`,
/// `$orderby`, `$select`, then user parameters in call order.
impl Display for RowSetModifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inline_count {
            f.write_str("&$inlinecount=allpages")?;
        }
        if let Some(top) = self.top {
            write!(f, "&$top={}", top)?;
        }
        if let Some(skip) = self.skip {
            write!(f, "&$skip={}", skip)?;
        }
        if !self.order_by.is_empty() {
            let joined = self
                .order_by
                .iter()
                .map(|(field, order)| format!("{} {}", field, order))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "&$orderby={}", form_encode(&joined))?;
        }
        if !self.select.is_empty() {
            write!(f, "&$select={}", form_encode(&self.select.join(",")))?;
        }
        for (key, value) in &self.parameters {
            let value = value.as_deref().unwrap_or("null");
            write!(f, "&{}={}", form_encode(key), form_encode(value))?;
        }
        Ok(())
    }
}

/// `application/x-www-form-urlencoded` encoding of a single value.
///
/// ASCII alphanumerics and `.-*_` pass through, space becomes `+`, every
/// other byte of the UTF-8 encoding becomes `%XX`.
pub fn form_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'*' | b'_' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => {
                let _ = write!(out, "%{:02X}", b);
            }
        }
    }
    out
}
