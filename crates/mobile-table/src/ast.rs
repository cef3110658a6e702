//! Filter expression tree
//!
//! Nodes are immutable once built. The query builder grows a tree by wrapping
//! the accumulated expression, never by editing a node in place.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Literal values
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    Null,
}

/// Prefix operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    /// OData keyword
    pub fn keyword(self) -> &'static str {
        match self {
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Mod => "mod",
        }
    }

    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 5,
        }
    }

    pub fn is_comparison(self) -> bool {
        self.precedence() == 3
    }
}

/// OData functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Floor,
    Ceiling,
    Round,
    StartsWith,
    EndsWith,
    SubstringOf,
    Concat,
    IndexOf,
    Substring,
    Replace,
    ToLower,
    ToUpper,
    Trim,
    Length,
}

impl Function {
    pub const ALL: [Function; 20] = [
        Function::Year,
        Function::Month,
        Function::Day,
        Function::Hour,
        Function::Minute,
        Function::Second,
        Function::Floor,
        Function::Ceiling,
        Function::Round,
        Function::StartsWith,
        Function::EndsWith,
        Function::SubstringOf,
        Function::Concat,
        Function::IndexOf,
        Function::Substring,
        Function::Replace,
        Function::ToLower,
        Function::ToUpper,
        Function::Trim,
        Function::Length,
    ];

    /// Name as it appears in filter text
    pub fn name(self) -> &'static str {
        match self {
            Function::Year => "year",
            Function::Month => "month",
            Function::Day => "day",
            Function::Hour => "hour",
            Function::Minute => "minute",
            Function::Second => "second",
            Function::Floor => "floor",
            Function::Ceiling => "ceiling",
            Function::Round => "round",
            Function::StartsWith => "startswith",
            Function::EndsWith => "endswith",
            Function::SubstringOf => "substringof",
            Function::Concat => "concat",
            Function::IndexOf => "indexof",
            Function::Substring => "substring",
            Function::Replace => "replace",
            Function::ToLower => "tolower",
            Function::ToUpper => "toupper",
            Function::Trim => "trim",
            Function::Length => "length",
        }
    }

    pub fn from_name(name: &str) -> Option<Function> {
        Function::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Accepted argument counts (inclusive)
    pub fn arity(self) -> (usize, usize) {
        match self {
            Function::StartsWith
            | Function::EndsWith
            | Function::SubstringOf
            | Function::Concat
            | Function::IndexOf => (2, 2),
            Function::Substring => (2, 3),
            Function::Replace => (3, 3),
            _ => (1, 1),
        }
    }
}

/// Filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Field(String),
    UnaryOp(UnaryOp, Box<Expr>),
    BinaryOp(Box<Expr>, BinOp, Box<Expr>),
    Call(Function, Vec<Expr>),
    /// Sub-expression supplied as an explicit argument; renders inside parentheses.
    Group(Box<Expr>),
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn lit(value: impl Into<Literal>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binop(left: Expr, op: BinOp, right: Expr) -> Self {
        Expr::BinaryOp(Box::new(left), op, Box::new(right))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::UnaryOp(op, Box::new(operand))
    }

    pub fn group(inner: Expr) -> Self {
        Expr::Group(Box::new(inner))
    }

    pub fn call(function: Function, args: Vec<Expr>) -> Self {
        Expr::Call(function, args)
    }

    /// Attach `op right` to this tree as if the operator had been read
    /// left to right in filter text.
    ///
    /// The new node descends the right spine past every operator that binds
    /// looser than `op`, so `a or b` + `and c` becomes `a or (b and c)` in
    /// tree form while the rendered text stays flat. Groups, unary nodes and
    /// calls are opaque.
    pub fn attach(self, op: BinOp, right: Expr) -> Expr {
        match self {
            Expr::BinaryOp(l, existing, r) if existing.precedence() < op.precedence() => {
                Expr::BinaryOp(l, existing, Box::new(r.attach(op, right)))
            }
            other => Expr::binop(other, op, right),
        }
    }
}

/// Parse an ISO-8601 timestamp. Zone-less text is taken as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

// ============ Literal conversions ============

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_string())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::String(s)
    }
}

impl From<&String> for Literal {
    fn from(s: &String) -> Self {
        Literal::String(s.clone())
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

macro_rules! int_literal {
    ($($t:ty),*) => {
        $(impl From<$t> for Literal {
            fn from(n: $t) -> Self {
                Literal::Int(n as i64)
            }
        })*
    };
}

int_literal!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Literal {
    fn from(n: f32) -> Self {
        Literal::Float(n as f64)
    }
}

impl From<f64> for Literal {
    fn from(n: f64) -> Self {
        Literal::Float(n)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for Literal {
    fn from(d: DateTime<Tz>) -> Self {
        Literal::Date(d.with_timezone(&Utc))
    }
}

impl<T: Into<Literal>> From<Option<T>> for Literal {
    fn from(v: Option<T>) -> Self {
        v.map_or(Literal::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str) -> Expr {
        Expr::field(name)
    }

    #[test]
    fn attach_honors_precedence() {
        // a or b, then `and c` binds to b
        let tree = Expr::binop(f("a"), BinOp::Or, f("b")).attach(BinOp::And, f("c"));
        let Expr::BinaryOp(_, BinOp::Or, right) = tree else {
            panic!("expected or at the root");
        };
        assert!(matches!(*right, Expr::BinaryOp(_, BinOp::And, _)));

        // a and b, then `or c` wraps the whole tree
        let tree = Expr::binop(f("a"), BinOp::And, f("b")).attach(BinOp::Or, f("c"));
        assert!(matches!(tree, Expr::BinaryOp(_, BinOp::Or, _)));
    }

    #[test]
    fn attach_is_left_associative_at_equal_precedence() {
        let tree = Expr::binop(f("a"), BinOp::Sub, f("b")).attach(BinOp::Add, f("c"));
        let Expr::BinaryOp(left, BinOp::Add, _) = tree else {
            panic!("expected add at the root");
        };
        assert!(matches!(*left, Expr::BinaryOp(_, BinOp::Sub, _)));
    }

    #[test]
    fn attach_does_not_enter_groups() {
        let grouped = Expr::group(Expr::binop(f("a"), BinOp::Or, f("b")));
        let tree = grouped.attach(BinOp::And, f("c"));
        let Expr::BinaryOp(left, BinOp::And, _) = tree else {
            panic!("expected and at the root");
        };
        assert!(matches!(*left, Expr::Group(_)));
    }

    #[test]
    fn function_names_roundtrip() {
        for func in Function::ALL {
            assert_eq!(Function::from_name(func.name()), Some(func));
        }
        assert_eq!(Function::from_name("nosuch"), None);
    }

    #[test]
    fn dates_are_stored_in_utc() {
        let offset = chrono::FixedOffset::east_opt(3 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(1986, 6, 30, 3, 0, 0).unwrap();
        let Literal::Date(d) = Literal::from(local) else {
            panic!("expected date literal");
        };
        assert_eq!(d, Utc.with_ymd_and_hms(1986, 6, 30, 0, 0, 0).unwrap());
    }
}
