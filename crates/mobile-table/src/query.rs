//! Fluent query builder
//!
//! A [`Query`] is a value: every builder call consumes it and returns the
//! updated query, so a half-built chain can be cloned and continued along
//! two branches without aliasing.
//!
//! ```
//! use mobile_table::{field, Query, QueryOrder};
//!
//! let q = Query::table("todo")
//!     .where_()
//!     .field("age").gt().val(20)
//!     .and().field("name").eq().val("John")
//!     .order_by("Name", QueryOrder::Ascending)
//!     .top(3);
//! assert_eq!(q.filter_text(), "age gt 20 and name eq 'John'");
//! assert_eq!(q.row_set_modifiers(), "&$top=3&$orderby=Name+asc");
//!
//! // Explicit operands are parenthesized
//! let q = Query::new().where_with(field("id").gt().val(1))
//!     .and_with(field("complete").eq().val(true));
//! assert_eq!(q.to_string(), "(id gt 1) and (complete eq true)");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{BinOp, Expr, Function, Literal, UnaryOp};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("filter ends with the dangling operator '{0}'")]
    DanglingOperator(BinOp),

    #[error("filter ends with a dangling {0:?} prefix")]
    DanglingPrefix(UnaryOp),
}

/// Sort direction for `$orderby`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOrder {
    #[default]
    #[serde(alias = "asc")]
    Ascending,
    #[serde(alias = "desc")]
    Descending,
}

impl QueryOrder {
    pub fn keyword(self) -> &'static str {
        match self {
            QueryOrder::Ascending => "asc",
            QueryOrder::Descending => "desc",
        }
    }

    pub fn is_descending(self) -> bool {
        self == QueryOrder::Descending
    }
}

/// Row-set shaping options carried next to the filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSetModifiers {
    pub top: Option<u32>,
    pub skip: Option<u32>,
    pub order_by: Vec<(String, QueryOrder)>,
    pub select: Vec<String>,
    pub inline_count: bool,
    /// User parameters in call order; `None` is sent as `null`.
    pub parameters: Vec<(String, Option<String>)>,
}

impl RowSetModifiers {
    pub fn is_empty(&self) -> bool {
        *self == RowSetModifiers::default()
    }
}

/// Filter expression plus row-set modifiers, optionally bound to a table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    table: Option<String>,
    pub(crate) filter: Option<Expr>,
    pub(crate) pending_op: Option<BinOp>,
    pub(crate) pending_prefix: Vec<UnaryOp>,
    modifiers: RowSetModifiers,
}

/// Start an expression with a field reference.
///
/// # Panics
///
/// Panics if `name` is empty.
#[track_caller]
pub fn field(name: impl Into<String>) -> Query {
    Query::new().field(name)
}

/// Start an expression with a literal value
pub fn val(value: impl Into<Literal>) -> Query {
    Query::new().val(value)
}

// ============ Operand conversions ============

/// Anything usable as a complete operand: literals, expressions and
/// finished sub-queries. Strings are string literals.
pub trait IntoOperand {
    fn into_operand(self) -> Expr;
}

/// Subject of a function call. Strings name a field here, so
/// `to_lower("Description")` is `tolower(Description)`.
pub trait IntoField {
    fn into_field(self) -> Expr;
}

impl IntoOperand for Query {
    #[track_caller]
    fn into_operand(self) -> Expr {
        self.into_operand_expr()
    }
}

impl IntoOperand for Expr {
    fn into_operand(self) -> Expr {
        self
    }
}

macro_rules! literal_operand {
    ($($t:ty),*) => {
        $(impl IntoOperand for $t {
            fn into_operand(self) -> Expr {
                Expr::Literal(self.into())
            }
        })*
    };
}

literal_operand!(
    Literal, &str, String, &String, bool, i8, i16, i32, i64, u8, u16, u32, f32, f64
);

impl<Tz: chrono::TimeZone> IntoOperand for chrono::DateTime<Tz> {
    fn into_operand(self) -> Expr {
        Expr::Literal(self.into())
    }
}

impl<T: Into<Literal>> IntoOperand for Option<T> {
    fn into_operand(self) -> Expr {
        Expr::Literal(self.into())
    }
}

impl IntoField for &str {
    #[track_caller]
    fn into_field(self) -> Expr {
        field_expr(self.to_string())
    }
}

impl IntoField for String {
    #[track_caller]
    fn into_field(self) -> Expr {
        field_expr(self)
    }
}

impl IntoField for Query {
    #[track_caller]
    fn into_field(self) -> Expr {
        self.into_operand_expr()
    }
}

impl IntoField for Expr {
    fn into_field(self) -> Expr {
        self
    }
}

#[track_caller]
fn field_expr(name: String) -> Expr {
    assert!(!name.is_empty(), "field name cannot be empty");
    Expr::Field(name)
}

// ============ Builder ============

macro_rules! binary_operators {
    ($($chain:ident, $with:ident => $op:ident;)*) => {
        $(
            #[doc = concat!("Chained `", stringify!($chain), "`; the right operand comes next.")]
            #[must_use]
            #[track_caller]
            pub fn $chain(self) -> Self {
                self.push_operator(BinOp::$op)
            }

            #[doc = concat!("`", stringify!($chain), "` with an explicit, parenthesized right operand.")]
            #[must_use]
            #[track_caller]
            pub fn $with(self, operand: impl IntoOperand) -> Self {
                self.push_operator(BinOp::$op).push_grouped(operand)
            }
        )*
    };
}

macro_rules! unary_functions {
    ($($method:ident => $func:ident;)*) => {
        $(
            #[must_use]
            #[track_caller]
            pub fn $method(self, subject: impl IntoField) -> Self {
                self.push_operand(Expr::call(Function::$func, vec![subject.into_field()]))
            }
        )*
    };
}

impl Query {
    /// An unbound query, used for sub-expressions
    pub fn new() -> Self {
        Self::default()
    }

    /// A query against the named table
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn modifiers(&self) -> &RowSetModifiers {
        &self.modifiers
    }

    pub(crate) fn modifiers_mut(&mut self) -> &mut RowSetModifiers {
        &mut self.modifiers
    }

    /// The filter expression, if one was set.
    ///
    /// Fails when the chain stops right after an operator.
    pub fn filter(&self) -> Result<Option<&Expr>, QueryError> {
        self.check_complete()?;
        Ok(self.filter.as_ref())
    }

    pub fn into_filter(self) -> Result<Option<Expr>, QueryError> {
        self.check_complete()?;
        Ok(self.filter)
    }

    pub fn is_complete(&self) -> bool {
        self.check_complete().is_ok()
    }

    fn check_complete(&self) -> Result<(), QueryError> {
        if let Some(op) = self.pending_op {
            return Err(QueryError::DanglingOperator(op));
        }
        if let Some(prefix) = self.pending_prefix.first() {
            return Err(QueryError::DanglingPrefix(*prefix));
        }
        Ok(())
    }

    #[track_caller]
    fn into_operand_expr(self) -> Expr {
        if let Err(e) = self.check_complete() {
            panic!("incomplete sub-expression used as an operand: {e}");
        }
        match self.filter {
            Some(expr) => expr,
            None => panic!("empty sub-expression used as an operand"),
        }
    }

    #[track_caller]
    fn push_operand(mut self, operand: Expr) -> Self {
        let operand = self
            .pending_prefix
            .drain(..)
            .rev()
            .fold(operand, |inner, op| Expr::unary(op, inner));
        self.filter = match (self.filter.take(), self.pending_op.take()) {
            (None, None) => Some(operand),
            (Some(left), Some(op)) => Some(left.attach(op, operand)),
            (Some(left), None) => {
                panic!("operand `{operand}` follows `{left}` without an operator in between")
            }
            (None, Some(op)) => panic!("operator '{op}' has no left operand"),
        };
        self
    }

    #[track_caller]
    fn push_grouped(self, operand: impl IntoOperand) -> Self {
        self.push_operand(Expr::group(operand.into_operand()))
    }

    #[track_caller]
    fn push_operator(mut self, op: BinOp) -> Self {
        if let Some(prev) = self.pending_op {
            panic!("operator '{op}' follows operator '{prev}'");
        }
        if !self.pending_prefix.is_empty() {
            panic!("operator '{op}' follows a prefix operator");
        }
        if self.filter.is_none() {
            panic!("operator '{op}' has no left operand");
        }
        self.pending_op = Some(op);
        self
    }

    #[track_caller]
    fn push_prefix(mut self, op: UnaryOp) -> Self {
        if self.filter.is_some() && self.pending_op.is_none() {
            panic!("prefix {op:?} must start an operand");
        }
        self.pending_prefix.push(op);
        self
    }

    // ============ Filter entry points ============

    /// Start the filter by chaining; does not change the query.
    #[must_use]
    pub fn where_(self) -> Self {
        self
    }

    /// Start or replace the filter with a parenthesized sub-expression.
    #[must_use]
    #[track_caller]
    pub fn where_with(mut self, expr: impl IntoOperand) -> Self {
        self.filter = Some(Expr::group(expr.into_operand()));
        self.pending_op = None;
        self.pending_prefix.clear();
        self
    }

    /// Replace the filter with an already built tree, such as one returned
    /// by [`parse_filter`](crate::parse_filter). Renders without added
    /// parentheses.
    #[must_use]
    pub fn with_filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self.pending_op = None;
        self.pending_prefix.clear();
        self
    }

    /// Reference a field.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty, or if an operand is already pending
    /// without an operator.
    #[must_use]
    #[track_caller]
    pub fn field(self, name: impl Into<String>) -> Self {
        let expr = field_expr(name.into());
        self.push_operand(expr)
    }

    /// Add a literal value as the next operand.
    #[must_use]
    #[track_caller]
    pub fn val(self, value: impl Into<Literal>) -> Self {
        self.push_operand(Expr::Literal(value.into()))
    }

    // ============ Operators ============

    binary_operators! {
        and, and_with => And;
        or, or_with => Or;
        eq, eq_with => Eq;
        ne, ne_with => Ne;
        gt, gt_with => Gt;
        ge, ge_with => Ge;
        lt, lt_with => Lt;
        le, le_with => Le;
        add, add_with => Add;
        sub, sub_with => Sub;
        mul, mul_with => Mul;
        div, div_with => Div;
        modulo, modulo_with => Mod;
    }

    /// Chained `not`; applies to the next operand.
    #[must_use]
    #[track_caller]
    pub fn not(self) -> Self {
        self.push_prefix(UnaryOp::Not)
    }

    /// `not (expr)`
    #[must_use]
    #[track_caller]
    pub fn not_with(self, operand: impl IntoOperand) -> Self {
        self.push_operand(Expr::unary(UnaryOp::Not, Expr::group(operand.into_operand())))
    }

    /// Chained arithmetic negation; applies to the next operand.
    #[must_use]
    #[track_caller]
    pub fn negate(self) -> Self {
        self.push_prefix(UnaryOp::Negate)
    }

    // ============ Functions ============

    unary_functions! {
        year => Year;
        month => Month;
        day => Day;
        hour => Hour;
        minute => Minute;
        second => Second;
        floor => Floor;
        ceiling => Ceiling;
        round => Round;
        to_lower => ToLower;
        to_upper => ToUpper;
        trim => Trim;
        length => Length;
    }

    /// `startswith(subject,prefix)`
    #[must_use]
    #[track_caller]
    pub fn starts_with(self, subject: impl IntoField, prefix: impl IntoOperand) -> Self {
        let args = vec![subject.into_field(), prefix.into_operand()];
        self.push_operand(Expr::call(Function::StartsWith, args))
    }

    /// `endswith(subject,suffix)`
    #[must_use]
    #[track_caller]
    pub fn ends_with(self, subject: impl IntoField, suffix: impl IntoOperand) -> Self {
        let args = vec![subject.into_field(), suffix.into_operand()];
        self.push_operand(Expr::call(Function::EndsWith, args))
    }

    /// `substringof(needle,subject)`: true when `needle` occurs in `subject`
    #[must_use]
    #[track_caller]
    pub fn substring_of(self, needle: impl IntoOperand, subject: impl IntoField) -> Self {
        let args = vec![needle.into_operand(), subject.into_field()];
        self.push_operand(Expr::call(Function::SubstringOf, args))
    }

    #[must_use]
    #[track_caller]
    pub fn concat(self, first: impl IntoOperand, second: impl IntoOperand) -> Self {
        let args = vec![first.into_operand(), second.into_operand()];
        self.push_operand(Expr::call(Function::Concat, args))
    }

    /// `indexof(subject,needle)`: 0-based position, `-1` when absent
    #[must_use]
    #[track_caller]
    pub fn index_of(self, subject: impl IntoField, needle: impl IntoOperand) -> Self {
        let args = vec![subject.into_field(), needle.into_operand()];
        self.push_operand(Expr::call(Function::IndexOf, args))
    }

    /// `substring(subject,start)`: the tail from a 0-based position
    #[must_use]
    #[track_caller]
    pub fn substring(self, subject: impl IntoField, start: impl IntoOperand) -> Self {
        let args = vec![subject.into_field(), start.into_operand()];
        self.push_operand(Expr::call(Function::Substring, args))
    }

    /// `substring(subject,start,length)`
    #[must_use]
    #[track_caller]
    pub fn substring_len(
        self,
        subject: impl IntoField,
        start: impl IntoOperand,
        length: impl IntoOperand,
    ) -> Self {
        let args = vec![
            subject.into_field(),
            start.into_operand(),
            length.into_operand(),
        ];
        self.push_operand(Expr::call(Function::Substring, args))
    }

    /// `replace(subject,find,replacement)`
    #[must_use]
    #[track_caller]
    pub fn replace(
        self,
        subject: impl IntoField,
        find: impl IntoOperand,
        replacement: impl IntoOperand,
    ) -> Self {
        let args = vec![
            subject.into_field(),
            find.into_operand(),
            replacement.into_operand(),
        ];
        self.push_operand(Expr::call(Function::Replace, args))
    }

    // ============ Row-set modifiers ============

    /// Project onto the given fields (replaces an earlier selection)
    #[must_use]
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modifiers.select = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Append a sort key; repeated calls accumulate
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, order: QueryOrder) -> Self {
        self.modifiers.order_by.push((field.into(), order));
        self
    }

    /// Skip the first `count` rows. Zero leaves the query unchanged.
    #[must_use]
    pub fn skip(mut self, count: u32) -> Self {
        if count > 0 {
            self.modifiers.skip = Some(count);
        }
        self
    }

    /// Return at most `count` rows. Zero leaves the query unchanged.
    #[must_use]
    pub fn top(mut self, count: u32) -> Self {
        if count > 0 {
            self.modifiers.top = Some(count);
        }
        self
    }

    /// Ask for the total number of matching rows next to the page
    #[must_use]
    pub fn include_inline_count(mut self) -> Self {
        self.modifiers.inline_count = true;
        self
    }

    /// Append a user parameter; `None` is sent as `null`
    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.modifiers
            .parameters
            .push((key.into(), value.map(str::to_string)));
        self
    }
}
