//! Immutable expression trees with closed-form time derivatives.
//!
//! An [`Expr`] is a reference-counted handle to a node. Differentiation builds
//! new nodes and shares unchanged subtrees with the receiver, so cloning an
//! `Expr` is cheap and never copies a tree.
//!
//! The derivative is always taken with respect to time: a variable `x`
//! differentiates to the variable `dx`, `dx` to `ddx`, and so on. Callers bind
//! those names when evaluating a derivative tree.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops;
use std::rc::Rc;
use thiserror::Error;

/// The only way evaluating an expression can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("Variable not found: {name}")]
    VariableNotFound { name: String },
}

/// Values for the variables of an expression, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binding(BTreeMap<String, f64>);

impl Binding {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) -> Option<f64> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Canonical cache key: names in sorted order, values by bit pattern so
    /// that `0.0` and `-0.0` (or distinct NaN payloads) never share an entry.
    pub(crate) fn cache_key(&self) -> BindingKey {
        BindingKey(
            self.0
                .iter()
                .map(|(name, value)| (name.clone(), value.to_bits()))
                .collect(),
        )
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Binding {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(name, value)| (name.into(), value)).collect())
    }
}

impl<S: Into<String>> Extend<(S, f64)> for Binding {
    fn extend<I: IntoIterator<Item = (S, f64)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

impl<const N: usize> From<[(&str, f64); N]> for Binding {
    fn from(entries: [(&str, f64); N]) -> Self {
        entries.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BindingKey(Vec<(String, u64)>);

/// The node variants. Power exponents and trigonometric amplitudes are plain
/// numbers and are never differentiated.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Constant(f64),
    Variable(String),
    Neg(Expr),
    Add(Expr, Expr),
    Sub(Expr, Expr),
    Mul(Expr, Expr),
    Div(Expr, Expr),
    Pow { base: Expr, exponent: f64 },
    Sin { operand: Expr, amplitude: f64 },
    Cos { operand: Expr, amplitude: f64 },
}

struct Node {
    kind: ExprKind,
    // Results of `smart_evaluate`, per binding. Interior mutability keeps
    // `Expr` immutable from the outside but makes it !Sync.
    cache: RefCell<HashMap<BindingKey, f64>>,
}

/// Handle to an immutable expression node.
#[derive(Clone)]
pub struct Expr(Rc<Node>);

impl Expr {
    fn from_kind(kind: ExprKind) -> Self {
        Self(Rc::new(Node {
            kind,
            cache: RefCell::new(HashMap::new()),
        }))
    }

    pub fn constant(value: f64) -> Self {
        Self::from_kind(ExprKind::Constant(value))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::from_kind(ExprKind::Variable(name.into()))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    /// True only for a literal `Constant` node; no numeric folding is attempted.
    pub fn is_constant(&self) -> bool {
        matches!(self.0.kind, ExprKind::Constant(_))
    }

    pub fn add(&self, rhs: impl Into<Expr>) -> Expr {
        add(self, rhs)
    }

    pub fn sub(&self, rhs: impl Into<Expr>) -> Expr {
        sub(self, rhs)
    }

    pub fn mul(&self, rhs: impl Into<Expr>) -> Expr {
        mul(self, rhs)
    }

    pub fn div(&self, rhs: impl Into<Expr>) -> Expr {
        div(self, rhs)
    }

    pub fn pow(&self, exponent: f64) -> Expr {
        pow(self, exponent)
    }

    /// Evaluates the tree against `binding`.
    ///
    /// Fails on the first variable that has no value; no partial result is
    /// produced. Arithmetic follows plain `f64` semantics, so division by zero
    /// yields an infinity and a negative base with a fractional exponent NaN.
    pub fn evaluate(&self, binding: &Binding) -> Result<f64, EvalError> {
        let value = match &self.0.kind {
            ExprKind::Constant(value) => *value,
            ExprKind::Variable(name) => {
                binding
                    .get(name)
                    .ok_or_else(|| EvalError::VariableNotFound { name: name.clone() })?
            }
            ExprKind::Neg(operand) => -operand.evaluate(binding)?,
            ExprKind::Add(left, right) => left.evaluate(binding)? + right.evaluate(binding)?,
            ExprKind::Sub(left, right) => left.evaluate(binding)? - right.evaluate(binding)?,
            ExprKind::Mul(left, right) => left.evaluate(binding)? * right.evaluate(binding)?,
            ExprKind::Div(left, right) => left.evaluate(binding)? / right.evaluate(binding)?,
            ExprKind::Pow { base, exponent } => base.evaluate(binding)?.powf(*exponent),
            ExprKind::Sin { operand, amplitude } => amplitude * operand.evaluate(binding)?.sin(),
            ExprKind::Cos { operand, amplitude } => amplitude * operand.evaluate(binding)?.cos(),
        };
        Ok(value)
    }

    /// Like [`Expr::evaluate`], but remembers the result for this node and
    /// binding. Errors are not cached. Only this node is memoized; children are
    /// evaluated directly on a miss.
    pub fn smart_evaluate(&self, binding: &Binding) -> Result<f64, EvalError> {
        let key = binding.cache_key();
        if let Some(value) = self.0.cache.borrow().get(&key).copied() {
            return Ok(value);
        }
        let value = self.evaluate(binding)?;
        self.0.cache.borrow_mut().insert(key, value);
        Ok(value)
    }

    /// Number of bindings memoized on this node.
    pub fn cached_bindings(&self) -> usize {
        self.0.cache.borrow().len()
    }

    pub fn clear_cache(&self) {
        self.0.cache.borrow_mut().clear();
    }

    /// Symbolic time derivative.
    ///
    /// `Add`, `Sub` and `Mul` take a shortcut when one of their direct
    /// children is a literal `Constant` node. The check is on the child's
    /// variant only: a constant buried deeper in the tree (`2 * x + y`) goes
    /// through the general rule.
    pub fn derivative(&self) -> Expr {
        match &self.0.kind {
            ExprKind::Constant(_) => Expr::constant(0.0),
            ExprKind::Variable(name) => Expr::var(format!("d{name}")),
            ExprKind::Neg(operand) => neg(operand.derivative()),
            ExprKind::Add(left, right) => {
                if left.is_constant() {
                    right.derivative()
                } else if right.is_constant() {
                    left.derivative()
                } else {
                    add(left.derivative(), right.derivative())
                }
            }
            ExprKind::Sub(left, right) => {
                if left.is_constant() {
                    neg(right.derivative())
                } else if right.is_constant() {
                    left.derivative()
                } else {
                    sub(left.derivative(), right.derivative())
                }
            }
            ExprKind::Mul(left, right) => {
                if left.is_constant() {
                    mul(right.derivative(), left)
                } else if right.is_constant() {
                    mul(left.derivative(), right)
                } else {
                    add(
                        mul(left.derivative(), right),
                        mul(left, right.derivative()),
                    )
                }
            }
            ExprKind::Div(left, right) => sub(
                div(left.derivative(), right),
                mul(mul(left, right.derivative()), pow(right, -2.0)),
            ),
            ExprKind::Pow { base, exponent } => mul(
                mul(*exponent, pow(base, exponent - 1.0)),
                base.derivative(),
            ),
            ExprKind::Sin { operand, amplitude } => mul(
                *amplitude,
                mul(cos(operand), operand.derivative()),
            ),
            ExprKind::Cos { operand, amplitude } => mul(
                *amplitude,
                mul(neg(sin(operand)), operand.derivative()),
            ),
        }
    }

    /// Node count of the subtree: 1 per leaf, 1 plus children per interior node.
    pub fn operation_count(&self) -> usize {
        match &self.0.kind {
            ExprKind::Constant(_) | ExprKind::Variable(_) => 1,
            ExprKind::Neg(operand)
            | ExprKind::Pow { base: operand, .. }
            | ExprKind::Sin { operand, .. }
            | ExprKind::Cos { operand, .. } => 1 + operand.operation_count(),
            ExprKind::Add(left, right)
            | ExprKind::Sub(left, right)
            | ExprKind::Mul(left, right)
            | ExprKind::Div(left, right) => 1 + left.operation_count() + right.operation_count(),
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0.kind == other.0.kind
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0.kind, f)
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::constant(value)
    }
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

// --- Factories ---

pub fn constant(value: f64) -> Expr {
    Expr::constant(value)
}

pub fn var(name: impl Into<String>) -> Expr {
    Expr::var(name)
}

pub fn neg(operand: impl Into<Expr>) -> Expr {
    Expr::from_kind(ExprKind::Neg(operand.into()))
}

pub fn add(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    Expr::from_kind(ExprKind::Add(left.into(), right.into()))
}

pub fn sub(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    Expr::from_kind(ExprKind::Sub(left.into(), right.into()))
}

pub fn mul(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    Expr::from_kind(ExprKind::Mul(left.into(), right.into()))
}

pub fn div(left: impl Into<Expr>, right: impl Into<Expr>) -> Expr {
    Expr::from_kind(ExprKind::Div(left.into(), right.into()))
}

pub fn pow(base: impl Into<Expr>, exponent: f64) -> Expr {
    Expr::from_kind(ExprKind::Pow {
        base: base.into(),
        exponent,
    })
}

pub fn sin(operand: impl Into<Expr>) -> Expr {
    sin_scaled(operand, 1.0)
}

/// `amplitude * sin(operand)`
pub fn sin_scaled(operand: impl Into<Expr>, amplitude: f64) -> Expr {
    Expr::from_kind(ExprKind::Sin {
        operand: operand.into(),
        amplitude,
    })
}

pub fn cos(operand: impl Into<Expr>) -> Expr {
    cos_scaled(operand, 1.0)
}

/// `amplitude * cos(operand)`
pub fn cos_scaled(operand: impl Into<Expr>, amplitude: f64) -> Expr {
    Expr::from_kind(ExprKind::Cos {
        operand: operand.into(),
        amplitude,
    })
}

// --- Operator overloads ---
//
// Implemented on `&Expr` only. An owned `Expr: Add` impl would shadow the
// inherent `add(&self, ..)` in method-call position and move the receiver.

macro_rules! impl_binary_op {
    ($op:ident, $method:ident, $factory:ident) => {
        impl<R: Into<Expr>> ops::$op<R> for &Expr {
            type Output = Expr;

            fn $method(self, rhs: R) -> Expr {
                $factory(self, rhs)
            }
        }

        impl ops::$op<&Expr> for f64 {
            type Output = Expr;

            fn $method(self, rhs: &Expr) -> Expr {
                $factory(self, rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, add);
impl_binary_op!(Sub, sub, sub);
impl_binary_op!(Mul, mul, mul);
impl_binary_op!(Div, div, div);

impl ops::Neg for &Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        neg(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Expr {
        var("x")
    }

    /// Central difference of `expr` along the time-derivative direction:
    /// every variable `v` moves by `h * binding["d" + v]`.
    fn directional_difference(expr: &Expr, binding: &Binding, h: f64) -> f64 {
        let shifted = |sign: f64| -> Binding {
            binding
                .iter()
                .map(|(name, value)| {
                    let rate = binding.get(&format!("d{name}")).unwrap_or(0.0);
                    (name.to_string(), value + sign * h * rate)
                })
                .collect()
        };
        let forward = expr.evaluate(&shifted(1.0)).expect("forward");
        let backward = expr.evaluate(&shifted(-1.0)).expect("backward");
        (forward - backward) / (2.0 * h)
    }

    #[test]
    fn constant_ignores_binding() {
        assert_eq!(constant(2.5).evaluate(&Binding::new()), Ok(2.5));
        assert_eq!(constant(2.5).evaluate(&Binding::from([("x", 1.0)])), Ok(2.5));
    }

    #[test]
    fn missing_variable_is_reported_by_name() {
        let expr = add(x(), mul(var("y"), 2.0));
        let err = expr
            .evaluate(&Binding::from([("x", 1.0)]))
            .expect_err("y is unbound");
        assert_eq!(err, EvalError::VariableNotFound { name: "y".into() });
        assert_eq!(err.to_string(), "Variable not found: y");

        let value = expr
            .evaluate(&Binding::from([("x", 1.0), ("y", 4.0)]))
            .expect("fully bound");
        assert_eq!(value, 9.0);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let expr = div(sin_scaled(x(), 3.0), add(pow(var("y"), 1.5), cos(x())));
        let binding = Binding::from([("x", 0.7), ("y", 2.3)]);
        let first = expr.evaluate(&binding).expect("bound");
        for _ in 0..10 {
            assert_eq!(expr.evaluate(&binding).expect("bound").to_bits(), first.to_bits());
        }
    }

    #[test]
    fn ieee_special_values_pass_through() {
        let binding = Binding::from([("x", 0.0)]);
        assert_eq!(div(1.0, x()).evaluate(&binding), Ok(f64::INFINITY));
        assert_eq!(div(-1.0, x()).evaluate(&binding), Ok(f64::NEG_INFINITY));
        let root = pow(x(), 0.5)
            .evaluate(&Binding::from([("x", -4.0)]))
            .expect("bound");
        assert!(root.is_nan());
    }

    #[test]
    fn square_derivative_matches_product_rule() {
        let expr = x().mul(x());
        let binding = Binding::from([("x", 3.0), ("dx", 1.0)]);
        assert_eq!(expr.derivative().evaluate(&binding), Ok(6.0));
    }

    #[test]
    fn power_of_variable_end_to_end() {
        let expr = pow(x(), 2.0);
        assert_eq!(expr.evaluate(&Binding::from([("x", 3.0)])), Ok(9.0));
        let derivative = expr.derivative();
        assert_eq!(
            derivative.evaluate(&Binding::from([("x", 3.0), ("dx", 1.0)])),
            Ok(6.0)
        );
        assert_eq!(
            derivative,
            mul(mul(2.0, pow(x(), 1.0)), var("dx"))
        );
    }

    #[test]
    fn variable_derivative_prefixes_name() {
        assert_eq!(x().derivative(), var("dx"));
        assert_eq!(x().derivative().derivative(), var("ddx"));
        assert_eq!(constant(7.0).derivative(), constant(0.0));
    }

    #[test]
    fn constant_shortcut_is_syntactic() {
        assert_eq!(add(5.0, x()).derivative(), var("dx"));
        assert_eq!(add(x(), 5.0).derivative(), var("dx"));
        assert_eq!(sub(5.0, x()).derivative(), neg(var("dx")));
        assert_eq!(sub(x(), 5.0).derivative(), var("dx"));
        assert_eq!(mul(3.0, x()).derivative(), mul(var("dx"), 3.0));
        assert_eq!(mul(x(), 3.0).derivative(), mul(var("dx"), 3.0));

        // The constant sits one level down, so the general rule applies.
        let nested = add(mul(2.0, x()), var("y"));
        assert_eq!(
            nested.derivative(),
            add(mul(var("dx"), 2.0), var("dy"))
        );

        // Division never shortcuts, even by a constant.
        let halved = div(x(), 2.0);
        assert_eq!(
            halved.derivative(),
            sub(
                div(var("dx"), 2.0),
                mul(mul(x(), constant(0.0)), pow(2.0, -2.0))
            )
        );
    }

    #[test]
    fn trigonometric_derivatives_keep_amplitude_outside() {
        let y = var("y");
        let op = mul(x(), &y);
        let d_op = add(mul(var("dx"), &y), mul(x(), var("dy")));

        let sine = sin_scaled(&op, 2.0).derivative();
        assert_eq!(sine, mul(constant(2.0), mul(cos(&op), d_op.clone())));
        assert_eq!(sine.operation_count(), 1 + 1 + (1 + 4 + 7));

        let cosine = cos_scaled(&op, 0.5).derivative();
        assert_eq!(cosine, mul(constant(0.5), mul(neg(sin(&op)), d_op)));
        assert_eq!(cosine.operation_count(), 1 + 1 + (1 + 5 + 7));

        // A unit amplitude is still an explicit factor.
        assert_eq!(sin(x()).derivative(), mul(1.0, mul(cos(x()), var("dx"))));
        assert_ne!(
            sin_scaled(x(), 3.0).derivative(),
            mul(cos_scaled(x(), 3.0), var("dx"))
        );
    }

    #[test]
    fn negation_and_general_difference_shapes() {
        let negated = neg(sin(x())).derivative();
        assert_eq!(negated, neg(mul(1.0, mul(cos(x()), var("dx")))));
        assert_eq!(negated.operation_count(), 1 + 6);

        let difference = sub(x(), var("y")).derivative();
        assert_eq!(difference, sub(var("dx"), var("dy")));
        assert_eq!(difference.operation_count(), 3);

        let nested = sub(mul(x(), x()), sin(var("y"))).derivative();
        assert_eq!(
            nested,
            sub(
                add(mul(var("dx"), x()), mul(x(), var("dx"))),
                mul(1.0, mul(cos(var("y")), var("dy")))
            )
        );
        assert_eq!(nested.operation_count(), 1 + 7 + 6);
    }

    #[test]
    fn operation_count_counts_nodes() {
        assert_eq!(x().operation_count(), 1);
        assert_eq!(mul(x(), add(1.0, var("y"))).operation_count(), 5);
        assert_eq!(sin_scaled(pow(x(), 2.0), 4.0).operation_count(), 3);
        assert_eq!(neg(x()).derivative().operation_count(), 2);
    }

    #[test]
    fn derivative_does_not_mutate_receiver() {
        let expr = mul(sin(x()), var("y"));
        let before = expr.clone();
        let _ = expr.derivative().derivative();
        assert_eq!(expr, before);
        assert_eq!(expr.operation_count(), 4);
    }

    #[test]
    fn derivative_shares_operands() {
        let left = sin(x());
        let right = var("y");
        let product = mul(&left, &right);
        match product.derivative().kind() {
            ExprKind::Add(first, second) => {
                let (ExprKind::Mul(_, r), ExprKind::Mul(l, _)) = (first.kind(), second.kind())
                else {
                    panic!("product rule should produce two products");
                };
                assert!(Rc::ptr_eq(&r.0, &right.0));
                assert!(Rc::ptr_eq(&l.0, &left.0));
            }
            other => panic!("unexpected derivative shape: {other:?}"),
        }
    }

    #[test]
    fn first_derivative_matches_finite_difference() {
        let y = var("y");
        let exprs = [
            div(sin_scaled(x(), 2.0), add(pow(&y, 2.0), 1.0)),
            mul(cos(mul(&x(), &y)), pow(x(), -1.5)),
            sub(3.0, neg(div(&y, x()))),
            cos_scaled(sub(x(), &y), 0.5),
        ];
        let binding = Binding::from([("x", 1.3), ("y", -0.4), ("dx", 0.8), ("dy", 1.7)]);
        for expr in &exprs {
            let analytic = expr.derivative().evaluate(&binding).expect("bound");
            let numeric = directional_difference(expr, &binding, 1e-6);
            assert!(
                (analytic - numeric).abs() < 1e-4,
                "{expr:?}: analytic {analytic}, numeric {numeric}"
            );
        }
    }

    #[test]
    fn second_derivative_matches_second_difference() {
        // x(t) = x0 + v t + a t^2 / 2, so d/dt of the second derivative tree
        // is bound through dx = v and ddx = a.
        let expr = mul(sin(x()), pow(x(), 3.0));
        let (x0, v, a) = (0.9, 1.2, -0.5);
        let binding = Binding::from([("x", x0), ("dx", v), ("ddx", a)]);
        let second = expr.derivative().derivative();
        let analytic = second.evaluate(&binding).expect("bound");
        assert_eq!(
            second.evaluate(&binding).expect("bound").to_bits(),
            analytic.to_bits()
        );

        let at = |t: f64| {
            expr.evaluate(&Binding::from([("x", x0 + v * t + 0.5 * a * t * t)]))
                .expect("bound")
        };
        let h = 1e-3;
        let numeric = (at(h) - 2.0 * at(0.0) + at(-h)) / (h * h);
        assert!((analytic - numeric).abs() < 1e-4, "{analytic} vs {numeric}");
    }

    #[test]
    fn smart_evaluate_matches_evaluate_and_caches() {
        let expr = add(mul(&x(), &x()), sin(var("y")));
        let first = Binding::from([("x", 2.0), ("y", 0.25)]);
        let second = Binding::from([("x", -0.0), ("y", 0.25)]);

        assert_eq!(expr.smart_evaluate(&first), expr.evaluate(&first));
        assert_eq!(expr.cached_bindings(), 1);
        assert_eq!(expr.smart_evaluate(&first), expr.evaluate(&first));
        assert_eq!(expr.cached_bindings(), 1);

        assert_eq!(expr.smart_evaluate(&second), expr.evaluate(&second));
        assert_eq!(expr.cached_bindings(), 2);

        expr.clear_cache();
        assert_eq!(expr.cached_bindings(), 0);
    }

    #[test]
    fn smart_evaluate_does_not_cache_errors() {
        let expr = add(x(), var("y"));
        let partial = Binding::from([("x", 1.0)]);
        assert!(expr.smart_evaluate(&partial).is_err());
        assert_eq!(expr.cached_bindings(), 0);
    }

    #[test]
    fn cache_key_ignores_insertion_order() {
        let expr = sub(x(), var("y"));
        let mut forward = Binding::new();
        forward.insert("x", 1.0);
        forward.insert("y", 2.0);
        let reversed = Binding::new().with("y", 2.0).with("x", 1.0);
        expr.smart_evaluate(&forward).expect("bound");
        expr.smart_evaluate(&reversed).expect("bound");
        assert_eq!(expr.cached_bindings(), 1);
    }

    #[test]
    fn operators_build_same_nodes_as_factories() {
        let x = x();
        let y = var("y");
        assert_eq!(&x + &y, add(&x, &y));
        assert_eq!(&x - 1.0, sub(&x, 1.0));
        assert_eq!(2.0 * &x, mul(2.0, &x));
        assert_eq!(&x / (&y * 3.0), div(&x, mul(&y, 3.0)));
        assert_eq!(-&x, neg(&x));
        assert_eq!(x.add(1.0).pow(2.0), pow(add(&x, 1.0), 2.0));
    }
}
