//! Successive time derivatives of an expression and their evaluation.
//!
//! A chain `[e, e', e'', ...]` is built once, ahead of time. Evaluating it
//! threads the numeric value of each order into the binding under the
//! conventional name (`dd` + name for the second derivative, `ddd` + name for
//! the third, ...) before evaluating the next tree, since the tree of order
//! `k + 1` refers to the values of order `k`.

use crate::expr::{Binding, BindingKey, EvalError, Expr};
use anyhow::{bail, Context, Result};
use std::cell::RefCell;
use tracing::{debug, trace};

/// Binding key for the `order`-th time derivative of `name`.
pub fn derivative_name(name: &str, order: usize) -> String {
    let mut key = "d".repeat(order);
    key.push_str(name);
    key
}

/// Returns `[expr, expr', ..., expr^(order)]`, `order + 1` trees in total.
pub fn derivative_chain(expr: &Expr, order: usize) -> Vec<Expr> {
    let mut chain = Vec::with_capacity(order + 1);
    let mut current = expr.clone();
    for _ in 0..order {
        let next = current.derivative();
        chain.push(current);
        current = next;
    }
    chain.push(current);
    chain
}

/// Evaluates a chain for a single coordinate.
///
/// `chain[0]` must be the derivative of order `lead_order` of `coordinate`;
/// each value is bound as `derivative_name(coordinate, lead_order + k)` before
/// `chain[k + 1]` is evaluated. This only suffices when the trees do not refer
/// to higher derivatives of other coordinates; see [`DerivativeTable`] for
/// coupled systems.
pub fn evaluate_chain(
    chain: &[Expr],
    coordinate: &str,
    lead_order: usize,
    base: &Binding,
) -> Result<Vec<f64>, EvalError> {
    let mut binding = base.clone();
    let mut values = Vec::with_capacity(chain.len());
    for (offset, expr) in chain.iter().enumerate() {
        let value = expr.evaluate(&binding)?;
        binding.insert(derivative_name(coordinate, lead_order + offset), value);
        values.push(value);
    }
    Ok(values)
}

/// Derivative chains for a set of coupled coordinates.
///
/// Row `k` of the table holds, for every coordinate, the tree of its
/// derivative of order `lead_order + k`. Evaluation proceeds row by row: all
/// coordinates of a row are evaluated against the same binding, then the row's
/// values are bound before the next row.
#[derive(Debug, Clone)]
pub struct DerivativeTable {
    coordinates: Vec<String>,
    lead_order: usize,
    rows: Vec<Vec<Expr>>,
    memoize: bool,
    // Key of the base binding the memoized results belong to.
    last_base: RefCell<Option<BindingKey>>,
}

impl DerivativeTable {
    /// `leads[i]` is the derivative of order `lead_order` of `coordinates[i]`
    /// (an acceleration for `lead_order == 2`). Chains are extended up to
    /// `max_order`.
    pub fn new(
        coordinates: Vec<String>,
        leads: Vec<Expr>,
        lead_order: usize,
        max_order: usize,
        memoize: bool,
    ) -> Result<Self> {
        if coordinates.is_empty() {
            bail!("Derivative table needs at least one coordinate.");
        }
        if coordinates.len() != leads.len() {
            bail!(
                "Coordinate count mismatch. Expected {} expressions, got {}.",
                coordinates.len(),
                leads.len()
            );
        }
        if max_order < lead_order {
            bail!(
                "max_order ({}) must be at least the lead order ({}).",
                max_order,
                lead_order
            );
        }
        for (i, name) in coordinates.iter().enumerate() {
            if coordinates[..i].contains(name) {
                bail!("Duplicate coordinate name: {}", name);
            }
        }
        // Orders 1..=max_order are all bound under generated names at
        // evaluation time, so none may shadow a coordinate.
        for name in &coordinates {
            for other in &coordinates {
                let shadowed = (1..=max_order).find(|&k| derivative_name(other, k) == *name);
                if let Some(order) = shadowed {
                    bail!(
                        "Coordinate name {} collides with the order {} derivative of {}.",
                        name,
                        order,
                        other
                    );
                }
            }
        }

        let depth = max_order - lead_order;
        let chains: Vec<Vec<Expr>> = leads
            .iter()
            .map(|lead| derivative_chain(lead, depth))
            .collect();

        let mut rows = vec![Vec::with_capacity(coordinates.len()); depth + 1];
        for chain in chains {
            for (row, expr) in rows.iter_mut().zip(chain) {
                row.push(expr);
            }
        }

        let table = Self {
            coordinates,
            lead_order,
            rows,
            memoize,
            last_base: RefCell::new(None),
        };
        for (i, name) in table.coordinates.iter().enumerate() {
            debug!(
                coordinate = %name,
                lead_order,
                max_order,
                operation_counts = ?table.rows.iter().map(|row| row[i].operation_count()).collect::<Vec<_>>(),
                "built derivative chain"
            );
        }
        Ok(table)
    }

    pub fn coordinates(&self) -> &[String] {
        &self.coordinates
    }

    pub fn lead_order(&self) -> usize {
        self.lead_order
    }

    pub fn max_order(&self) -> usize {
        self.lead_order + self.rows.len() - 1
    }

    pub fn memoize(&self) -> bool {
        self.memoize
    }

    /// Tree of the derivative of order `order` of coordinate `index`.
    pub fn expr(&self, index: usize, order: usize) -> Option<&Expr> {
        let row = order.checked_sub(self.lead_order)?;
        self.rows.get(row)?.get(index)
    }

    /// `operation_count` of every tree, indexed `[coordinate][order - lead_order]`.
    pub fn operation_counts(&self) -> Vec<Vec<usize>> {
        (0..self.coordinates.len())
            .map(|i| self.rows.iter().map(|row| row[i].operation_count()).collect())
            .collect()
    }

    /// Drops every tree's memoized results.
    pub fn clear_caches(&self) {
        for expr in self.rows.iter().flatten() {
            expr.clear_cache();
        }
    }

    /// Total number of memoized results across all trees.
    pub fn cached_bindings(&self) -> usize {
        self.rows.iter().flatten().map(Expr::cached_bindings).sum()
    }

    /// Evaluates orders `lead_order..=order` for every coordinate.
    ///
    /// The result is indexed `[order - lead_order][coordinate]`. `base` must
    /// bind every lower-order name the lead trees use (positions and
    /// velocities for second-order systems).
    ///
    /// With memoization, results from an earlier evaluation are kept only when
    /// `base` is unchanged, so each tree holds at most one entry.
    pub fn evaluate(&self, base: &Binding, order: usize) -> Result<Vec<Vec<f64>>> {
        if order < self.lead_order || order > self.max_order() {
            bail!(
                "Requested derivative order {} outside the table range {}..={}.",
                order,
                self.lead_order,
                self.max_order()
            );
        }

        if self.memoize {
            let key = base.cache_key();
            if self.last_base.borrow().as_ref() != Some(&key) {
                self.clear_caches();
                *self.last_base.borrow_mut() = Some(key);
            }
        }

        let mut binding = base.clone();
        let mut levels = Vec::with_capacity(order - self.lead_order + 1);
        for (offset, row) in self.rows[..=order - self.lead_order].iter().enumerate() {
            let level_order = self.lead_order + offset;
            let mut values = Vec::with_capacity(row.len());
            for (expr, name) in row.iter().zip(&self.coordinates) {
                let result = if self.memoize {
                    expr.smart_evaluate(&binding)
                } else {
                    expr.evaluate(&binding)
                };
                let value = result.with_context(|| {
                    format!("Failed to evaluate order {} derivative of {}", level_order, name)
                })?;
                values.push(value);
            }
            trace!(order = level_order, ?values, "evaluated derivative level");
            for (name, value) in self.coordinates.iter().zip(&values) {
                binding.insert(derivative_name(name, level_order), *value);
            }
            levels.push(values);
        }
        Ok(levels)
    }
}
