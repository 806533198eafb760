use crate::chain::{derivative_name, DerivativeTable};
use crate::expr::{Binding, Expr};
use crate::traits::SecondOrderSystem;
use anyhow::{bail, Result};

/// A concrete implementation of `SecondOrderSystem` backed by acceleration
/// expressions. Derivative chains are built once at construction.
#[derive(Debug, Clone)]
pub struct ExpressionSystem {
    table: DerivativeTable,
    velocity_names: Vec<String>,
}

impl ExpressionSystem {
    /// `accelerations[i]` is the second time derivative of `coordinates[i]`,
    /// written in terms of the coordinates and their `d`-prefixed velocities.
    /// With `memoize`, evaluation goes through each tree's binding cache.
    ///
    /// A coordinate may not be named like a generated derivative of another
    /// (`dx` next to `x`); such systems are rejected.
    pub fn new(
        coordinates: Vec<String>,
        accelerations: Vec<Expr>,
        max_order: usize,
        memoize: bool,
    ) -> Result<Self> {
        let velocity_names = coordinates
            .iter()
            .map(|name| derivative_name(name, 1))
            .collect();
        let table = DerivativeTable::new(coordinates, accelerations, 2, max_order, memoize)?;
        Ok(Self {
            table,
            velocity_names,
        })
    }

    pub fn table(&self) -> &DerivativeTable {
        &self.table
    }

    /// Binding of positions under the coordinate names and velocities under
    /// their `d`-prefixed names.
    pub fn base_binding(&self, positions: &[f64], velocities: &[f64]) -> Result<Binding> {
        let dim = self.dimension();
        if positions.len() != dim || velocities.len() != dim {
            bail!(
                "State dimension mismatch. Expected {}, got {} positions and {} velocities.",
                dim,
                positions.len(),
                velocities.len()
            );
        }
        let mut binding = Binding::new();
        binding.extend(
            self.table
                .coordinates()
                .iter()
                .cloned()
                .zip(positions.iter().copied()),
        );
        binding.extend(self.velocity_names.iter().cloned().zip(velocities.iter().copied()));
        Ok(binding)
    }

    pub fn operation_counts(&self) -> Vec<Vec<usize>> {
        self.table.operation_counts()
    }
}

impl SecondOrderSystem for ExpressionSystem {
    fn dimension(&self) -> usize {
        self.table.coordinates().len()
    }

    fn coordinates(&self) -> &[String] {
        self.table.coordinates()
    }

    fn max_order(&self) -> usize {
        self.table.max_order()
    }

    fn derivatives(
        &self,
        positions: &[f64],
        velocities: &[f64],
        order: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let binding = self.base_binding(positions, velocities)?;
        self.table.evaluate(&binding, order)
    }
}
