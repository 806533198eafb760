use crate::simulation::SimulationState;
use anyhow::{anyhow, Result};

/// A second-order system: every coordinate's acceleration is a function of
/// positions and velocities, and can be differentiated in time.
pub trait SecondOrderSystem {
    /// Number of coordinates.
    fn dimension(&self) -> usize;

    /// Coordinate names, in state-vector order.
    fn coordinates(&self) -> &[String];

    /// Highest time derivative `derivatives` can produce.
    fn max_order(&self) -> usize;

    /// Evaluates time derivatives of orders `2..=order`.
    /// The result is indexed `[order - 2][coordinate]`.
    fn derivatives(&self, positions: &[f64], velocities: &[f64], order: usize)
        -> Result<Vec<Vec<f64>>>;

    /// Second derivatives only.
    fn accelerations(&self, positions: &[f64], velocities: &[f64]) -> Result<Vec<f64>> {
        self.derivatives(positions, velocities, 2)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("System returned no accelerations"))
    }
}

/// A trait for integrators that step a second-order system forward.
pub trait Steppable {
    /// Highest derivative order the integrator evaluates.
    fn required_order(&self) -> usize;

    /// Performs one step of size dt, updating `state` (time included).
    fn step(
        &mut self,
        system: &impl SecondOrderSystem,
        state: &mut SimulationState,
        dt: f64,
    ) -> Result<()>;
}
