use crate::simulation::SimulationState;
use crate::traits::{SecondOrderSystem, Steppable};
use anyhow::{bail, Result};
use nalgebra::DVector;

pub const MIN_TAYLOR_ORDER: usize = 2;
pub const MAX_TAYLOR_ORDER: usize = 6;

fn validate_step(
    system: &impl SecondOrderSystem,
    state: &SimulationState,
    dt: f64,
    required_order: usize,
) -> Result<()> {
    if !(dt.is_finite() && dt > 0.0) {
        bail!("dt must be positive and finite, got {}.", dt);
    }
    let dim = system.dimension();
    if state.positions.len() != dim || state.velocities.len() != dim {
        bail!(
            "State dimension mismatch. Expected {}, got {} positions and {} velocities.",
            dim,
            state.positions.len(),
            state.velocities.len()
        );
    }
    if system.max_order() < required_order {
        bail!(
            "System provides derivatives up to order {}, integrator needs order {}.",
            system.max_order(),
            required_order
        );
    }
    Ok(())
}

/// Evaluates derivative orders `2..=order` and checks the shape the system
/// returned, so the update formulas can index freely.
fn derivative_levels(
    system: &impl SecondOrderSystem,
    positions: &DVector<f64>,
    velocities: &DVector<f64>,
    order: usize,
) -> Result<Vec<Vec<f64>>> {
    let levels = system.derivatives(positions.as_slice(), velocities.as_slice(), order)?;
    if levels.len() != order - 1 || levels.iter().any(|level| level.len() != positions.len()) {
        bail!(
            "System returned {} derivative levels for order {}, expected {} levels of {} values.",
            levels.len(),
            order,
            order - 1,
            positions.len()
        );
    }
    Ok(levels)
}

/// `sum_k dt^k / k! * terms[k - 1]` in nested (Horner) form, where
/// `terms[k - 1]` is the k-th time derivative.
fn taylor_increment(terms: &[f64], dt: f64) -> f64 {
    let mut acc = 0.0;
    for (k, term) in terms.iter().enumerate().rev() {
        acc = term + dt / (k as f64 + 2.0) * acc;
    }
    dt * acc
}

/// Explicit Euler: positions advance with the old velocities, velocities with
/// the old accelerations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euler;

impl Steppable for Euler {
    fn required_order(&self) -> usize {
        2
    }

    fn step(
        &mut self,
        system: &impl SecondOrderSystem,
        state: &mut SimulationState,
        dt: f64,
    ) -> Result<()> {
        validate_step(system, state, dt, self.required_order())?;
        let acc = derivative_levels(system, &state.positions, &state.velocities, 2)?;
        let acc = DVector::from_row_slice(&acc[0]);

        state.positions.axpy(dt, &state.velocities, 1.0);
        state.velocities.axpy(dt, &acc, 1.0);
        state.t += dt;
        Ok(())
    }
}

/// Velocity-Verlet leapfrog.
///
/// Positions take a full step with the start-of-step acceleration; velocities
/// average the start and end accelerations. When forces depend on velocity,
/// the end acceleration is re-evaluated `corrector_iterations` times with the
/// latest velocity estimate.
#[derive(Debug, Clone, Copy)]
pub struct Leapfrog {
    corrector_iterations: usize,
}

impl Leapfrog {
    /// At least one acceleration re-evaluation is always made; zero is
    /// treated as one.
    pub fn new(corrector_iterations: usize) -> Self {
        Self {
            corrector_iterations: corrector_iterations.max(1),
        }
    }

    pub fn corrector_iterations(&self) -> usize {
        self.corrector_iterations
    }
}

impl Default for Leapfrog {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Steppable for Leapfrog {
    fn required_order(&self) -> usize {
        2
    }

    fn step(
        &mut self,
        system: &impl SecondOrderSystem,
        state: &mut SimulationState,
        dt: f64,
    ) -> Result<()> {
        validate_step(system, state, dt, self.required_order())?;
        let v0 = &state.velocities;
        let a0 = DVector::from_row_slice(&derivative_levels(system, &state.positions, v0, 2)?[0]);

        // x1 = x0 + dt * (v0 + dt/2 * a0)
        let mut positions = state.positions.clone();
        positions.axpy(dt, v0, 1.0);
        positions.axpy(0.5 * dt * dt, &a0, 1.0);

        let mut velocities = v0.clone();
        for _ in 0..self.corrector_iterations {
            let a1 = DVector::from_row_slice(
                &derivative_levels(system, &positions, &velocities, 2)?[0],
            );
            velocities.copy_from(v0);
            velocities.axpy(0.5 * dt, &(&a0 + &a1), 1.0);
        }

        state.positions = positions;
        state.velocities = velocities;
        state.t += dt;
        Ok(())
    }
}

/// Truncated Taylor series in the step size.
///
/// With `q^(k)` the k-th time derivative of a coordinate:
/// `x += sum_{k=1..=order} dt^k / k! q^(k)` and
/// `v += sum_{k=1..order} dt^k / k! q^(k+1)`.
#[derive(Debug, Clone, Copy)]
pub struct Taylor {
    order: usize,
}

impl Taylor {
    pub fn new(order: usize) -> Result<Self> {
        if !(MIN_TAYLOR_ORDER..=MAX_TAYLOR_ORDER).contains(&order) {
            bail!(
                "Taylor order must be between {} and {}, got {}.",
                MIN_TAYLOR_ORDER,
                MAX_TAYLOR_ORDER,
                order
            );
        }
        Ok(Self { order })
    }

    pub fn order(&self) -> usize {
        self.order
    }
}

impl Steppable for Taylor {
    fn required_order(&self) -> usize {
        self.order
    }

    fn step(
        &mut self,
        system: &impl SecondOrderSystem,
        state: &mut SimulationState,
        dt: f64,
    ) -> Result<()> {
        validate_step(system, state, dt, self.required_order())?;
        let levels = derivative_levels(system, &state.positions, &state.velocities, self.order)?;

        let mut terms = Vec::with_capacity(self.order);
        for i in 0..state.positions.len() {
            // terms[k] is the (k + 1)-th derivative of the coordinate.
            terms.clear();
            terms.push(state.velocities[i]);
            terms.extend(levels.iter().map(|level| level[i]));

            state.positions[i] += taylor_increment(&terms, dt);
            state.velocities[i] += taylor_increment(&terms[1..], dt);
        }
        state.t += dt;
        Ok(())
    }
}

/// Fourth-order Taylor step with a corrected fourth derivative.
///
/// The fourth derivative `s` at the start of the step is blended with `s'`
/// evaluated at the predicted end state:
/// `x = x0 + dt(v0 + dt/2(a + dt/3(j + dt(s/5 + s'/20))))`,
/// `v = v0 + dt(a + dt/2(j + dt(s/4 + s'/12)))`.
/// The prediction starts from `s' = s` and is refined
/// `corrector_iterations` times.
#[derive(Debug, Clone, Copy)]
pub struct TaylorCorrector {
    corrector_iterations: usize,
}

impl TaylorCorrector {
    pub fn new(corrector_iterations: usize) -> Self {
        Self {
            corrector_iterations,
        }
    }

    pub fn corrector_iterations(&self) -> usize {
        self.corrector_iterations
    }
}

impl Default for TaylorCorrector {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Steppable for TaylorCorrector {
    fn required_order(&self) -> usize {
        4
    }

    fn step(
        &mut self,
        system: &impl SecondOrderSystem,
        state: &mut SimulationState,
        dt: f64,
    ) -> Result<()> {
        validate_step(system, state, dt, self.required_order())?;
        let x0 = &state.positions;
        let v0 = &state.velocities;
        let levels = derivative_levels(system, x0, v0, 4)?;
        let (acc, jerk, snap) = (&levels[0], &levels[1], &levels[2]);

        let mut positions = x0.clone();
        let mut velocities = v0.clone();
        let mut corrected = snap.clone();
        for pass in 0..=self.corrector_iterations {
            for i in 0..x0.len() {
                positions[i] = x0[i]
                    + dt * (v0[i]
                        + dt * 0.5
                            * (acc[i]
                                + dt / 3.0
                                    * (jerk[i] + (snap[i] * 0.2 + corrected[i] * 0.05) * dt)));
                velocities[i] = v0[i]
                    + dt * (acc[i]
                        + dt * 0.5 * (jerk[i] + (snap[i] / 4.0 + corrected[i] / 12.0) * dt));
            }
            if pass == self.corrector_iterations {
                break;
            }
            corrected = derivative_levels(system, &positions, &velocities, 4)?.swap_remove(2);
        }

        state.positions = positions;
        state.velocities = velocities;
        state.t += dt;
        Ok(())
    }
}
