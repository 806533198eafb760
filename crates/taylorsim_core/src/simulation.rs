use crate::scenes::{Scene, SceneKind};
use crate::solvers::{Euler, Leapfrog, Taylor, TaylorCorrector, MAX_TAYLOR_ORDER, MIN_TAYLOR_ORDER};
use crate::traits::{SecondOrderSystem, Steppable};
use anyhow::{bail, Context, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, trace};

/// Time, positions and velocities of a second-order system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    pub t: f64,
    pub positions: DVector<f64>,
    pub velocities: DVector<f64>,
}

impl SimulationState {
    pub fn new(positions: Vec<f64>, velocities: Vec<f64>) -> Self {
        Self {
            t: 0.0,
            positions: DVector::from_vec(positions),
            velocities: DVector::from_vec(velocities),
        }
    }

    pub fn dimension(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegratorKind {
    Euler,
    Leapfrog,
    Taylor,
    TaylorCorrector,
}

impl FromStr for IntegratorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "euler" => Ok(IntegratorKind::Euler),
            "leapfrog" => Ok(IntegratorKind::Leapfrog),
            "taylor" => Ok(IntegratorKind::Taylor),
            "taylor-corrector" => Ok(IntegratorKind::TaylorCorrector),
            other => bail!("Unknown integrator: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub kind: IntegratorKind,
    /// Order of the plain Taylor step.
    pub taylor_order: usize,
    /// Acceleration re-evaluations per leapfrog step.
    pub leapfrog_corrections: usize,
    /// Refinements of the predicted fourth derivative per corrector step.
    pub taylor_corrections: usize,
    pub dt: f64,
    /// Steps taken per `tick`, i.e. per rendered frame.
    pub steps_per_tick: usize,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            kind: IntegratorKind::Taylor,
            taylor_order: 4,
            leapfrog_corrections: 1,
            taylor_corrections: 4,
            dt: 0.005,
            steps_per_tick: 4,
        }
    }
}

impl IntegratorSettings {
    /// Highest derivative order the selected integrator evaluates, i.e. the
    /// `max_order` a scene must be built with.
    pub fn required_order(&self) -> usize {
        match self.kind {
            IntegratorKind::Euler | IntegratorKind::Leapfrog => 2,
            IntegratorKind::Taylor => self.taylor_order,
            IntegratorKind::TaylorCorrector => 4,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind == IntegratorKind::Taylor
            && !(MIN_TAYLOR_ORDER..=MAX_TAYLOR_ORDER).contains(&self.taylor_order)
        {
            bail!(
                "Taylor order must be between {} and {}, got {}.",
                MIN_TAYLOR_ORDER,
                MAX_TAYLOR_ORDER,
                self.taylor_order
            );
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            bail!("dt must be positive and finite, got {}.", self.dt);
        }
        if self.steps_per_tick == 0 {
            bail!("steps_per_tick must be at least 1.");
        }
        if self.leapfrog_corrections == 0 {
            bail!("leapfrog_corrections must be at least 1.");
        }
        Ok(())
    }
}

/// Runtime choice of integrator.
#[derive(Debug, Clone, Copy)]
pub enum Integrator {
    Euler(Euler),
    Leapfrog(Leapfrog),
    Taylor(Taylor),
    TaylorCorrector(TaylorCorrector),
}

impl Integrator {
    pub fn from_settings(settings: &IntegratorSettings) -> Result<Self> {
        Ok(match settings.kind {
            IntegratorKind::Euler => Integrator::Euler(Euler),
            IntegratorKind::Leapfrog => {
                Integrator::Leapfrog(Leapfrog::new(settings.leapfrog_corrections))
            }
            IntegratorKind::Taylor => Integrator::Taylor(Taylor::new(settings.taylor_order)?),
            IntegratorKind::TaylorCorrector => {
                Integrator::TaylorCorrector(TaylorCorrector::new(settings.taylor_corrections))
            }
        })
    }
}

impl Steppable for Integrator {
    fn required_order(&self) -> usize {
        match self {
            Integrator::Euler(s) => s.required_order(),
            Integrator::Leapfrog(s) => s.required_order(),
            Integrator::Taylor(s) => s.required_order(),
            Integrator::TaylorCorrector(s) => s.required_order(),
        }
    }

    fn step(
        &mut self,
        system: &impl SecondOrderSystem,
        state: &mut SimulationState,
        dt: f64,
    ) -> Result<()> {
        match self {
            Integrator::Euler(s) => s.step(system, state, dt),
            Integrator::Leapfrog(s) => s.step(system, state, dt),
            Integrator::Taylor(s) => s.step(system, state, dt),
            Integrator::TaylorCorrector(s) => s.step(system, state, dt),
        }
    }
}

/// A scene plus an integrator and the current state.
#[derive(Debug, Clone)]
pub struct Simulation {
    scene: Scene,
    settings: IntegratorSettings,
    integrator: Integrator,
    state: SimulationState,
}

impl Simulation {
    /// The scene must have been built with a `max_order` of at least
    /// `settings.required_order()`.
    pub fn new(scene: Scene, settings: IntegratorSettings) -> Result<Self> {
        settings.validate()?;
        let integrator = Integrator::from_settings(&settings)?;
        let required = integrator.required_order();
        if scene.system.max_order() < required {
            bail!(
                "Scene {} was built up to order {}, integrator needs order {}.",
                scene.kind.name(),
                scene.system.max_order(),
                required
            );
        }
        debug!(
            scene = scene.kind.name(),
            integrator = ?settings.kind,
            required_order = required,
            dt = settings.dt,
            "created simulation"
        );
        let state = scene.initial.clone();
        Ok(Self {
            scene,
            settings,
            integrator,
            state,
        })
    }

    /// Builds `kind` with its default configuration and integrator.
    pub fn with_defaults(kind: SceneKind) -> Result<Self> {
        let settings = kind.default_settings();
        let scene = crate::scenes::default_scene(kind, settings.required_order())?;
        Self::new(scene, settings)
    }

    pub fn step(&mut self, dt: f64) -> Result<()> {
        self.integrator
            .step(&self.scene.system, &mut self.state, dt)
            .with_context(|| format!("Step failed at t = {}", self.state.t))
    }

    /// Takes `steps` steps of size `dt`. On error the state is left where the
    /// failing step found it.
    pub fn advance(&mut self, steps: usize, dt: f64) -> Result<()> {
        for _ in 0..steps {
            self.step(dt)?;
        }
        trace!(t = self.state.t, "advanced");
        Ok(())
    }

    /// One frame: `steps_per_tick` steps of the configured `dt`.
    pub fn tick(&mut self) -> Result<()> {
        self.advance(self.settings.steps_per_tick, self.settings.dt)
    }

    pub fn reset(&mut self) {
        debug!(scene = self.scene.kind.name(), t = self.state.t, "reset simulation");
        self.state = self.scene.initial.clone();
        self.scene.system.table().clear_caches();
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn set_state(&mut self, state: SimulationState) -> Result<()> {
        let dim = self.scene.system.dimension();
        if state.positions.len() != dim || state.velocities.len() != dim {
            bail!(
                "State dimension mismatch. Expected {}, got {} positions and {} velocities.",
                dim,
                state.positions.len(),
                state.velocities.len()
            );
        }
        self.state = state;
        Ok(())
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn settings(&self) -> &IntegratorSettings {
        &self.settings
    }

    /// Drawable points of the current state.
    pub fn positions(&self) -> Vec<[f64; 2]> {
        self.scene.cartesian_positions(&self.state)
    }

    /// Closed-form state at the current time, for scenes that have one.
    pub fn exact_state(&self) -> Option<SimulationState> {
        self.scene.exact_state(self.state.t)
    }
}
