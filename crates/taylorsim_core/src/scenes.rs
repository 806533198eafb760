//! The demo scenes: force laws written as acceleration expressions, initial
//! conditions, and how coordinates map to drawable points.

use crate::expr::{cos, div, mul, sin, sin_scaled, sub, var, Expr};
use crate::simulation::{IntegratorKind, IntegratorSettings, SimulationState};
use crate::system::ExpressionSystem;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SceneKind {
    ThreeBody,
    DoublePendulum,
    DoubleSpring,
    Oscillator,
}

impl SceneKind {
    pub fn name(self) -> &'static str {
        match self {
            SceneKind::ThreeBody => "three-body",
            SceneKind::DoublePendulum => "double-pendulum",
            SceneKind::DoubleSpring => "double-spring",
            SceneKind::Oscillator => "oscillator",
        }
    }

    /// Integrator each demo was tuned for.
    pub fn default_settings(self) -> IntegratorSettings {
        let base = IntegratorSettings::default();
        match self {
            SceneKind::ThreeBody => IntegratorSettings {
                kind: IntegratorKind::Taylor,
                taylor_order: 6,
                ..base
            },
            SceneKind::DoublePendulum => IntegratorSettings {
                kind: IntegratorKind::TaylorCorrector,
                ..base
            },
            SceneKind::DoubleSpring => IntegratorSettings {
                kind: IntegratorKind::Taylor,
                taylor_order: 4,
                ..base
            },
            SceneKind::Oscillator => IntegratorSettings {
                kind: IntegratorKind::Taylor,
                taylor_order: 3,
                dt: 0.02,
                steps_per_tick: 1,
                ..base
            },
        }
    }
}

impl FromStr for SceneKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "three-body" => Ok(SceneKind::ThreeBody),
            "double-pendulum" => Ok(SceneKind::DoublePendulum),
            "double-spring" => Ok(SceneKind::DoubleSpring),
            "oscillator" => Ok(SceneKind::Oscillator),
            other => bail!("Unknown scene: {}", other),
        }
    }
}

/// How the state vector maps to drawable points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Layout {
    /// Coordinates come in `(x, y)` pairs.
    Planar,
    /// Each coordinate is a horizontal offset.
    Line,
    /// Coordinates are angles of a chain of rods hanging from the origin, with
    /// `y` pointing down.
    Pendulum { length: f64 },
}

/// Closed-form trajectory to compare an integrator against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExactSolution {
    /// `y = amplitude cos(omega t)`, starting at rest.
    Harmonic { amplitude: f64, omega: f64 },
}

impl ExactSolution {
    pub fn state_at(&self, t: f64) -> SimulationState {
        match *self {
            ExactSolution::Harmonic { amplitude, omega } => {
                let mut state = SimulationState::new(
                    vec![amplitude * (omega * t).cos()],
                    vec![-amplitude * omega * (omega * t).sin()],
                );
                state.t = t;
                state
            }
        }
    }
}

/// A ready-to-run scene.
#[derive(Debug, Clone)]
pub struct Scene {
    pub kind: SceneKind,
    pub system: ExpressionSystem,
    pub initial: SimulationState,
    pub layout: Layout,
    pub exact: Option<ExactSolution>,
}

impl Scene {
    /// Drawable points for `state`, according to the scene layout.
    pub fn cartesian_positions(&self, state: &SimulationState) -> Vec<[f64; 2]> {
        match self.layout {
            Layout::Planar => state
                .positions
                .as_slice()
                .chunks_exact(2)
                .map(|pair| [pair[0], pair[1]])
                .collect(),
            Layout::Line => state.positions.iter().map(|&q| [q, 0.0]).collect(),
            Layout::Pendulum { length } => {
                let mut point = [0.0, 0.0];
                state
                    .positions
                    .iter()
                    .map(|angle| {
                        point[0] += length * angle.sin();
                        point[1] += length * angle.cos();
                        point
                    })
                    .collect()
            }
        }
    }

    pub fn exact_state(&self, t: f64) -> Option<SimulationState> {
        self.exact.map(|exact| exact.state_at(t))
    }
}

/// Builds `kind` with its default configuration.
pub fn default_scene(kind: SceneKind, max_order: usize) -> Result<Scene> {
    match kind {
        SceneKind::ThreeBody => three_body(&ThreeBodyConfig::default(), max_order),
        SceneKind::DoublePendulum => double_pendulum(&DoublePendulumConfig::default(), max_order),
        SceneKind::DoubleSpring => double_spring(&DoubleSpringConfig::default(), max_order),
        SceneKind::Oscillator => oscillator(&OscillatorConfig::default(), max_order),
    }
}

fn coordinate_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

// --- Three-body gravitation ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreeBodyConfig {
    /// Distance of each body from the centre of mass.
    pub radius: f64,
    /// Initial tangential speed.
    pub speed: f64,
    /// Attraction strength; derived from radius and speed when absent.
    pub coupling: Option<f64>,
}

impl Default for ThreeBodyConfig {
    fn default() -> Self {
        Self {
            radius: 200.0,
            speed: 130.0,
            coupling: None,
        }
    }
}

impl ThreeBodyConfig {
    pub fn coupling(&self) -> f64 {
        self.coupling.unwrap_or_else(|| {
            self.speed * self.speed / self.radius * 40000.0 * (3.0_f64.sqrt() + 4.0)
        })
    }
}

/// Three equal masses under pairwise `k / r^2` attraction, starting on an
/// equilateral triangle. Coordinates are `x1, y1, x2, y2, x3, y3`.
pub fn three_body(config: &ThreeBodyConfig, max_order: usize) -> Result<Scene> {
    let k = config.coupling();
    let x: Vec<Expr> = (1..=3).map(|i| var(format!("x{i}"))).collect();
    let y: Vec<Expr> = (1..=3).map(|i| var(format!("y{i}"))).collect();

    // Separation of bodies i and j, and k / |r|^3 so that the force is
    // coupling * separation.
    let pair = |i: usize, j: usize| {
        let dx = x[i].sub(&x[j]);
        let dy = y[i].sub(&y[j]);
        let coupling = mul(k, dx.mul(&dx).add(dy.mul(&dy)).pow(-1.5));
        (coupling, dx, dy)
    };
    let (f12, x12, y12) = pair(0, 1);
    let (f23, x23, y23) = pair(1, 2);
    let (f31, x31, y31) = pair(2, 0);

    let accelerations = vec![
        f31.mul(&x31).sub(f12.mul(&x12)),
        f31.mul(&y31).sub(f12.mul(&y12)),
        f12.mul(&x12).sub(f23.mul(&x23)),
        f12.mul(&y12).sub(f23.mul(&y23)),
        f23.mul(&x23).sub(f31.mul(&x31)),
        f23.mul(&y23).sub(f31.mul(&y31)),
    ];

    let system = ExpressionSystem::new(
        coordinate_names(&["x1", "y1", "x2", "y2", "x3", "y3"]),
        accelerations,
        max_order,
        true,
    )?;

    let (r0, v0) = (config.radius, config.speed);
    let s = 0.75_f64.sqrt();
    let initial = SimulationState::new(
        vec![0.0, r0, r0 * s, -r0 / 2.0, -r0 * s, -r0 / 2.0],
        vec![-v0, 0.0, v0 / 2.0, v0 * s, v0 / 2.0, -v0 * s],
    );

    Ok(Scene {
        kind: SceneKind::ThreeBody,
        system,
        initial,
        layout: Layout::Planar,
        exact: None,
    })
}

// --- Double pendulum ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DoublePendulumConfig {
    /// g / l.
    pub gravity_ratio: f64,
    /// The upper rod starts this far (radians) short of horizontal.
    pub offset: f64,
    /// Rod length used for drawing.
    pub length: f64,
}

impl Default for DoublePendulumConfig {
    fn default() -> Self {
        Self {
            gravity_ratio: 4.0,
            offset: 0.01,
            length: 200.0,
        }
    }
}

/// Two equal point masses on equal massless rods. Coordinates are the rod
/// angles `a1, a2` from the downward vertical.
pub fn double_pendulum(config: &DoublePendulumConfig, max_order: usize) -> Result<Scene> {
    let k = config.gravity_ratio;
    let a1 = var("a1");
    let a2 = var("a2");
    let da1 = a1.derivative();
    let da2 = a2.derivative();

    let sin12 = sin(a1.sub(&a2));
    let cos12 = cos(a1.sub(&a2));
    let below = sub(1.0, cos12.mul(&cos12).mul(0.5));

    let above1 = mul(k, sin_scaled(&a2, 0.5).mul(&cos12).sub(sin(&a1))).sub(
        sin12
            .mul(0.5)
            .mul(da2.mul(&da2).add(da1.mul(&da1).mul(&cos12))),
    );
    let above2 = mul(k, sin(&a1).mul(&cos12).sub(sin(&a2))).add(
        sin12.mul(da2.mul(&da2).mul(&cos12).mul(0.5).add(da1.mul(&da1))),
    );

    let system = ExpressionSystem::new(
        coordinate_names(&["a1", "a2"]),
        vec![div(above1, &below), div(above2, &below)],
        max_order,
        false,
    )?;

    let initial = SimulationState::new(vec![FRAC_PI_2 - config.offset, FRAC_PI_2], vec![0.0, 0.0]);

    Ok(Scene {
        kind: SceneKind::DoublePendulum,
        system,
        initial,
        layout: Layout::Pendulum {
            length: config.length,
        },
        exact: None,
    })
}

// --- Two masses on springs ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubleSpringConfig {
    /// Downward acceleration (`y` points down).
    pub gravity: f64,
    /// Spring constant per unit mass.
    pub stiffness: f64,
    pub rest_length: f64,
    /// Initial downward speed of the lower mass.
    pub release_speed: f64,
}

impl Default for DoubleSpringConfig {
    fn default() -> Self {
        Self {
            gravity: 800.0,
            stiffness: 30.0,
            rest_length: 140.0,
            release_speed: 100.0,
        }
    }
}

/// A mass hung from the origin by a spring, and a second mass hung from the
/// first. Both start on the horizontal at rest length. Coordinates are
/// `x1, y1, x2, y2`.
pub fn double_spring(config: &DoubleSpringConfig, max_order: usize) -> Result<Scene> {
    let (g, k, l) = (config.gravity, config.stiffness, config.rest_length);
    let x1 = var("x1");
    let y1 = var("y1");
    let x2 = var("x2");
    let y2 = var("y2");

    // k (l / |r| - 1): positive when compressed.
    let tension = |dx: &Expr, dy: &Expr| {
        div(l, dx.mul(dx).add(dy.mul(dy)).pow(0.5)).sub(1.0).mul(k)
    };
    let f1 = tension(&x1, &y1);
    let xd = x2.sub(&x1);
    let yd = y2.sub(&y1);
    let f2 = tension(&xd, &yd);

    let accelerations = vec![
        f1.mul(&x1).sub(f2.mul(&xd)),
        f1.mul(&y1).sub(f2.mul(&yd)).add(g),
        f2.mul(&xd),
        f2.mul(&yd).add(g),
    ];

    let system = ExpressionSystem::new(
        coordinate_names(&["x1", "y1", "x2", "y2"]),
        accelerations,
        max_order,
        false,
    )?;

    let initial = SimulationState::new(
        vec![l, 0.0, 2.0 * l, 0.0],
        vec![0.0, 0.0, 0.0, config.release_speed],
    );

    Ok(Scene {
        kind: SceneKind::DoubleSpring,
        system,
        initial,
        layout: Layout::Planar,
        exact: None,
    })
}

// --- Harmonic oscillator ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OscillatorConfig {
    pub omega: f64,
    pub amplitude: f64,
}

impl Default for OscillatorConfig {
    fn default() -> Self {
        Self {
            omega: 3.0,
            amplitude: 200.0,
        }
    }
}

/// `y'' = -omega^2 y`, released from rest at `amplitude`.
pub fn oscillator(config: &OscillatorConfig, max_order: usize) -> Result<Scene> {
    let omega = config.omega;
    let system = ExpressionSystem::new(
        coordinate_names(&["y"]),
        vec![mul(-(omega * omega), var("y"))],
        max_order,
        false,
    )?;
    let initial = SimulationState::new(vec![config.amplitude], vec![0.0]);

    Ok(Scene {
        kind: SceneKind::Oscillator,
        system,
        initial,
        layout: Layout::Line,
        exact: Some(ExactSolution::Harmonic {
            amplitude: config.amplitude,
            omega,
        }),
    })
}
