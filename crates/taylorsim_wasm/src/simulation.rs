//! WASM wrapper around a running scene.

use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use taylorsim_core::scenes::{
    double_pendulum, double_spring, oscillator, three_body, DoublePendulumConfig,
    DoubleSpringConfig, OscillatorConfig, Scene, SceneKind, ThreeBodyConfig,
};
use taylorsim_core::simulation::{IntegratorSettings, Simulation, SimulationState};
use wasm_bindgen::prelude::*;

fn error_text(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

fn js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&error_text(&err))
}

/// Scene configuration, already read from JS.
#[derive(Debug, Clone, Copy)]
enum SceneConfig {
    ThreeBody(ThreeBodyConfig),
    DoublePendulum(DoublePendulumConfig),
    DoubleSpring(DoubleSpringConfig),
    Oscillator(OscillatorConfig),
}

impl SceneConfig {
    fn default_for(kind: SceneKind) -> Self {
        match kind {
            SceneKind::ThreeBody => SceneConfig::ThreeBody(ThreeBodyConfig::default()),
            SceneKind::DoublePendulum => {
                SceneConfig::DoublePendulum(DoublePendulumConfig::default())
            }
            SceneKind::DoubleSpring => SceneConfig::DoubleSpring(DoubleSpringConfig::default()),
            SceneKind::Oscillator => SceneConfig::Oscillator(OscillatorConfig::default()),
        }
    }

    fn build(&self, max_order: usize) -> anyhow::Result<Scene> {
        match self {
            SceneConfig::ThreeBody(config) => three_body(config, max_order),
            SceneConfig::DoublePendulum(config) => double_pendulum(config, max_order),
            SceneConfig::DoubleSpring(config) => double_spring(config, max_order),
            SceneConfig::Oscillator(config) => oscillator(config, max_order),
        }
    }
}

/// Picks the scene's tuned settings unless `given`, then applies a non-empty
/// `integrator_name` on top.
fn resolve_settings(
    kind: SceneKind,
    given: Option<IntegratorSettings>,
    integrator_name: &str,
) -> anyhow::Result<IntegratorSettings> {
    let mut settings = given.unwrap_or_else(|| kind.default_settings());
    if !integrator_name.is_empty() {
        settings.kind = integrator_name.parse()?;
    }
    Ok(settings)
}

fn build_simulation(
    config: SceneConfig,
    settings: IntegratorSettings,
) -> anyhow::Result<Simulation> {
    let scene = config.build(settings.required_order())?;
    Simulation::new(scene, settings)
}

fn is_missing(value: &JsValue) -> bool {
    value.is_undefined() || value.is_null()
}

/// Reads an optional config object; `undefined` and `null` select the defaults.
fn read_scene_config(kind: SceneKind, value: JsValue) -> Result<SceneConfig, JsValue> {
    if is_missing(&value) {
        return Ok(SceneConfig::default_for(kind));
    }
    let config = match kind {
        SceneKind::ThreeBody => from_value(value).map(SceneConfig::ThreeBody),
        SceneKind::DoublePendulum => from_value(value).map(SceneConfig::DoublePendulum),
        SceneKind::DoubleSpring => from_value(value).map(SceneConfig::DoubleSpring),
        SceneKind::Oscillator => from_value(value).map(SceneConfig::Oscillator),
    };
    config.map_err(|e| JsValue::from_str(&format!("Invalid scene config: {}", e)))
}

#[derive(Serialize)]
struct OperationCounts<'a> {
    coordinates: &'a [String],
    /// Indexed `[coordinate][order - 2]`.
    counts: Vec<Vec<usize>>,
}

#[wasm_bindgen]
pub struct WasmSimulation {
    simulation: Simulation,
}

#[wasm_bindgen]
impl WasmSimulation {
    /// `integrator_name` may be empty to keep the integrator from `settings`.
    /// Without `settings` the scene's tuned settings are used; fields missing
    /// from a given `settings` object take the generic defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(
        scene_name: &str,
        integrator_name: &str,
        scene_config: JsValue,
        settings: JsValue,
    ) -> Result<WasmSimulation, JsValue> {
        console_error_panic_hook::set_once();

        let kind: SceneKind = scene_name.parse().map_err(js_error)?;
        let given = if is_missing(&settings) {
            None
        } else {
            let settings = from_value::<IntegratorSettings>(settings)
                .map_err(|e| JsValue::from_str(&format!("Invalid settings: {}", e)))?;
            Some(settings)
        };
        let settings = resolve_settings(kind, given, integrator_name).map_err(js_error)?;
        let config = read_scene_config(kind, scene_config)?;
        let simulation = build_simulation(config, settings).map_err(js_error)?;
        Ok(WasmSimulation { simulation })
    }

    pub fn step(&mut self, dt: f64) -> Result<(), JsValue> {
        self.simulation.step(dt).map_err(js_error)
    }

    pub fn advance(&mut self, steps: usize, dt: f64) -> Result<(), JsValue> {
        self.simulation.advance(steps, dt).map_err(js_error)
    }

    /// One animation frame with the configured step count and `dt`.
    pub fn tick(&mut self) -> Result<(), JsValue> {
        self.simulation.tick().map_err(js_error)
    }

    pub fn reset(&mut self) {
        self.simulation.reset();
    }

    pub fn get_t(&self) -> f64 {
        self.simulation.state().t
    }

    /// Drawable points as `[x0, y0, x1, y1, ...]`.
    pub fn get_positions(&self) -> Vec<f64> {
        self.simulation.positions().into_iter().flatten().collect()
    }

    /// Raw velocities in coordinate order.
    pub fn get_velocities(&self) -> Vec<f64> {
        self.simulation.state().velocities.as_slice().to_vec()
    }

    /// Drawable points of the closed-form solution at the current time, or an
    /// empty vector for scenes without one.
    pub fn get_exact_positions(&self) -> Vec<f64> {
        match self.simulation.exact_state() {
            Some(exact) => self
                .simulation
                .scene()
                .cartesian_positions(&exact)
                .into_iter()
                .flatten()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_state(&self) -> Result<JsValue, JsValue> {
        to_value(self.simulation.state())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn set_state(&mut self, state: JsValue) -> Result<(), JsValue> {
        let state: SimulationState = from_value(state)
            .map_err(|e| JsValue::from_str(&format!("Invalid state: {}", e)))?;
        self.simulation.set_state(state).map_err(js_error)
    }

    /// Node counts of every derivative tree, for the scene's stats panel.
    pub fn operation_counts(&self) -> Result<JsValue, JsValue> {
        let system = &self.simulation.scene().system;
        let payload = OperationCounts {
            coordinates: system.table().coordinates(),
            counts: system.operation_counts(),
        };
        to_value(&payload).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taylorsim_core::simulation::IntegratorKind;
    use taylorsim_core::traits::SecondOrderSystem;
    use wasm_bindgen_test::wasm_bindgen_test;

    #[test]
    fn names_resolve_with_readable_errors() {
        let err = "four-body".parse::<SceneKind>().expect_err("unknown scene");
        assert_eq!(error_text(&err), "Unknown scene: four-body");

        let err = resolve_settings(SceneKind::Oscillator, None, "rk4").expect_err("unknown");
        assert_eq!(error_text(&err), "Unknown integrator: rk4");
    }

    #[test]
    fn settings_fall_back_to_scene_tuning() {
        let tuned = resolve_settings(SceneKind::ThreeBody, None, "").expect("settings");
        assert_eq!(tuned, SceneKind::ThreeBody.default_settings());

        let overridden = resolve_settings(SceneKind::ThreeBody, None, "leapfrog").expect("settings");
        assert_eq!(overridden.kind, IntegratorKind::Leapfrog);
        assert_eq!(overridden.dt, tuned.dt);

        let given = IntegratorSettings {
            dt: 0.01,
            ..IntegratorSettings::default()
        };
        let kept = resolve_settings(SceneKind::ThreeBody, Some(given), "").expect("settings");
        assert_eq!(kept, given);
    }

    #[test]
    fn builds_scene_deep_enough_for_integrator() {
        let settings = resolve_settings(SceneKind::DoubleSpring, None, "").expect("settings");
        let sim = build_simulation(SceneConfig::default_for(SceneKind::DoubleSpring), settings)
            .expect("simulation");
        assert_eq!(sim.scene().system.max_order(), settings.required_order());

        let config = SceneConfig::Oscillator(OscillatorConfig {
            omega: 2.0,
            amplitude: 50.0,
        });
        let euler = resolve_settings(SceneKind::Oscillator, None, "euler").expect("settings");
        let sim = build_simulation(config, euler).expect("simulation");
        assert_eq!(sim.positions(), vec![[50.0, 0.0]]);
    }

    #[test]
    fn invalid_settings_surface_from_core() {
        let settings = IntegratorSettings {
            taylor_order: 9,
            ..IntegratorSettings::default()
        };
        let err = build_simulation(SceneConfig::default_for(SceneKind::Oscillator), settings)
            .expect_err("order 9");
        assert!(error_text(&err).contains("Taylor order must be between 2 and 6"));
    }

    fn error_message(err: JsValue) -> String {
        err.as_string().unwrap_or_default()
    }

    #[wasm_bindgen_test]
    fn rejects_unknown_scene_and_integrator() {
        let result = WasmSimulation::new("four-body", "", JsValue::UNDEFINED, JsValue::UNDEFINED);
        let message = result.err().map(error_message).unwrap_or_default();
        assert!(message.contains("Unknown scene"));

        let result = WasmSimulation::new("oscillator", "rk4", JsValue::UNDEFINED, JsValue::UNDEFINED);
        let message = result.err().map(error_message).unwrap_or_default();
        assert!(message.contains("Unknown integrator"));
    }

    #[wasm_bindgen_test]
    fn ticks_oscillator_with_defaults() {
        let mut sim = WasmSimulation::new("oscillator", "", JsValue::UNDEFINED, JsValue::NULL)
            .expect("simulation");
        assert_eq!(sim.get_positions(), vec![200.0, 0.0]);
        sim.tick().expect("tick");
        assert!((sim.get_t() - 0.02).abs() < 1e-12);
        assert_eq!(sim.get_exact_positions().len(), 2);
        sim.reset();
        assert_eq!(sim.get_t(), 0.0);
    }

    #[wasm_bindgen_test]
    fn applies_scene_config_and_integrator_override() {
        let config = to_value(&OscillatorConfig {
            omega: 2.0,
            amplitude: 50.0,
        })
        .expect("config");
        let mut sim = WasmSimulation::new("oscillator", "euler", config, JsValue::UNDEFINED)
            .expect("simulation");
        assert_eq!(sim.get_positions(), vec![50.0, 0.0]);
        assert_eq!(sim.get_velocities(), vec![0.0]);
        sim.advance(3, 0.01).expect("advance");
        assert!((sim.get_t() - 0.03).abs() < 1e-12);
        assert!(sim.step(0.0).is_err());
    }

    #[wasm_bindgen_test]
    fn state_round_trips_through_js() {
        let mut sim = WasmSimulation::new("double-pendulum", "", JsValue::UNDEFINED, JsValue::UNDEFINED)
            .expect("simulation");
        sim.advance(2, 0.005).expect("advance");
        let state = sim.get_state().expect("state");
        sim.reset();
        sim.set_state(state).expect("set state");
        assert!((sim.get_t() - 0.01).abs() < 1e-12);
        assert_eq!(sim.get_positions().len(), 4);
        assert!(sim.get_exact_positions().is_empty());
    }
}
