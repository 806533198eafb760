/// The `taylorsim_core` crate provides symbolic time derivatives and
/// Taylor-series integrators for small second-order physics scenes.
///
/// Key components:
/// - **Expr**: Immutable, shareable expression trees with a closed set of node kinds,
///   symbolic time differentiation and per-node memoized evaluation.
/// - **Chain**: Successive derivatives of an expression and their level-by-level evaluation.
/// - **Traits**: `SecondOrderSystem` (acceleration plus higher derivatives), `Steppable` (integrators).
/// - **Solvers**: Euler, leapfrog, Taylor (orders 2 to 6) and a fourth-order predictor-corrector.
/// - **Scenes**: Three-body, double pendulum, double spring and harmonic oscillator setups.
pub mod chain;
pub mod expr;
pub mod scenes;
pub mod simulation;
pub mod solvers;
pub mod system;
pub mod traits;
