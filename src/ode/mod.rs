//! ODE evaluation: the reaction-network right-hand side, the adaptive
//! integrator, and the inline wall-clock deadline.
//!
//! Everything here is synchronous and CPU-bound; failures collapse into a
//! single [`IntegrationFailure`] type so the objective can fold them into a
//! penalty score without ever surfacing an error to the optimizer.

pub mod deadline;
pub mod network;
pub mod solver;

pub use deadline::*;
pub use network::*;
pub use solver::*;
