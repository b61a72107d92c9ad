//! Solid-state kinetic rate models.
//!
//! Models are implemented as small, pure functions of the conversion degree
//! so that the ODE right-hand side and the fitting code can stay generic.

pub mod model;

pub use model::*;
