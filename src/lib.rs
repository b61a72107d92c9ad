//! `kinfit` library crate.
//!
//! A numerical engine that fits multi-step solid-state reaction-kinetics
//! models to experimental thermal-analysis curves: a kinetic model catalog,
//! a reaction-network ODE, an adaptive integrator with an inline wall-clock
//! deadline, a serializable MSE objective, and a differential-evolution
//! driver with parallel evaluation.
//!
//! The crate is a library by design: data ingest, plotting and UI are the
//! surrounding application's job. Entry points live in [`run`].

pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod models;
pub mod ode;
pub mod run;
