//! The kinetic model catalog: differential forms `f(α)` of the standard
//! solid-state reaction models.
//!
//! The ODE right-hand side calls [`rate`] millions of times per fit, so the
//! catalog is a flat `match` over the integer model index: no per-reaction
//! trait objects, no allocation, branch-predictable dispatch.
//!
//! Families (39 entries total):
//!
//! - `F*`  reaction order
//! - `A*`  Avrami–Erofeev nucleation/growth
//! - `B1`  Prout–Tompkins autocatalysis
//! - `P*`  power law
//! - `E*`  exponential
//! - `R*`  geometric contraction
//! - `D*`  diffusion (incl. Jander, Ginstling–Brounshtein, Zhuravlev and
//!   the anti-Jander/anti-GB counterparts)
//! - `SB*` fixed-exponent Šesták–Berggren forms
//!
//! Boundary safety: α is clamped to the open interval
//! `(ALPHA_EPS, 1 − ALPHA_EPS)` before evaluation, so every entry is finite
//! and non-negative on the closed domain [0, 1]. Several entries diverge at
//! the boundaries in their textbook form (`D1` at α→0, the A-family
//! logarithms at α→1); the clamp is what makes them safe to evaluate inside
//! a solver that may momentarily step outside the physical range.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Number of models in the catalog. Indices `0..MODEL_COUNT` are valid.
pub const MODEL_COUNT: usize = 39;

/// Clamp margin for the conversion degree.
pub const ALPHA_EPS: f64 = 1e-8;

/// Clamp α to the open interval `(ALPHA_EPS, 1 − ALPHA_EPS)`.
#[inline]
pub fn clamp_alpha(alpha: f64) -> f64 {
    alpha.clamp(ALPHA_EPS, 1.0 - ALPHA_EPS)
}

/// Evaluate the differential form `f(α)` of the model at `alpha`.
///
/// Pure and allocation-free. α is clamped before evaluation, so the result
/// is finite and non-negative for any α in [0, 1] (and for slightly
/// out-of-range values produced by an adaptive solver step).
///
/// # Panics
/// Panics if `model >= MODEL_COUNT`. Candidate decoding guarantees a valid
/// index; an out-of-range index here is a programming error, not a data
/// error.
#[inline]
pub fn rate(model: usize, alpha: f64) -> f64 {
    let a = clamp_alpha(alpha);
    let w = 1.0 - a; // unreacted fraction
    match model {
        // Reaction order.
        0 => 1.0,                     // F0
        1 => 1.5 * w.powf(1.0 / 3.0), // F1/3
        2 => 4.0 * w.powf(0.75),      // F3/4
        3 => w,                       // F1
        4 => 2.0 * w.powf(1.5),       // F3/2
        5 => w * w,                   // F2
        6 => w * w * w,               // F3
        7 => w * w * w * w,           // F4

        // Avrami–Erofeev: n(1−α)(−ln(1−α))^(1−1/n).
        8 => 0.5 * w * neg_ln(w).powf(-1.0),         // A1/2
        9 => 1.5 * w * neg_ln(w).powf(1.0 / 3.0),    // A3/2
        10 => 2.0 * w * neg_ln(w).sqrt(),            // A2
        11 => 2.5 * w * neg_ln(w).powf(0.6),         // A5/2
        12 => 3.0 * w * neg_ln(w).powf(2.0 / 3.0),   // A3
        13 => 4.0 * w * neg_ln(w).powf(0.75),        // A4
        14 => 5.0 * w * neg_ln(w).powf(0.8),         // A5
        15 => 6.0 * w * neg_ln(w).powf(5.0 / 6.0),   // A6

        // Prout–Tompkins autocatalysis.
        16 => a * w, // B1

        // Power law.
        17 => (2.0 / 3.0) * a.powf(-0.5), // P2/3
        18 => 1.5 * a.powf(1.0 / 3.0),    // P3/2
        19 => 2.0 * a.sqrt(),             // P2
        20 => 3.0 * a.powf(2.0 / 3.0),    // P3
        21 => 4.0 * a.powf(0.75),         // P4

        // Exponential.
        22 => a,       // E1
        23 => 0.5 * a, // E2

        // Geometric contraction.
        24 => 1.0,                    // R1
        25 => 2.0 * w.sqrt(),         // R2
        26 => 3.0 * w.powf(2.0 / 3.0), // R3

        // Diffusion.
        27 => 0.5 / a,                                                 // D1
        28 => 1.0 / neg_ln(w),                                         // D2 (Valensi)
        29 => 1.5 * w.powf(2.0 / 3.0) / (1.0 - w.powf(1.0 / 3.0)),     // D3 (Jander)
        30 => 1.5 / (w.powf(-1.0 / 3.0) - 1.0),                        // D4 (Ginstling–Brounshtein)
        31 => 1.5 * w.powf(4.0 / 3.0) / (w.powf(-1.0 / 3.0) - 1.0),    // D5 (Zhuravlev)
        32 => {
            // D6 (anti-Jander)
            let b = 1.0 + a;
            1.5 * b.powf(2.0 / 3.0) / (b.powf(1.0 / 3.0) - 1.0)
        }
        33 => {
            // D7 (anti-Ginstling–Brounshtein)
            let b = 1.0 + a;
            1.5 / (1.0 - b.powf(-1.0 / 3.0))
        }
        34 => {
            // D8 (anti-Zhuravlev)
            let b = 1.0 + a;
            1.5 * b.powf(4.0 / 3.0) / (b.powf(1.0 / 3.0) - 1.0)
        }

        // Fixed-exponent Šesták–Berggren: α^m (1−α)^n.
        35 => a.sqrt() * w,          // SB(1/2, 1)
        36 => a * w.sqrt(),          // SB(1, 1/2)
        37 => a.sqrt() * w.sqrt(),   // SB(1/2, 1/2)
        38 => a * w * w,             // SB(1, 2)

        _ => panic!("kinetic model index {model} out of range (0..{MODEL_COUNT})"),
    }
}

#[inline]
fn neg_ln(w: f64) -> f64 {
    // w is clamped away from 0 and 1, so this is finite and positive.
    -w.ln()
}

/// Short catalog code for a model index, for reporting.
///
/// # Panics
/// Panics if `model >= MODEL_COUNT`.
pub fn model_name(model: usize) -> &'static str {
    const NAMES: [&str; MODEL_COUNT] = [
        "F0", "F1/3", "F3/4", "F1", "F3/2", "F2", "F3", "F4", "A1/2", "A3/2", "A2", "A5/2", "A3",
        "A4", "A5", "A6", "B1", "P2/3", "P3/2", "P2", "P3", "P4", "E1", "E2", "R1", "R2", "R3",
        "D1", "D2", "D3", "D4", "D5", "D6", "D7", "D8", "SB(1/2,1)", "SB(1,1/2)", "SB(1/2,1/2)",
        "SB(1,2)",
    ];
    NAMES[model]
}

/// An enabled subset of model indices, restricting the search space for a
/// run.
///
/// The optimizer searches a continuous relaxation over *positions* in this
/// subset; [`ModelSubset::nearest`] maps a continuous position back to a
/// concrete model index. This is a model-space reduction the candidate
/// generator respects, not a runtime guard inside [`rate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSubset {
    indices: Vec<usize>,
}

impl ModelSubset {
    /// Subset containing the whole catalog.
    pub fn all() -> Self {
        Self {
            indices: (0..MODEL_COUNT).collect(),
        }
    }

    /// Build a subset from explicit model indices.
    ///
    /// Indices are sorted and deduplicated; the subset must be non-empty and
    /// every index must be in range.
    pub fn new(mut indices: Vec<usize>) -> Result<Self, EngineError> {
        indices.sort_unstable();
        indices.dedup();
        if indices.is_empty() {
            return Err(EngineError::Config("enabled model subset is empty".into()));
        }
        if let Some(&bad) = indices.iter().find(|&&m| m >= MODEL_COUNT) {
            return Err(EngineError::Config(format!(
                "enabled model index {bad} out of range (0..{MODEL_COUNT})"
            )));
        }
        Ok(Self { indices })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Map a continuous subset position to a concrete model index.
    ///
    /// The position is rounded to the nearest integer and clamped into
    /// `[0, len − 1]`; there is no wraparound, so values below 0 map to the
    /// first enabled model and values above the range to the last.
    pub fn nearest(&self, position: f64) -> usize {
        let last = (self.indices.len() - 1) as f64;
        let p = if position.is_finite() {
            position.round().clamp(0.0, last)
        } else {
            0.0
        };
        self.indices[p as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_models_finite_and_non_negative_on_open_interval() {
        for m in 0..MODEL_COUNT {
            for i in 1..100 {
                let alpha = i as f64 / 100.0;
                let f = rate(m, alpha);
                assert!(
                    f.is_finite() && f >= 0.0,
                    "model {} ({}) at alpha={alpha}: f={f}",
                    m,
                    model_name(m)
                );
            }
        }
    }

    #[test]
    fn boundary_values_are_clamped_finite() {
        for m in 0..MODEL_COUNT {
            for alpha in [0.0, 1.0, -0.5, 1.5] {
                let f = rate(m, alpha);
                assert!(
                    f.is_finite() && f >= 0.0,
                    "model {} ({}) at alpha={alpha}: f={f}",
                    m,
                    model_name(m)
                );
            }
        }
    }

    #[test]
    fn first_order_matches_closed_form() {
        // F1 is f(α) = 1 − α.
        assert!((rate(3, 0.25) - 0.75).abs() < 1e-12);
        assert!((rate(3, 0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn subset_nearest_rounds_and_clamps() {
        let subset = ModelSubset::new(vec![3, 10, 27]).unwrap();
        assert_eq!(subset.nearest(-2.0), 3);
        assert_eq!(subset.nearest(0.4), 3);
        assert_eq!(subset.nearest(0.6), 10);
        assert_eq!(subset.nearest(1.0), 10);
        assert_eq!(subset.nearest(7.0), 27);
        assert_eq!(subset.nearest(f64::NAN), 3);
    }

    #[test]
    fn subset_rejects_empty_and_out_of_range() {
        assert!(ModelSubset::new(vec![]).is_err());
        assert!(ModelSubset::new(vec![MODEL_COUNT]).is_err());
    }

    #[test]
    fn subset_all_covers_catalog() {
        let subset = ModelSubset::all();
        assert_eq!(subset.len(), MODEL_COUNT);
        assert_eq!(subset.nearest((MODEL_COUNT - 1) as f64), MODEL_COUNT - 1);
    }
}
