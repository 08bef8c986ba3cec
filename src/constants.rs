//! # Constants and type definitions for treefit
//!
//! This module centralizes the **physical constants**, **reference masses and lifetimes**, and
//! **common type aliases** used throughout the `treefit` library.
//!
//! ## Units
//!
//! The fitter works in a fixed unit system:
//!
//! - momenta, energies and masses in GeV (natural units, `c = 1` for kinematics),
//! - lengths (vertices, decay lengths) in centimeters,
//! - proper times in picoseconds.
//!
//! The only place where `c` appears explicitly is the conversion between a decay length and a
//! proper time, see [`SPEED_OF_LIGHT`].

use nalgebra::SMatrix;

// -------------------------------------------------------------------------------------------------
// Physical constants and unit conversions
// -------------------------------------------------------------------------------------------------

/// Speed of light in cm/ps
pub const SPEED_OF_LIGHT: f64 = 0.029_979_245_8;

/// Numerical epsilon used to detect degenerate geometry and vanishing momenta
pub const EPS: f64 = 1e-12;

/// Relative tolerance below which the re-linearization of a single constraint stops
pub const RELINEARIZATION_TOLERANCE: f64 = 1e-10;

// -------------------------------------------------------------------------------------------------
// Reference particle properties (PDG)
// -------------------------------------------------------------------------------------------------

/// Charged pion mass (GeV)
pub const PION_MASS: f64 = 0.139_570_39;

/// Charged kaon mass (GeV)
pub const KAON_MASS: f64 = 0.493_677;

/// Proton mass (GeV)
pub const PROTON_MASS: f64 = 0.938_272_088;

/// Λ⁰ mass (GeV)
pub const LAMBDA_MASS: f64 = 1.115_683;

/// Λ⁰ mean lifetime (ps)
pub const LAMBDA_LIFETIME: f64 = 263.2;

/// Ξ⁻ mass (GeV)
pub const XI_MASS: f64 = 1.321_71;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Energy, momentum or mass in GeV
pub type GeV = f64;

/// Length in centimeters
pub type Centimeter = f64;

/// Proper time in picoseconds
pub type Picosecond = f64;

/// Covariance of (px, py, pz, E, x, y, z)
pub type Matrix7 = SMatrix<f64, 7, 7>;
