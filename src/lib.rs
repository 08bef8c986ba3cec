//! Kinematic fit of particle decay trees.
//!
//! A decay chain (a head particle, its daughters, their daughters, down to measured tracks and
//! calorimeter clusters) is fitted as a whole with a sequential Kalman filter over a single
//! parameter vector. See [`estimator::Estimator`] for the entry point.

pub mod constants;
pub mod constraint;
pub mod decay_node;
pub mod decay_tree;
pub mod estimator;
pub mod fit_params;
pub mod geometry;
pub mod parameter_state;
pub mod particle;
pub mod result_mapper;
pub mod toy;
pub mod treefit_errors;
