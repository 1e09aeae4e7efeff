// src/control/mod.rs
//! Control surface: intercept mode, pending flows and per-flow decisions

pub mod plane;

pub use plane::ControlPlane;
