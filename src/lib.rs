//! CVaR Allocator Library
//!
//! Regime-aware CVaR portfolio allocation with walk-forward evaluation and
//! ensemble/hybrid blending

pub mod backtesting;
pub mod config;
pub mod error;
pub mod optimizer;
pub mod persistence;
pub mod risk;
pub mod types;

pub use error::{AllocError, CycleFlag};
