//! Consume rating events and maintain the per-product statistics view.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod metrics_consts;
pub mod worker;
