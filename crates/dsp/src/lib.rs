// Copyright 2025-2026 Aurora Radar Group

//! Receive-chain filter design and per-sequence decimation planning.

pub mod filters;
pub mod plan;

pub use filters::{build_stage_filters, FilterBank, FilterError};
pub use plan::{DecimationPlan, PlanError, StagePlan};
