//! Core logic: recipes, dependency resolution, planning, execution.

pub mod config;
pub mod error;
pub mod executor;
pub mod installer;
pub mod parser;
pub mod plan_cache;
pub mod planner;
pub mod recipe;
pub mod resolver;
pub mod state;
pub mod types;
pub mod version;
