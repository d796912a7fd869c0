//! Background services

pub mod maintenance;

pub use maintenance::{MaintenanceConfig, MaintenanceHandle, MaintenanceService};
