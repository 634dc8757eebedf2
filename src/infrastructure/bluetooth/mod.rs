//! Bluetooth Module
//!
//! Drives a BLE central session against one peripheral and one
//! characteristic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SessionHandle                        │
//! │   (Host API - commands in, SessionEvents out)            │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!               ┌───────────────┐
//!               │  Orchestrator │
//!               └───────┬───────┘
//!       ┌──────────┬────┴─────┬────────────┬────────────────┐
//!       ▼          ▼          ▼            ▼                ▼
//! ┌─────────┐ ┌─────────┐ ┌──────────┐ ┌───────────┐ ┌────────────────┐
//! │ Adapter │ │ Scanner │ │Connection│ │ Discovery │ │ Characteristic │
//! └────┬────┘ └────┬────┘ └────┬─────┘ └─────┬─────┘ └───────┬────────┘
//!      └───────────┴───────────┼─────────────┴───────────────┘
//!                              ▼
//!                     ┌─────────────────┐
//!                     │   BleBackend    │
//!                     │ (platform radio │
//!                     │  or simulated)  │
//!                     └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Radio power state stream
//! - [`backend`] - Platform abstraction every component talks through
//! - [`characteristic`] - Read, write and notifications on one characteristic
//! - [`connection`] - Link establishment, timeouts and reconnects
//! - [`discovery`] - Cached service/characteristic lookup
//! - [`protocol`] - Target UUIDs and UUID parsing
//! - [`scanner`] - Filtered peripheral discovery
//! - [`service`] - Session orchestrator and host handle
//! - [`simulated`] - In-process backend for the demo and tests

pub mod adapter;
pub mod backend;
pub mod characteristic;
pub mod connection;
pub mod discovery;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;

pub use backend::BleBackend;
pub use service::{SessionConfig, SessionHandle};
pub use simulated::{SimulatedBackend, SimulatedPeripheral};
