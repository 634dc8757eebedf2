//! BLE central session: waits for the radio, finds one peripheral advertising
//! a target service, connects, discovers one characteristic, and exposes
//! read, write and notifications on it to a host.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
