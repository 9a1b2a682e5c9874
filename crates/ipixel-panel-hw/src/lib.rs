//! iPixel Panel Hardware Library
//!
//! Drives stacks of iPixel BLE LED panels as one logical canvas: frame
//! encoding, per-unit connection management with reconnects, acknowledged
//! windowed animation uploads and power control.
//!
//! Units are reached over a serial BLE-UART bridge, or natively over BLE with
//! the `ble` feature.

pub mod canvas;
pub mod config;
pub mod connection;
pub mod error;
pub mod family;
pub mod link;
pub mod panel;
mod power;
pub mod protocol;
pub mod results;
pub mod router;
pub mod transfer;
pub mod unit;

pub use canvas::Canvas;
pub use config::PanelConfig;
pub use error::{ConnectionFailure, Error, Result, TransferFailure, TransferStep};
pub use family::{FamilyRegistry, PanelFamily};
pub use panel::{
    AnimationPlan, ImageOptions, PanelContext, PanelCore, PayloadKind, PayloadRecord,
};
pub use results::UnitResults;
pub use transfer::TransferOutcome;
pub use unit::{ConnectionState, Geometry, Unit, UnitId};
