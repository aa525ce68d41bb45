//! Helios protocol substrate for IEEE 1394 (FireWire) buses.
//!
//! This crate carries everything above the host controller: the bus data
//! model (packets, topologies, configuration ROMs), the asynchronous
//! transaction result codes, the device/unit/class registries and the
//! hardware supervisor that reconciles them after each bus reset. The
//! controller itself is driven by a separate crate (`ohci1394`) which talks
//! to this one through the `platform` and `hardware::BusAdapter` contracts.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod base;
pub mod class;
pub mod crc;
pub mod csr;
pub mod device;
pub mod error;
pub mod event;
pub mod hardware;
pub mod object;
pub mod packet;
pub mod platform;
pub mod report;
pub mod rom;
pub mod topology;
pub mod types;
pub mod unit;
pub mod worker;


pub use error::{HeliosError, Result};
pub use types::{Ack, NodeId, Quadlet, RCode, Speed, TCode};
