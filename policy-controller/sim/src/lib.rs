//! In-process implementations of the controller's external collaborators.
//!
//! The controller core consumes the northbound database, the address-set
//! registry, the logical-port cache, and the event framework through traits.
//! This crate provides deterministic in-memory versions of all four, with
//! the inspection and failure-injection hooks the test suites need. The
//! binary also wires them up when run as a compilation prototype without a
//! live northbound connection.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod addr_sets;
pub mod nb;
pub mod port_cache;
pub mod watch;

pub use self::addr_sets::MemAddressSets;
pub use self::nb::MemNb;
pub use self::port_cache::MemPortCache;
pub use self::watch::SimWatches;
