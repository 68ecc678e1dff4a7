// src/transport/mod.rs

//! Concrete transport implementations.
//!
//! The in-memory reference broker is always available and is the test
//! vehicle for the lifecycle layers. The lapin-backed AMQP transport is the
//! production implementation, behind the `transport-lapin` feature (on by
//! default).

pub mod memory;

#[cfg(feature = "transport-lapin")]
pub mod lapin;

use crate::TransportPtr;

pub use memory::MemoryTransport;

/// Create an in-memory transport.
pub fn create_memory_transport() -> TransportPtr {
    MemoryTransport::new()
}

/// Create a lapin-backed AMQP transport.
#[cfg(feature = "transport-lapin")]
pub fn create_lapin_transport() -> TransportPtr {
    lapin::LapinTransport::new()
}

/// Create the crate-default transport.
///
/// Feature-driven: the lapin transport when `transport-lapin` is enabled,
/// the in-memory broker otherwise.
pub fn create_transport() -> TransportPtr {
    // ---
    #[cfg(feature = "transport-lapin")]
    {
        create_lapin_transport()
    }

    #[cfg(not(feature = "transport-lapin"))]
    {
        create_memory_transport()
    }
}
