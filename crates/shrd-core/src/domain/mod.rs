//! Domain types with no I/O: device identity and geometry.

pub mod device;
