//! Asynchronous block I/O: volume, disk controller and write group.

pub mod controller;
pub mod volume;
pub mod write_group;

pub use controller::{BlockRange, DiskController, DiskEvent, IoMode};
pub use volume::{Volume, VolumeLayout};
pub use write_group::WriteGroup;
