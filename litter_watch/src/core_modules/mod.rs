// Per-camera building blocks. None of these types are shared between cameras.

pub mod cooldown;
pub mod overlay;
pub mod ring_buffer;
pub mod tracker;
