//! Emulator modules.
//!
//! Modules provide the pipeline core with host functionality, such as drawing and presenting
//! frames, but do not perform any sort of emulation themselves.

pub mod render;
