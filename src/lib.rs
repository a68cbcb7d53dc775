//! Joystick-class gamepad input pipeline
//!
//! Decodes the 8-byte records of a Linux joystick device (`/dev/input/jsX`)
//! into named DualShock 4 style button and axis events and keeps the
//! current value of every control in a shared cache.
//!
//! See [`controller`] for the pipeline and [`config`] for file-based settings.

pub mod config;
pub mod controller;
