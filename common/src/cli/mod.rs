//! CLI policy shared by the server and client binaries.

mod color;

pub use color::ColorWhen;
