pub mod checksum;
pub mod chglog;
pub mod chunk;
pub mod cleanup;
pub mod controller;
pub mod direct;
pub mod hooks;
pub mod idents;
pub mod probe;
pub mod progress;
pub mod replay;
pub mod state_file;

pub use controller::{OscState, PayloadController};
