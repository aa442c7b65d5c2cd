#![doc = "Drift-correcting periodic alarm loop."]

pub mod alarm;
pub mod expiration;
pub mod host;
pub mod periodic;
pub mod sim;

pub use alarm::*;
pub use expiration::*;
pub use host::*;
pub use periodic::*;
pub use sim::*;
