//! Backend-neutral rendering hardware interface

pub mod command;
pub mod device;
pub mod handle;
pub mod swap_chain;
pub mod types;

pub use command::*;
pub use device::RhiDevice;
pub use handle::*;
pub use swap_chain::*;
pub use types::*;
