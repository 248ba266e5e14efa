pub mod agent;
pub mod digital_twin;
pub mod heat_pump;
pub mod trade;
pub mod types;

pub use agent::*;
pub use digital_twin::*;
pub use trade::*;
pub use types::*;
