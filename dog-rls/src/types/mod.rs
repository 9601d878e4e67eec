pub mod ids;
pub mod phase;

pub use ids::InvocationId;
pub use phase::{Disposition, TxPhase};
