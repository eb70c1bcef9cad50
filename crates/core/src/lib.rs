pub mod model;

pub use model::{NodeId, ROOT_ID, TimerError, TimerNode, TimerTree};
