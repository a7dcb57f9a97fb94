pub mod position_ekf;

pub use position_ekf::{EkfSnapshot, EkfState, FixOutcome, PositionEkf};
