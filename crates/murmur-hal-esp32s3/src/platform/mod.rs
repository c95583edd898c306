pub mod board;
pub mod pmu;
pub mod sleep;
