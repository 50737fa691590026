pub mod doubao;
pub mod task;
