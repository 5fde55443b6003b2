pub mod ai_parser;
pub mod heuristic;
pub mod persistence;
pub mod providers;
pub mod queue;
