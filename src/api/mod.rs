pub mod config;
pub mod error;
pub mod model;
pub mod noise;
pub mod parse_paras;
pub mod synthesize;
