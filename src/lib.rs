#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod byol;
pub mod config;
pub mod data;
pub mod eval;
pub mod metrics;
pub mod model;
pub mod training;
