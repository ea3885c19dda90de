#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod context;
pub mod data;
pub mod defvars;
pub mod derivatives;
pub mod export;
pub mod fiml;
pub mod matrix;
pub mod model_file;
pub mod mvn;
pub mod partition;
pub mod row_fit;
pub mod state;
pub mod subset;
