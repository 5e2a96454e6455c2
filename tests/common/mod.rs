#![allow(dead_code)]

pub mod builders;
pub mod fake_client;
pub mod strategies;

pub use builders::*;
pub use fake_client::*;
