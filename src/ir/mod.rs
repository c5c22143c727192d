// src/ir/mod.rs
pub mod client;
pub mod links;
