#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod graph;

pub use graph::*;
