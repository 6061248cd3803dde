//! Data Lineage Module
//!
//! Directed acyclic graph of data assets and the transformations between
//! them, with bounded traversal and impact analysis.

pub mod graph;
pub mod models;

pub use graph::LineageTracker;
pub use models::{LineageEdge, LineageGraph, LineageNode, TraversalDirection};
