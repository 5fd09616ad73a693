pub mod graph;
pub mod topo;
