//! Graph manipulation module for Caffe network definitions
//!
//! This module provides the core infrastructure for working with layer graphs:
//!
//! - [`LayerGraph`]: Ordered layer list with O(1) name and producer lookups
//! - [`LayerNode`]: One layer with typed connectivity
//! - [`maps`]: Type definitions and builders for graph maps
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::graph::{LayerGraph, LayerKind};
//!
//! let graph = LayerGraph::from_prototxt(&source)?;
//!
//! // Find layers
//! let convs = graph.find_nodes_by_kind(&LayerKind::Convolution);
//!
//! // Traverse graph
//! let idx = graph.position("bn1").unwrap();
//! if let Some((producer, node)) = graph.sole_producer(idx) {
//!     println!("bn1 reads from {}", node.name);
//! }
//! ```
//!
//! # Maps
//!
//! The graph maintains several maps for O(1) lookups:
//!
//! | Map | Description |
//! |-----|-------------|
//! | `name_index` | layer name → position |
//! | `producer_map` | position, input slot → writing layer |
//! | `consumer_map` | blob version → reading layers |

pub mod accessors;
pub mod layer_graph;
pub mod maps;
pub mod node;

// Re-export main types
pub use layer_graph::LayerGraph;
pub use maps::{BlobVersion, ConsumerMap, NameIndex, ProducerMap};
pub use node::{LayerKind, LayerNode, BATCH_NORM, CONVOLUTION, SCALE};
