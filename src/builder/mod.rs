//! Model builder module for Caffe fusion
//!
//! This module assembles the parameter store of a rewritten network:
//!
//! - [`ModelBuilder`]: Fluent builder for constructing models
//!
//! # Overview
//!
//! After the topology rewrite and weight fusion, the builder combines the
//! fused convolution blobs with the unchanged blobs of every other layer.
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::builder::ModelBuilder;
//!
//! let store = ModelBuilder::new(&rewritten)
//!     .with_source(&original)
//!     .with_fused(fused)
//!     .build_store()?;
//! let net = store.to_net_parameter(&rewritten);
//! ```

pub mod model;

pub use model::ModelBuilder;
