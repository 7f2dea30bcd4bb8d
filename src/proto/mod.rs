//! Caffe network formats
//!
//! - [`caffe`]: protobuf messages for the binary `.caffemodel` parameter store
//! - [`text`]: reader/writer for the prototxt network definition
//! - [`extensions`]: helper methods on the protobuf messages

/// Binary `.caffemodel` messages
pub mod caffe;

/// Extension methods for Caffe protobuf types
pub mod extensions;

/// Protobuf text format (prototxt)
pub mod text;

// Re-export commonly used types at module level
pub use caffe::{BlobProto, BlobShape, LayerParameter, NetParameter};
pub use text::{TextMessage, TextValue};
