//! Caffe protobuf messages
//!
//! Hand-maintained subset of `caffe.proto` covering what a `.caffemodel`
//! parameter store needs. Tags match upstream Caffe so files written here
//! load in Caffe and vice versa; fields outside this subset are skipped on
//! decode.

#![allow(missing_docs)]

/// Top-level network message (`.caffemodel` root)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetParameter {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "3")]
    pub input: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "8")]
    pub input_shape: ::prost::alloc::vec::Vec<BlobShape>,
    #[prost(int32, repeated, packed = "false", tag = "4")]
    pub input_dim: ::prost::alloc::vec::Vec<i32>,
    #[prost(message, repeated, tag = "100")]
    pub layer: ::prost::alloc::vec::Vec<LayerParameter>,
}

/// A single layer with its learned blobs
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LayerParameter {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub r#type: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "3")]
    pub bottom: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "4")]
    pub top: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "7")]
    pub blobs: ::prost::alloc::vec::Vec<BlobProto>,
}

/// N-d blob shape
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobShape {
    #[prost(int64, repeated, tag = "1")]
    pub dim: ::prost::alloc::vec::Vec<i64>,
}

/// Blob storage, either N-d `shape` or legacy 4-d `num/channels/height/width`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobProto {
    #[prost(message, optional, tag = "7")]
    pub shape: ::core::option::Option<BlobShape>,
    #[prost(float, repeated, tag = "5")]
    pub data: ::prost::alloc::vec::Vec<f32>,
    #[prost(float, repeated, tag = "6")]
    pub diff: ::prost::alloc::vec::Vec<f32>,
    #[prost(double, repeated, tag = "8")]
    pub double_data: ::prost::alloc::vec::Vec<f64>,
    #[prost(double, repeated, tag = "9")]
    pub double_diff: ::prost::alloc::vec::Vec<f64>,
    #[prost(int32, tag = "1")]
    pub num: i32,
    #[prost(int32, tag = "2")]
    pub channels: i32,
    #[prost(int32, tag = "3")]
    pub height: i32,
    #[prost(int32, tag = "4")]
    pub width: i32,
}
