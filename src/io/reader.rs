//! Caffe network reader
//!
//! Load network definitions (prototxt) and parameter stores (caffemodel).

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use prost::Message;

use crate::error::CaffeResult;
use crate::graph::LayerGraph;
use crate::params::ParameterStore;
use crate::proto::NetParameter;

/// Load a network definition from a prototxt file
///
/// # Example
///
/// ```ignore
/// use caffe_optimizer::io::load_net_definition;
///
/// let graph = load_net_definition("deploy.prototxt")?;
/// println!("{} layers", graph.len());
/// ```
pub fn load_net_definition<P: AsRef<Path>>(path: P) -> CaffeResult<LayerGraph> {
    let source = fs::read_to_string(path.as_ref())?;
    LayerGraph::from_prototxt(&source)
}

/// Load a `.caffemodel` file
pub fn load_net_parameter<P: AsRef<Path>>(path: P) -> CaffeResult<NetParameter> {
    let file = File::open(path.as_ref())?;

    let mut reader = BufReader::new(file);
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;

    load_net_parameter_from_bytes(&buffer)
}

/// Decode a `.caffemodel` from bytes
pub fn load_net_parameter_from_bytes(bytes: &[u8]) -> CaffeResult<NetParameter> {
    Ok(NetParameter::decode(bytes)?)
}

/// Load a `.caffemodel` file straight into a [`ParameterStore`]
pub fn load_parameter_store<P: AsRef<Path>>(path: P) -> CaffeResult<ParameterStore> {
    let net = load_net_parameter(path)?;
    let store = ParameterStore::from_net_parameter(&net)?;
    tracing::debug!(
        layers = store.len(),
        values = store.total_values(),
        "loaded parameter store"
    );
    Ok(store)
}
