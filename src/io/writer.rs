//! Caffe network writer
//!
//! Save parameter stores. [`save_outputs`] writes a definition and its store
//! as a pair: both land or neither does.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use prost::Message;

use crate::error::CaffeResult;
use crate::graph::LayerGraph;
use crate::proto::NetParameter;

/// Save a `.caffemodel`
pub fn save_net_parameter<P: AsRef<Path>>(net: &NetParameter, path: P) -> CaffeResult<()> {
    write_bytes(path.as_ref(), &net.encode_to_vec())
}

/// Encode a `.caffemodel` to bytes
pub fn net_parameter_to_bytes(net: &NetParameter) -> Vec<u8> {
    net.encode_to_vec()
}

/// Sizes of a written output pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveStats {
    /// Prototxt size in bytes
    pub definition_bytes: usize,
    /// Caffemodel size in bytes
    pub parameter_bytes: usize,
    /// Layers in the definition
    pub layer_count: usize,
    /// Layers carrying blobs
    pub parameterized_layers: usize,
}

/// Write a definition and its parameter store together
///
/// Both are written to temporary siblings first and renamed into place
/// only once both writes succeeded. On failure the temporaries are removed
/// and neither destination is touched.
pub fn save_outputs<P1: AsRef<Path>, P2: AsRef<Path>>(
    graph: &LayerGraph,
    deploy_path: P1,
    net: &NetParameter,
    model_path: P2,
) -> CaffeResult<SaveStats> {
    let deploy_path = deploy_path.as_ref();
    let model_path = model_path.as_ref();

    let definition = graph.to_prototxt();
    let parameters = net.encode_to_vec();

    let deploy_tmp = temp_sibling(deploy_path);
    let model_tmp = temp_sibling(model_path);

    let staged = write_bytes(&deploy_tmp, definition.as_bytes())
        .and_then(|_| write_bytes(&model_tmp, &parameters));
    if let Err(e) = staged {
        remove_all(&[&deploy_tmp, &model_tmp]);
        return Err(e);
    }

    if let Err(e) = fs::rename(&deploy_tmp, deploy_path) {
        remove_all(&[&deploy_tmp, &model_tmp]);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&model_tmp, model_path) {
        remove_all(&[&model_tmp, deploy_path]);
        return Err(e.into());
    }

    tracing::debug!(
        deploy = %deploy_path.display(),
        model = %model_path.display(),
        "wrote outputs"
    );

    Ok(SaveStats {
        definition_bytes: definition.len(),
        parameter_bytes: parameters.len(),
        layer_count: graph.len(),
        parameterized_layers: net.parameterized_layer_count(),
    })
}

fn write_bytes(path: &Path, bytes: &[u8]) -> CaffeResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

fn remove_all(paths: &[&Path]) {
    for path in paths {
        fs::remove_file(path).ok();
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp{}", std::process::id()));
    path.with_file_name(name)
}
