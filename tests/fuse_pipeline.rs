//! End-to-end fusion tests on a small residual network.
//!
//! Builds a ResNet-style block with in-place and out-of-place chains, fuses
//! it, and checks the rewritten topology and the forward pass against the
//! original.

use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashMap;

use caffe_optimizer::prelude::*;

const DEPLOY: &str = r#"
name: "resnet_tiny"
input: "data"
input_shape { dim: 1 dim: 3 dim: 6 dim: 6 }

layer { name: "conv1" type: "Convolution" bottom: "data" top: "conv1"
        convolution_param { num_output: 4 kernel_size: 3 pad: 1 bias_term: false } }
layer { name: "bn_conv1" type: "BatchNorm" bottom: "conv1" top: "conv1" }
layer { name: "scale_conv1" type: "Scale" bottom: "conv1" top: "conv1" scale_param { bias_term: true } }
layer { name: "conv1_relu" type: "ReLU" bottom: "conv1" top: "conv1" }

layer { name: "res2a_branch1" type: "Convolution" bottom: "conv1" top: "res2a_branch1"
        convolution_param { num_output: 4 kernel_size: 1 bias_term: false } }
layer { name: "bn2a_branch1" type: "BatchNorm" bottom: "res2a_branch1" top: "res2a_branch1" }
layer { name: "scale2a_branch1" type: "Scale" bottom: "res2a_branch1" top: "res2a_branch1"
        scale_param { bias_term: true } }

layer { name: "res2a_branch2a" type: "Convolution" bottom: "conv1" top: "res2a_branch2a"
        convolution_param { num_output: 4 kernel_size: 3 pad: 1 } }
layer { name: "bn2a_branch2a" type: "BatchNorm" bottom: "res2a_branch2a" top: "res2a_branch2a" }
layer { name: "scale2a_branch2a" type: "Scale" bottom: "res2a_branch2a" top: "sc2a"
        scale_param { bias_term: true } }
layer { name: "res2a_branch2a_relu" type: "ReLU" bottom: "sc2a" top: "sc2a" }

layer { name: "res2a" type: "Eltwise" bottom: "res2a_branch1" bottom: "sc2a" top: "res2a" }
layer { name: "res2a_relu" type: "ReLU" bottom: "res2a" top: "res2a" }
layer { name: "pool" type: "Pooling" bottom: "res2a" top: "pool"
        pooling_param { pool: AVE global_pooling: true } }
layer { name: "fc" type: "InnerProduct" bottom: "pool" top: "fc" inner_product_param { num_output: 5 } }
layer { name: "prob" type: "Softmax" bottom: "fc" top: "prob" }
"#;

fn patterned(shape: &[usize], seed: usize, scale: f32) -> ArrayD<f32> {
    let mut i = seed;
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        i = (i * 1103 + 12345) % 1009;
        (i as f32 / 1009.0 - 0.5) * scale
    })
}

fn channel(values: &[f32]) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
}

fn batch_norm(seed: f32) -> Vec<ArrayD<f32>> {
    vec![
        channel(&[seed, -seed, 0.5 * seed, 2.0]),
        channel(&[4.0, 2.0 + seed, 8.0, 1.0]),
        channel(&[4.0]),
    ]
}

fn make_store() -> ParameterStore {
    let mut store = ParameterStore::new();
    store.insert("conv1", vec![patterned(&[4, 3, 3, 3], 1, 0.4)]);
    store.insert("bn_conv1", batch_norm(1.0));
    store.insert(
        "scale_conv1",
        vec![channel(&[1.0, 0.5, 1.5, 0.8]), channel(&[0.1, -0.1, 0.0, 0.2])],
    );

    store.insert("res2a_branch1", vec![patterned(&[4, 4, 1, 1], 2, 0.6)]);
    store.insert("bn2a_branch1", batch_norm(0.3));
    store.insert(
        "scale2a_branch1",
        vec![channel(&[0.9, 1.1, 1.0, 0.7]), channel(&[0.0, 0.05, -0.05, 0.0])],
    );

    store.insert(
        "res2a_branch2a",
        vec![
            patterned(&[4, 4, 3, 3], 3, 0.3),
            channel(&[0.1, 0.2, -0.1, 0.0]),
        ],
    );
    store.insert("bn2a_branch2a", batch_norm(-0.6));
    store.insert(
        "scale2a_branch2a",
        vec![channel(&[1.2, 0.6, 1.0, 1.3]), channel(&[-0.2, 0.0, 0.1, 0.0])],
    );

    store.insert(
        "fc",
        vec![patterned(&[5, 4], 4, 1.0), channel(&[0.0, 0.1, 0.2, 0.3, 0.4])],
    );
    store
}

fn assert_close(a: &ArrayD<f32>, b: &ArrayD<f32>) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!(
            (x - y).abs() <= 1e-4 * x.abs().max(1.0),
            "{} vs {} differ beyond tolerance",
            x,
            y
        );
    }
}

fn run(graph: &LayerGraph, store: &ParameterStore) -> FxHashMap<String, ArrayD<f32>> {
    let mut inputs = FxHashMap::default();
    inputs.insert("data".to_string(), patterned(&[1, 3, 6, 6], 5, 20.0));
    Network::new(graph, store).forward(inputs).unwrap()
}

#[test]
fn test_fused_topology() {
    let graph = LayerGraph::from_prototxt(DEPLOY).unwrap();
    let fused = fuse_model(&graph, &make_store(), &FuseOptions::default()).unwrap();

    assert_eq!(fused.result.patterns_matched, 3);
    assert_eq!(fused.graph.len(), graph.len() - 6);
    assert_eq!(fused.graph.count_kind(&LayerKind::Normalization), 0);
    assert_eq!(fused.graph.count_kind(&LayerKind::AffineScale), 0);

    for conv in ["conv1", "res2a_branch1", "res2a_branch2a"] {
        let node = fused.graph.find_by_name(&fused_name(conv)).unwrap();
        assert!(node.bias_term());
        assert_eq!(node.outputs, vec![fused_name(conv)]);
        assert!(!fused.graph.has_node(conv));
    }

    let eltwise = fused.graph.find_by_name("res2a").unwrap();
    assert_eq!(eltwise.inputs, vec!["res2a_branch1/mod", "res2a_branch2a/mod"]);
    let relu = fused.graph.find_by_name("res2a_branch2a_relu").unwrap();
    assert_eq!(relu.inputs, vec!["res2a_branch2a/mod"]);

    // Every reference must resolve in the written definition
    let reparsed = LayerGraph::from_prototxt(&fused.graph.to_prototxt()).unwrap();
    assert_eq!(reparsed, fused.graph);
}

#[test]
fn test_fused_forward_matches_original() {
    let graph = LayerGraph::from_prototxt(DEPLOY).unwrap();
    let store = make_store();
    let fused = fuse_model(&graph, &store, &FuseOptions::default()).unwrap();

    let original = run(&graph, &store);
    let rewritten = run(&fused.graph, &fused.store);

    assert_close(&original["res2a"], &rewritten["res2a"]);
    assert_close(&original["prob"], &rewritten["prob"]);
}

#[test]
fn test_refusing_is_identity() {
    let graph = LayerGraph::from_prototxt(DEPLOY).unwrap();
    let fused = fuse_model(&graph, &make_store(), &FuseOptions::default()).unwrap();
    let again = fuse_model(&fused.graph, &fused.store, &FuseOptions::default()).unwrap();

    assert_eq!(again.graph, fused.graph);
    assert_eq!(again.store, fused.store);
    assert!(again.result.is_empty());
}

#[test]
fn test_shared_convolution_output_is_kept() {
    let graph = LayerGraph::from_prototxt(
        r#"
input: "data"
input_shape { dim: 1 dim: 1 dim: 2 dim: 2 }
layer { name: "conv" type: "Convolution" bottom: "data" top: "conv"
        convolution_param { num_output: 1 kernel_size: 1 } }
layer { name: "bn" type: "BatchNorm" bottom: "conv" top: "bn" }
layer { name: "side" type: "ReLU" bottom: "conv" top: "side" }
"#,
    )
    .unwrap();
    let mut store = ParameterStore::new();
    store.insert("conv", vec![channel(&[1.0]).into_shape(IxDyn(&[1, 1, 1, 1])).unwrap()]);
    store.insert("bn", vec![channel(&[0.0]), channel(&[1.0]), channel(&[1.0])]);

    let fused = fuse_model(&graph, &store, &FuseOptions::default()).unwrap();
    assert_eq!(fused.graph, graph);
    assert_eq!(fused.store, store);
}

#[test]
fn test_fuse_files_with_equivalence_check() {
    let dir = std::env::temp_dir().join(format!("caffe_pipeline_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let deploy = dir.join("ResNet-tiny-deploy.prototxt");
    let model = dir.join("ResNet-tiny.caffemodel");

    let graph = LayerGraph::from_prototxt(DEPLOY).unwrap();
    let store = make_store();
    std::fs::write(&deploy, DEPLOY).unwrap();
    caffe_optimizer::io::save_net_parameter(&store.to_net_parameter(&graph), &model).unwrap();

    let options = FuseOptions::default()
        .with_equivalence_check(EquivalenceConfig::default().with_seed(2024));
    let stats = fuse_files(&deploy, &model, options).unwrap();

    assert_eq!(stats.chains_fused, 3);
    assert_eq!(stats.layers_removed(), 6);
    assert_eq!(stats.deploy_output, dir.join("ResNet-tiny-deploy-m.prototxt"));
    assert_eq!(stats.model_output, dir.join("ResNet-tiny-m.caffemodel"));
    assert_eq!(stats.save.parameterized_layers, 4);

    let report = stats.equivalence.unwrap();
    assert_eq!(report.seed, 2024);
    assert_eq!(report.original_output, "prob");
    assert!(report.matches());

    let written = load_parameter_store(&stats.model_output).unwrap();
    assert_eq!(written.len(), 4);
    assert_eq!(written.get("conv1/mod").unwrap().len(), 2);

    std::fs::remove_dir_all(&dir).ok();
}
