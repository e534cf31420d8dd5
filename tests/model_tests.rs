//! Model-level checks: batch invariance, padding and end-to-end scoring.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use sessgraph::{
    BatchTensors, GraphBatch, ItemId, ModelConfig, SessionBatch, SessionGraphModel,
    SessionPipeline, Variant,
};

const N_ITEMS: usize = 9;

fn model(variant: Variant, varmap: &VarMap) -> SessionGraphModel {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    let config = ModelConfig::new(N_ITEMS).with_hidden(8).with_variant(variant);
    SessionGraphModel::new(config, vb).unwrap()
}

fn tensors(batch: &SessionBatch) -> BatchTensors {
    GraphBatch::build(batch).unwrap().to_tensors(&Device::Cpu).unwrap()
}

fn scores(m: &SessionGraphModel, batch: &SessionBatch) -> Vec<Vec<f32>> {
    m.forward_t(&tensors(batch), false)
        .unwrap()
        .to_vec2::<f32>()
        .unwrap()
}

fn max_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn sessions() -> Vec<Vec<ItemId>> {
    vec![vec![1, 2, 3, 2], vec![5], vec![4, 4, 6, 1, 2, 7]]
}

#[test]
fn batch_output_matches_individual_sessions() {
    let sessions = sessions();
    let targets = vec![1; sessions.len()];
    for variant in Variant::ALL {
        let varmap = VarMap::new();
        let m = model(variant, &varmap);

        let together = scores(&m, &SessionBatch::from_sessions(&sessions, targets.clone()).unwrap());
        for (i, session) in sessions.iter().enumerate() {
            let alone = SessionBatch::from_sessions(std::slice::from_ref(session), vec![1]).unwrap();
            let alone = scores(&m, &alone);
            let diff = max_diff(&together[i], &alone[0]);
            assert!(diff < 1e-4, "{variant}: session {i} differs by {diff}");
        }
    }
}

#[test]
fn repeated_session_matches_single() {
    let session = vec![vec![3, 1, 3, 8]];
    for variant in Variant::ALL {
        let varmap = VarMap::new();
        let m = model(variant, &varmap);

        let single = scores(&m, &SessionBatch::from_sessions(&session, vec![2]).unwrap());
        let repeated = vec![session[0].clone(); 4];
        let many = scores(&m, &SessionBatch::from_sessions(&repeated, vec![2; 4]).unwrap());
        for row in &many {
            assert!(max_diff(row, &single[0]) < 1e-4, "{variant}");
        }
    }
}

#[test]
fn extra_padding_contributes_nothing() {
    for variant in Variant::ALL {
        let varmap = VarMap::new();
        let m = model(variant, &varmap);

        let tight = SessionBatch::new(vec![vec![2, 6]], vec![vec![1, 1]], vec![3]).unwrap();
        let loose = SessionBatch::new(
            vec![vec![2, 6, 0, 0, 0, 0, 0]],
            vec![vec![1, 1, 0, 0, 0, 0, 0]],
            vec![3],
        )
        .unwrap();
        let diff = max_diff(&scores(&m, &tight)[0], &scores(&m, &loose)[0]);
        assert!(diff < 1e-5, "{variant}: padding changed scores by {diff}");
    }
}

#[test]
fn end_to_end_single_session() {
    let batch = SessionBatch::from_sessions(&[vec![1, 2, 3]], vec![4]).unwrap();
    let t = tensors(&batch);
    assert_eq!(t.items.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3]]);
    assert_eq!(t.alias_inputs.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 2]]);
    assert_eq!(t.adjacency.dims(), &[1, 3, 6]);
    assert_eq!(t.targets.to_vec1::<u32>().unwrap(), vec![3]);
    assert_eq!(t.last.to_vec1::<u32>().unwrap(), vec![2]);

    let varmap = VarMap::new();
    let m = model(Variant::SrGnn, &varmap);
    let out = m.forward_t(&t, false).unwrap();
    assert_eq!(out.dims(), &[1, N_ITEMS - 1]);
    let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn niser_scores_against_unit_items() {
    let varmap = VarMap::new();
    let m = model(Variant::Niser, &varmap);
    let batch = SessionBatch::from_sessions(&sessions(), vec![1, 2, 3]).unwrap();
    let out = m.forward_t(&tensors(&batch), false).unwrap();
    let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));

    let norms = m
        .table()
        .unwrap()
        .sqr()
        .unwrap()
        .sum(1)
        .unwrap()
        .sqrt()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-4));
}
