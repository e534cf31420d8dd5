//! Property-based tests for session graph construction and batching.
//!
//! These tests verify invariants that should hold for any batch of sessions:
//! - Adjacency halves are row-normalised
//! - Alias indices map every position back to its item
//! - Padding positions always alias to node 0
//! - Mini-batch slicing covers every session exactly once

use proptest::prelude::*;
use sessgraph::data::top_labels;
use sessgraph::{GraphBatch, ItemId, SessionBatch, SessionDataset, PADDING_ALIAS};

fn arb_session() -> impl Strategy<Value = Vec<ItemId>> {
    prop::collection::vec(1u32..12, 1..8)
}

fn arb_sessions() -> impl Strategy<Value = Vec<Vec<ItemId>>> {
    prop::collection::vec(arb_session(), 1..6)
}

fn build(sessions: &[Vec<ItemId>]) -> GraphBatch {
    let batch = SessionBatch::from_sessions(sessions, vec![1; sessions.len()]).unwrap();
    GraphBatch::build(&batch).unwrap()
}

mod graph_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn adjacency_halves_are_row_normalised(sessions in arb_sessions()) {
            let g = build(&sessions);
            let n = g.n_node();
            for adj in &g.adjacency {
                prop_assert_eq!(adj.len(), n * 2 * n);
                for row in adj.chunks(2 * n) {
                    for half in [&row[..n], &row[n..]] {
                        let sum: f32 = half.iter().sum();
                        prop_assert!(
                            sum == 0.0 || (sum - 1.0).abs() < 1e-5,
                            "row half sums to {}", sum
                        );
                        prop_assert!(half.iter().all(|&w| (0.0..=1.0).contains(&w)));
                    }
                }
            }
        }

        #[test]
        fn alias_round_trips_items(sessions in arb_sessions()) {
            let g = build(&sessions);
            for (b, session) in sessions.iter().enumerate() {
                for (pos, &item) in session.iter().enumerate() {
                    let node = g.alias_inputs[b][pos] as usize;
                    prop_assert_eq!(g.items[b][node], item);
                }
                for pos in session.len()..g.seq_len() {
                    prop_assert_eq!(g.alias_inputs[b][pos], PADDING_ALIAS);
                    prop_assert_eq!(g.mask[b][pos], 0);
                }
            }
        }

        #[test]
        fn items_are_sorted_unique_then_padding(sessions in arb_sessions()) {
            let g = build(&sessions);
            for (b, session) in sessions.iter().enumerate() {
                let mut unique = session.clone();
                unique.sort_unstable();
                unique.dedup();
                prop_assert_eq!(&g.items[b][..unique.len()], unique.as_slice());
                prop_assert!(g.items[b][unique.len()..].iter().all(|&id| id == 0));

                // padded nodes have no edges
                let n = g.n_node();
                for node in unique.len()..n {
                    let row = &g.adjacency[b][node * 2 * n..(node + 1) * 2 * n];
                    prop_assert!(row.iter().all(|&w| w == 0.0));
                }
            }
        }

        #[test]
        fn every_transition_is_an_edge(sessions in arb_sessions()) {
            let g = build(&sessions);
            for (b, session) in sessions.iter().enumerate() {
                for pair in session.windows(2) {
                    let from = g.items[b].iter().position(|&id| id == pair[0]).unwrap();
                    let to = g.items[b].iter().position(|&id| id == pair[1]).unwrap();
                    prop_assert!(g.out_weight(b, from, to) > 0.0);
                    prop_assert!(g.in_weight(b, from, to) > 0.0);
                }
            }
        }
    }
}

mod batching_props {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn shuffled_slices_cover_each_index_once(
            sessions in prop::collection::vec(arb_session(), 1..40),
            batch_size in 1usize..10,
            seed in any::<u64>(),
        ) {
            let targets = vec![1; sessions.len()];
            let data = SessionDataset::new(sessions, targets).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let slices = data.shuffled_batch_slices(batch_size, &mut rng).unwrap();

            prop_assert_eq!(slices.len(), data.len().div_ceil(batch_size));
            prop_assert!(slices[..slices.len() - 1].iter().all(|s| s.len() == batch_size));
            let mut seen: Vec<usize> = slices.concat();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..data.len()).collect::<Vec<_>>());
        }

        #[test]
        fn top_labels_stay_below_cut(
            labels in prop::collection::vec(1u32..8, 1..60),
            fraction in 0.05f64..1.0,
        ) {
            let top = top_labels(labels.iter().copied(), fraction);
            let covered = labels.iter().filter(|l| top.contains(l)).count();
            let cut = (labels.len() as f64 * fraction).round_ties_even() as usize;
            prop_assert!(covered < cut.max(1));

            // ranked by frequency
            let count = |l: &ItemId| labels.iter().filter(|x| *x == l).count();
            for pair in top.windows(2) {
                prop_assert!(count(&pair[0]) >= count(&pair[1]));
            }
        }
    }
}

mod augmentation_props {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use sessgraph::Augmentation;

    fn real(batch: &SessionBatch, i: usize) -> Vec<ItemId> {
        batch.inputs()[i][..batch.lengths()[i]].to_vec()
    }

    /// `long` is `short` with exactly one extra element; returns that element.
    fn one_extra(long: &[ItemId], short: &[ItemId]) -> Option<ItemId> {
        if long.len() != short.len() + 1 {
            return None;
        }
        (0..long.len()).find_map(|pos| {
            let mut rest = long.to_vec();
            let item = rest.remove(pos);
            (rest == short).then_some(item)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn augmented_rows_derive_from_eligible_sources(
            sessions in prop::collection::vec(arb_session(), 1..10),
            insertion in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let kind = if insertion { Augmentation::Insertion } else { Augmentation::Deletion };
            // distinct targets identify the source row of every copy
            let targets: Vec<ItemId> = (0..sessions.len() as u32).map(|i| 100 + i).collect();
            let batch = SessionBatch::from_sessions(&sessions, targets).unwrap();
            let seq_len = batch.seq_len();
            let pool: Vec<ItemId> = sessions.iter().flatten().copied().collect();
            let eligible: Vec<usize> = (0..batch.len())
                .filter(|&i| match kind {
                    Augmentation::Deletion => sessions[i].len() > 1,
                    Augmentation::Insertion => sessions[i].len() < seq_len,
                })
                .collect();

            let mut rng = StdRng::seed_from_u64(seed);
            let out = batch.augment(kind, &mut rng).unwrap();

            prop_assert_eq!(out.seq_len(), seq_len);
            prop_assert_eq!(&out.inputs()[..batch.len()], batch.inputs());
            prop_assert_eq!(&out.targets()[..batch.len()], batch.targets());
            prop_assert_eq!(out.len() - batch.len(), (eligible.len() as f64 * 0.8) as usize);

            let mut sources = Vec::new();
            for r in batch.len()..out.len() {
                let src = (out.targets()[r] - 100) as usize;
                prop_assert!(eligible.contains(&src), "row {} copied ineligible source {}", r, src);
                let copy = real(&out, r);
                let source = &sessions[src];
                match kind {
                    Augmentation::Deletion => prop_assert!(one_extra(source, &copy).is_some()),
                    Augmentation::Insertion => {
                        let item = one_extra(&copy, source);
                        prop_assert!(item.is_some_and(|i| pool.contains(&i)));
                    }
                }
                sources.push(src);
            }
            sources.sort_unstable();
            sources.dedup();
            prop_assert_eq!(sources.len(), out.len() - batch.len());
        }
    }
}

#[test]
fn single_item_session_has_no_edges() {
    let g = build(&[vec![7]]);
    assert_eq!(g.n_node(), 1);
    assert_eq!(g.adjacency[0], vec![0.0, 0.0]);
    assert_eq!(g.alias_inputs, vec![vec![0]]);
}

#[test]
fn revisit_with_padding() {
    // [a, b, a, 0, 0] with a = 4, b = 6
    let batch = SessionBatch::new(
        vec![vec![4, 6, 4, 0, 0]],
        vec![vec![1, 1, 1, 0, 0]],
        vec![1],
    )
    .unwrap();
    let g = GraphBatch::build(&batch).unwrap();

    assert_eq!(g.items, vec![vec![4, 6]]);
    assert_eq!(g.alias_inputs, vec![vec![0, 1, 0, PADDING_ALIAS, PADDING_ALIAS]]);
    assert_eq!(g.out_weight(0, 0, 1), 1.0);
    assert_eq!(g.out_weight(0, 1, 0), 1.0);
    assert_eq!(g.in_weight(0, 0, 1), 1.0);
    assert_eq!(g.in_weight(0, 1, 0), 1.0);
    assert_eq!(g.out_weight(0, 0, 0), 0.0);
    assert_eq!(g.out_weight(0, 1, 1), 0.0);
}

#[test]
fn end_to_end_chain() {
    let data = SessionDataset::new(vec![vec![1, 2, 3]], vec![4]).unwrap();
    let slices = data.batch_slices(1).unwrap();
    assert_eq!(slices, vec![vec![0]]);

    let g = data.get_slice(&slices[0]).unwrap();
    assert_eq!(g.items, vec![vec![1, 2, 3]]);
    assert_eq!(g.alias_inputs, vec![vec![0, 1, 2]]);
    assert_eq!(g.n_node(), 3);
    assert_eq!(g.adjacency[0].len(), 3 * 6);
    assert_eq!(g.out_weight(0, 0, 1), 1.0);
    assert_eq!(g.out_weight(0, 1, 2), 1.0);
    assert_eq!(g.in_weight(0, 0, 1), 1.0);
    assert_eq!(g.in_weight(0, 1, 2), 1.0);
    let total: f32 = g.adjacency[0].iter().sum();
    assert_eq!(total, 4.0);
}
