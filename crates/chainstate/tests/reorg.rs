use std::collections::HashSet;

use chainscan_chainstate::{HeaderGraph, HeaderRecord};
use chainscan_primitives::{BlockHeader, Hash256};

const EASY_BITS: u32 = 0x207f_ffff;
const HARD_BITS: u32 = 0x203f_ffff;

fn make_header(prev: Hash256, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 4,
        prev_block: prev,
        merkle_root: [(nonce % 251) as u8; 32],
        time: 1_650_000_000 + nonce,
        bits,
        nonce,
    }
}

fn extend(graph: &mut HeaderGraph, from: Hash256, bits: &[u32], seed: u32) -> Vec<Hash256> {
    let mut prev = from;
    bits.iter()
        .enumerate()
        .map(|(offset, bits)| {
            let header = make_header(prev, *bits, seed + offset as u32);
            prev = header.hash();
            graph.add_header(HeaderRecord::new(header));
            prev
        })
        .collect()
}

fn assert_single_main_per_height(graph: &HeaderGraph) {
    let top = graph.top_height().expect("top height");
    let mut seen = HashSet::new();
    for node in graph.nodes().filter(|node| node.is_main_branch) {
        let height = node.height.expect("main header has a height");
        assert!(seen.insert(height), "two main headers at height {height}");
        assert_eq!(graph.header_by_height(height).map(|main| main.id), Some(node.id));
    }
    assert_eq!(seen.len() as u32, top + 1);
}

fn assert_top_has_most_work(graph: &HeaderGraph) {
    let top_work = graph.top().and_then(|node| node.chain_work).expect("top work");
    for node in graph.nodes() {
        if let Some(work) = node.chain_work {
            assert!(work <= top_work);
        }
    }
}

#[test]
fn concrete_fork_promotes_heavier_sibling() {
    let mut graph = HeaderGraph::new();
    let genesis = make_header([0u8; 32], EASY_BITS, 0);
    let genesis_hash = genesis.hash();
    graph.add_header(HeaderRecord::new(genesis));
    let h = extend(&mut graph, genesis_hash, &[EASY_BITS, EASY_BITS], 1);
    graph.organize();

    let h2_prime = extend(&mut graph, h[0], &[HARD_BITS], 50)[0];
    let state = graph.organize();
    assert!(state.is_reorg());
    assert!(state.has_new_top);
    assert_eq!(state.branch_point, graph.id_of(&h[0]));
    assert_eq!(state.common_ancestor(), graph.id_of(&h[0]));
    assert!(graph.is_main_branch(&h2_prime));
    assert!(!graph.is_main_branch(&h[1]));
    assert_eq!(graph.by_hash(&h[0]).and_then(|node| node.next), graph.id_of(&h2_prime));
    assert_single_main_per_height(&graph);
}

#[test]
fn branch_point_is_the_lowest_common_ancestor() {
    let mut graph = HeaderGraph::new();
    let chain_a = extend(&mut graph, [0u8; 32], &[EASY_BITS; 6], 0);
    graph.organize();
    let chain_b = extend(&mut graph, chain_a[2], &[EASY_BITS; 5], 100);
    let state = graph.organize();

    assert!(state.is_reorg());
    assert_eq!(state.branch_point, graph.id_of(&chain_a[2]));
    assert_eq!(graph.top().map(|node| node.hash), chain_b.last().copied());
    for hash in &chain_a[3..] {
        assert!(!graph.is_main_branch(hash));
    }
    assert_single_main_per_height(&graph);
    assert_top_has_most_work(&graph);

    // Switching back requires strictly more work.
    extend(&mut graph, chain_a[5], &[EASY_BITS; 3], 200);
    let state = graph.organize();
    assert!(state.is_reorg());
    assert_eq!(state.branch_point, graph.id_of(&chain_a[2]));
    assert_single_main_per_height(&graph);
}

#[test]
fn interleaved_batches_keep_invariants() {
    let mut graph = HeaderGraph::new();
    let trunk = extend(&mut graph, [0u8; 32], &[EASY_BITS; 4], 0);
    graph.organize();

    let mut forks = Vec::new();
    for (round, base) in trunk.iter().enumerate() {
        let bits: Vec<u32> = (0..=round)
            .map(|step| if step % 2 == 0 { HARD_BITS } else { EASY_BITS })
            .collect();
        forks.extend(extend(&mut graph, *base, &bits, 1_000 * (round as u32 + 1)));
        graph.organize();
        assert_single_main_per_height(&graph);
        assert_top_has_most_work(&graph);
    }

    let dups = graph.height_and_dup_map();
    assert_eq!(dups.len() as u32, graph.top_height().expect("height") + 1);
    for (height, dup) in dups {
        assert!(graph.is_valid_dup(height, dup));
    }
    assert!(forks.iter().any(|hash| graph.is_main_branch(hash)));
}

#[test]
fn first_seen_wins_among_equal_new_candidates() {
    let mut graph = HeaderGraph::new();
    let genesis = extend(&mut graph, [0u8; 32], &[EASY_BITS], 0)[0];
    graph.organize();
    let first = extend(&mut graph, genesis, &[EASY_BITS], 10)[0];
    let second = extend(&mut graph, genesis, &[EASY_BITS], 20)[0];
    let state = graph.organize();
    assert!(state.prev_top_still_valid);
    assert_eq!(graph.top().map(|node| node.hash), Some(first));
    assert!(!graph.is_main_branch(&second));
}
