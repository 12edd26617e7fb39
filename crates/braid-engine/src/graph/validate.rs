use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use braid_core::error::ValidationError;

use super::{BlockMode, EdgeCondition, Graph, LoopRegion, ValidatedGraph};
use crate::expr::{CompiledInput, Guard};

type VResult<T> = std::result::Result<T, ValidationError>;

/// Validate a graph. Checks run in a fixed order so the same graph always
/// reports the same error.
pub fn validate(graph: Graph) -> VResult<ValidatedGraph> {
    if graph.blocks.is_empty() {
        return Err(ValidationError::EmptyGraph);
    }

    let mut index = HashMap::with_capacity(graph.blocks.len());
    for (i, block) in graph.blocks.iter().enumerate() {
        if index.insert(block.id.clone(), i).is_some() {
            return Err(ValidationError::DuplicateBlock(block.id.clone()));
        }
    }

    let entry = *index
        .get(&graph.entry)
        .ok_or_else(|| ValidationError::UnknownEntry(graph.entry.clone()))?;

    for edge in &graph.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !index.contains_key(endpoint) {
                return Err(ValidationError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    let end_of_start = pair_loops(&graph, &index)?;

    // Back edges are ignored for scheduling; everything else must be acyclic.
    let n = graph.blocks.len();
    let back_edges: Vec<bool> = graph
        .edges
        .iter()
        .map(|e| {
            matches!(
                &graph.blocks[index[&e.from]].mode,
                BlockMode::LoopEnd { start } if *start == e.to
            )
        })
        .collect();
    let mut incoming = vec![Vec::new(); n];
    let mut outgoing = vec![Vec::new(); n];
    for (ei, edge) in graph.edges.iter().enumerate() {
        if !back_edges[ei] {
            outgoing[index[&edge.from]].push(ei);
            incoming[index[&edge.to]].push(ei);
        }
    }

    let topo = topo_sort(&graph, &index, &incoming, &outgoing)?;

    if !incoming[entry].is_empty() {
        return Err(ValidationError::EntryHasIncoming(graph.entry.clone()));
    }

    let reachable = reach(&graph, &index, &outgoing, entry, None);
    let unreachable: Vec<String> = graph
        .blocks
        .iter()
        .enumerate()
        .filter(|(i, _)| !reachable.contains(i))
        .map(|(_, b)| b.id.clone())
        .collect();
    if !unreachable.is_empty() {
        return Err(ValidationError::Unreachable(unreachable));
    }

    let regions = loop_regions(&graph, &index, &incoming, &outgoing, &end_of_start)?;
    check_joins(&graph, &index, &incoming, &topo, entry)?;

    // Parse every expression before checking what they reference.
    let mut guards = Vec::with_capacity(graph.edges.len());
    for edge in &graph.edges {
        guards.push(match &edge.condition {
            EdgeCondition::Conditional { expr } => {
                Some(Guard::parse(expr).map_err(|reason| ValidationError::InvalidGuard {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    reason,
                })?)
            }
            _ => None,
        });
    }

    let mut conditions = HashMap::new();
    let mut inputs = Vec::with_capacity(n);
    for block in &graph.blocks {
        if let BlockMode::LoopStart { condition, .. } = &block.mode {
            let guard = Guard::parse(condition).map_err(|reason| {
                ValidationError::InvalidExpression {
                    block: block.id.clone(),
                    reason: format!("loop condition: {}", reason),
                }
            })?;
            conditions.insert(block.id.clone(), guard);
        }
        let mut compiled = BTreeMap::new();
        for (name, expr) in &block.inputs {
            let input = CompiledInput::compile(expr).map_err(|reason| {
                ValidationError::InvalidExpression {
                    block: block.id.clone(),
                    reason: format!("input '{}': {}", name, reason),
                }
            })?;
            compiled.insert(name.clone(), input);
        }
        inputs.push(compiled);
    }

    let known = |owner: &str, reference: &str| -> VResult<()> {
        if index.contains_key(reference) {
            Ok(())
        } else {
            Err(ValidationError::UnknownBlockReference {
                block: owner.to_string(),
                reference: reference.to_string(),
            })
        }
    };
    for (edge, guard) in graph.edges.iter().zip(&guards) {
        if let Some(guard) = guard {
            for r in guard.block_references() {
                known(&edge.from, r)?;
            }
        }
    }
    for (block, compiled) in graph.blocks.iter().zip(&inputs) {
        if let Some(guard) = conditions.get(&block.id) {
            for r in guard.block_references() {
                known(&block.id, r)?;
            }
        }
        for input in compiled.values() {
            for r in input.block_references() {
                known(&block.id, r)?;
            }
        }
    }

    let mut loops = Vec::with_capacity(regions.len());
    let mut loop_by_start = HashMap::new();
    let mut loop_by_end = HashMap::new();
    for (start, end, body) in regions {
        let max_iterations = match &graph.blocks[start].mode {
            BlockMode::LoopStart { max_iterations, .. } => *max_iterations,
            _ => None,
        };
        let start_id = graph.blocks[start].id.clone();
        let end_id = graph.blocks[end].id.clone();
        loop_by_start.insert(start_id.clone(), loops.len());
        loop_by_end.insert(end_id.clone(), loops.len());
        loops.push(LoopRegion {
            condition: conditions.remove(&start_id).unwrap_or(Guard::Truthy(
                crate::expr::Operand::Literal(serde_json::Value::Bool(false)),
            )),
            start: start_id,
            end: end_id,
            body: body.iter().map(|&i| graph.blocks[i].id.clone()).collect(),
            max_iterations,
        });
    }

    Ok(ValidatedGraph {
        graph,
        index,
        incoming,
        outgoing,
        back_edges,
        topo,
        inputs,
        guards,
        loops,
        loop_by_start,
        loop_by_end,
    })
}

/// Match every loop-end to its loop-start. Returns start index -> end index.
fn pair_loops(graph: &Graph, index: &HashMap<String, usize>) -> VResult<BTreeMap<usize, usize>> {
    let mut end_of_start = BTreeMap::new();
    for (i, block) in graph.blocks.iter().enumerate() {
        if let BlockMode::LoopEnd { start } = &block.mode {
            let start_idx = index
                .get(start)
                .copied()
                .filter(|&s| matches!(graph.blocks[s].mode, BlockMode::LoopStart { .. }))
                .ok_or_else(|| ValidationError::LoopEndWithoutStart {
                    end: block.id.clone(),
                    start: start.clone(),
                })?;
            if let Some(first) = end_of_start.insert(start_idx, i) {
                return Err(ValidationError::LoopStartSharedByEnds {
                    start: start.clone(),
                    first: graph.blocks[first].id.clone(),
                    second: block.id.clone(),
                });
            }
        }
    }
    for (i, block) in graph.blocks.iter().enumerate() {
        if let BlockMode::LoopStart { max_iterations, .. } = &block.mode {
            if !end_of_start.contains_key(&i) {
                return Err(ValidationError::LoopStartWithoutEnd(block.id.clone()));
            }
            if *max_iterations == Some(0) {
                return Err(ValidationError::ZeroLoopCap(block.id.clone()));
            }
        }
    }
    Ok(end_of_start)
}

/// Kahn's algorithm over forward edges, seeded in declaration order.
fn topo_sort(
    graph: &Graph,
    index: &HashMap<String, usize>,
    incoming: &[Vec<usize>],
    outgoing: &[Vec<usize>],
) -> VResult<Vec<usize>> {
    let n = graph.blocks.len();
    let mut indegree: Vec<usize> = incoming.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &ei in &outgoing[i] {
            let t = index[&graph.edges[ei].to];
            indegree[t] -= 1;
            if indegree[t] == 0 {
                queue.push_back(t);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    // Every leftover block still has an incoming edge from another leftover
    // block, so walking predecessors must revisit one.
    let mut seen: Vec<usize> = Vec::new();
    let mut cur = (0..n).find(|&i| indegree[i] > 0).unwrap_or(0);
    let cycle_start = loop {
        if let Some(pos) = seen.iter().position(|&s| s == cur) {
            break pos;
        }
        seen.push(cur);
        cur = incoming[cur]
            .iter()
            .map(|&ei| index[&graph.edges[ei].from])
            .find(|&p| indegree[p] > 0)
            .unwrap_or(cur);
    };
    let mut cycle: Vec<usize> = seen[cycle_start..].iter().rev().copied().collect();
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, &b)| b)
        .map(|(p, _)| p)
    {
        cycle.rotate_left(min_pos);
    }
    let mut path: Vec<String> = cycle.iter().map(|&i| graph.blocks[i].id.clone()).collect();
    if let Some(first) = path.first().cloned() {
        path.push(first);
    }
    Err(ValidationError::Cycle(path))
}

/// Blocks reachable from `from` over forward edges. With `stop`, that block
/// is included but not expanded.
fn reach(
    graph: &Graph,
    index: &HashMap<String, usize>,
    outgoing: &[Vec<usize>],
    from: usize,
    stop: Option<usize>,
) -> HashSet<usize> {
    let mut seen = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);
    while let Some(i) = queue.pop_front() {
        if Some(i) == stop {
            continue;
        }
        for &ei in &outgoing[i] {
            let t = index[&graph.edges[ei].to];
            if seen.insert(t) {
                queue.push_back(t);
            }
        }
    }
    seen
}

/// Compute and check each loop region. Returns `(start, end, body)` with the
/// body in declaration order.
fn loop_regions(
    graph: &Graph,
    index: &HashMap<String, usize>,
    incoming: &[Vec<usize>],
    outgoing: &[Vec<usize>],
    end_of_start: &BTreeMap<usize, usize>,
) -> VResult<Vec<(usize, usize, Vec<usize>)>> {
    let mut regions = Vec::with_capacity(end_of_start.len());

    for (&start, &end) in end_of_start {
        let start_id = &graph.blocks[start].id;
        let mut body = reach(graph, index, outgoing, start, Some(end));
        body.remove(&start);
        if !body.contains(&end) {
            return Err(ValidationError::LoopEndUnreachable {
                start: start_id.clone(),
                end: graph.blocks[end].id.clone(),
            });
        }

        let mut ordered: Vec<usize> = body.iter().copied().collect();
        ordered.sort_unstable();

        for &b in &ordered {
            for &ei in &incoming[b] {
                let src = index[&graph.edges[ei].from];
                if src != start && !body.contains(&src) {
                    return Err(ValidationError::LoopRegionEntered {
                        start: start_id.clone(),
                        block: graph.blocks[b].id.clone(),
                        from: graph.blocks[src].id.clone(),
                    });
                }
            }
            for &ei in &outgoing[b] {
                let dst = index[&graph.edges[ei].to];
                if b != end && !body.contains(&dst) {
                    return Err(ValidationError::LoopRegionExited {
                        start: start_id.clone(),
                        block: graph.blocks[b].id.clone(),
                        to: graph.blocks[dst].id.clone(),
                    });
                }
                // The loop-end leads out of the region; a body block fed by
                // it could never finish before the loop-end re-runs.
                if b == end && body.contains(&dst) {
                    return Err(ValidationError::LoopRegionEntered {
                        start: start_id.clone(),
                        block: graph.blocks[dst].id.clone(),
                        from: graph.blocks[end].id.clone(),
                    });
                }
            }
        }

        regions.push((start, end, ordered));
    }

    // Regions are disjoint or strictly nested.
    for (i, (si, _, bi)) in regions.iter().enumerate() {
        for (sj, _, bj) in regions.iter().skip(i + 1) {
            let set_i: HashSet<usize> = bi.iter().copied().chain([*si]).collect();
            let set_j: HashSet<usize> = bj.iter().copied().chain([*sj]).collect();
            if set_i.is_disjoint(&set_j) {
                continue;
            }
            let body_i: HashSet<usize> = bi.iter().copied().collect();
            let body_j: HashSet<usize> = bj.iter().copied().collect();
            if !(set_j.is_subset(&body_i) || set_i.is_subset(&body_j)) {
                return Err(ValidationError::OverlappingLoops {
                    first: graph.blocks[*si].id.clone(),
                    second: graph.blocks[*sj].id.clone(),
                });
            }
        }
    }

    Ok(regions)
}

/// Every parallel-join must have a parallel-fanout among its dominators.
fn check_joins(
    graph: &Graph,
    index: &HashMap<String, usize>,
    incoming: &[Vec<usize>],
    topo: &[usize],
    entry: usize,
) -> VResult<()> {
    let n = graph.blocks.len();
    let mut position = vec![0; n];
    for (pos, &b) in topo.iter().enumerate() {
        position[b] = pos;
    }

    // Immediate dominators over the forward DAG, filled in topological order.
    let mut idom: Vec<Option<usize>> = vec![None; n];
    idom[entry] = Some(entry);
    for &b in topo {
        if b == entry {
            continue;
        }
        let mut dom: Option<usize> = None;
        for &ei in &incoming[b] {
            let p = index[&graph.edges[ei].from];
            if idom[p].is_none() {
                continue;
            }
            dom = Some(match dom {
                None => p,
                Some(d) => intersect(&idom, &position, d, p),
            });
        }
        idom[b] = dom;
    }

    for (b, block) in graph.blocks.iter().enumerate() {
        if !matches!(block.mode, BlockMode::ParallelJoin) {
            continue;
        }
        let mut cur = b;
        let mut found = false;
        while let Some(d) = idom[cur] {
            if d == cur {
                break;
            }
            if matches!(graph.blocks[d].mode, BlockMode::ParallelFanout) {
                found = true;
                break;
            }
            cur = d;
        }
        if !found {
            return Err(ValidationError::JoinWithoutFanout(block.id.clone()));
        }
    }
    Ok(())
}

fn intersect(idom: &[Option<usize>], position: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while position[a] > position[b] {
            a = idom[a].unwrap_or(a);
        }
        while position[b] > position[a] {
            b = idom[b].unwrap_or(b);
        }
    }
    a
}
