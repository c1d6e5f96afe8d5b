//! Descriptor correspondence between a recipe and a frame.

use std::collections::HashMap;

use ndarray::Array2;

use crate::recipe::{DESCRIPTOR_BYTES, Descriptor};

const DESCRIPTOR_BITS: f32 = (DESCRIPTOR_BYTES * 8) as f32;

/// A recipe descriptor (`query`) paired with a frame descriptor (`train`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Nearest-neighbor ratio test with an absolute distance cap.
///
/// A query survives when its best distance is at most `max_distance` and
/// strictly below `ratio` times the second best. With a single train
/// descriptor there is no second neighbor and only the cap applies.
pub fn ratio_test(
    query: &[Descriptor],
    train: &[Descriptor],
    ratio: f32,
    max_distance: u32,
) -> Vec<DescriptorMatch> {
    if train.is_empty() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for (qi, q) in query.iter().enumerate() {
        let mut best = (u32::MAX, usize::MAX);
        let mut second = u32::MAX;
        for (ti, t) in train.iter().enumerate() {
            let dist = q.distance(t);
            if dist < best.0 {
                second = best.0;
                best = (dist, ti);
            } else if dist < second {
                second = dist;
            }
        }

        if best.0 > max_distance {
            continue;
        }
        if second != u32::MAX && best.0 as f32 >= ratio * second as f32 {
            continue;
        }
        matches.push(DescriptorMatch {
            query: qi,
            train: best.1,
            distance: best.0,
        });
    }
    matches
}

/// Make matches one-to-one.
///
/// Matches whose frame descriptor was chosen by a single query pass through.
/// Queries competing for the same frame descriptors are reassigned by
/// minimum-cost assignment over their Hamming distances; queries left
/// without a partner within `max_distance` are dropped.
pub fn resolve_conflicts(
    matches: Vec<DescriptorMatch>,
    query: &[Descriptor],
    train: &[Descriptor],
    max_distance: u32,
) -> Vec<DescriptorMatch> {
    let mut claims: HashMap<usize, usize> = HashMap::new();
    for m in &matches {
        *claims.entry(m.train).or_default() += 1;
    }

    let (mut resolved, contested): (Vec<_>, Vec<_>) =
        matches.into_iter().partition(|m| claims[&m.train] == 1);
    if contested.is_empty() {
        return resolved;
    }

    let mut targets: Vec<usize> = contested.iter().map(|m| m.train).collect();
    targets.sort_unstable();
    targets.dedup();

    let cost = Array2::from_shape_fn((contested.len(), targets.len()), |(i, j)| {
        query[contested[i].query].distance(&train[targets[j]]) as f32 / DESCRIPTOR_BITS
    });
    let assignment = linear_assignment(&cost, max_distance as f32 / DESCRIPTOR_BITS);

    for (row, col) in assignment.matches {
        let q = contested[row].query;
        let t = targets[col];
        resolved.push(DescriptorMatch {
            query: q,
            train: t,
            distance: query[q].distance(&train[t]),
        });
    }
    resolved.sort_by_key(|m| m.query);
    resolved
}

#[derive(Debug, Clone)]
pub struct AssignmentResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Minimum-cost one-to-one assignment; pairs costing more than `thresh`
/// are left unmatched.
pub fn linear_assignment(cost_matrix: &Array2<f32>, thresh: f32) -> AssignmentResult {
    let (num_rows, num_cols) = cost_matrix.dim();

    if num_rows == 0 || num_cols == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_rows: (0..num_rows).collect(),
            unmatched_cols: (0..num_cols).collect(),
        };
    }

    // lapjv needs a square matrix.
    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), 1e6);
    for i in 0..num_rows {
        for j in 0..num_cols {
            padded[[i, j]] = cost_matrix[[i, j]] as f64;
        }
    }

    let mut matches = vec![];
    let mut unmatched_rows = vec![];
    let mut col_free = vec![true; num_cols];

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => {
            for (row, &col) in row_to_col.iter().enumerate().take(num_rows) {
                if col < num_cols && cost_matrix[[row, col]] <= thresh {
                    matches.push((row, col));
                    col_free[col] = false;
                } else {
                    unmatched_rows.push(row);
                }
            }
        }
        Err(_) => {
            unmatched_rows = (0..num_rows).collect();
        }
    }

    let unmatched_cols = col_free
        .iter()
        .enumerate()
        .filter_map(|(i, &free)| free.then_some(i))
        .collect();

    AssignmentResult {
        matches,
        unmatched_rows,
        unmatched_cols,
    }
}
