use nalgebra as na;
use ndarray::prelude::*;

/// Pairwise euclidean distances, `rows` x `cols`.
pub fn distance_matrix(rows: &[na::Point2<f32>], cols: &[na::Point2<f32>]) -> Array2<f32> {
    Array2::from_shape_fn((rows.len(), cols.len()), |(r, c)| {
        na::distance(&rows[r], &cols[c])
    })
}

#[derive(Debug, Default, PartialEq)]
pub struct Assignment {
    /// `(row, col, distance)` in the order the pairs were picked.
    pub matched: Vec<(usize, usize, f32)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Greedy assignment by ascending distance.
///
/// Repeatedly takes the globally smallest remaining distance whose row and column are
/// both free, as long as it does not exceed `max_distance`. Equal distances keep
/// row-major order, so for a single row the earlier column wins.
pub fn greedy_assignment(dist: ArrayView2<'_, f32>, max_distance: f32) -> Assignment {
    let (nrows, ncols) = dist.dim();

    let mut candidates: Vec<(usize, usize, f32)> = dist
        .indexed_iter()
        .filter(|&(_, &d)| d <= max_distance)
        .map(|((r, c), &d)| (r, c, d))
        .collect();

    // stable, NaN never passes the filter above
    candidates.sort_by(|a, b| a.2.total_cmp(&b.2));

    let mut row_used = vec![false; nrows];
    let mut col_used = vec![false; ncols];
    let mut matched = Vec::with_capacity(nrows.min(ncols));

    for (r, c, d) in candidates {
        if row_used[r] || col_used[c] {
            continue;
        }

        row_used[r] = true;
        col_used[c] = true;
        matched.push((r, c, d));

        if matched.len() == nrows.min(ncols) {
            break;
        }
    }

    Assignment {
        matched,
        unmatched_rows: (0..nrows).filter(|&r| !row_used[r]).collect(),
        unmatched_cols: (0..ncols).filter(|&c| !col_used[c]).collect(),
    }
}
