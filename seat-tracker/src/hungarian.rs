//! Minimum-cost assignment (Kuhn-Munkres with potentials, O(n^3)).

/// Solve the assignment problem for a rectangular cost matrix.
///
/// `cost` has one inner `Vec` per row; all rows must have equal length.
/// Returns, for each row, the assigned column. With more rows than columns
/// some rows stay unassigned. Deterministic: among equal-cost solutions the
/// scan order (lowest indices first) decides.
pub fn solve(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let n = cost.len();
    if n == 0 {
        return Vec::new();
    }
    let m = cost[0].len();
    if m == 0 {
        return vec![None; n];
    }
    if n > m {
        // The core routine needs rows <= cols; transpose and invert.
        let transposed: Vec<Vec<f64>> = (0..m)
            .map(|j| (0..n).map(|i| cost[i][j]).collect())
            .collect();
        let by_col = solve_wide(&transposed);
        let mut out = vec![None; n];
        for (j, row) in by_col.iter().enumerate() {
            if let Some(i) = row {
                out[*i] = Some(j);
            }
        }
        return out;
    }
    solve_wide(cost)
}

/// Core routine; requires `rows <= cols`.
fn solve_wide(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let n = cost.len();
    let m = cost[0].len();
    // Potentials and matching, 1-indexed with column 0 as the virtual start.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut matched_row = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        matched_row[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = matched_row[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[matched_row[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if matched_row[j0] == 0 {
                break;
            }
        }
        // Walk the augmenting path back to the start.
        loop {
            let j1 = way[j0];
            matched_row[j0] = matched_row[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; n];
    for j in 1..=m {
        if matched_row[j] != 0 {
            assignment[matched_row[j] - 1] = Some(j - 1);
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &[Vec<f64>], assignment: &[Option<usize>]) -> f64 {
        assignment
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.map(|j| cost[i][j]))
            .sum()
    }

    #[test]
    fn square_optimal() {
        let cost = vec![
            vec![4.0, 1.0, 3.0],
            vec![2.0, 0.0, 5.0],
            vec![3.0, 2.0, 2.0],
        ];
        let a = solve(&cost);
        assert_eq!(a, vec![Some(1), Some(0), Some(2)]);
        assert_eq!(total(&cost, &a), 5.0);
    }

    #[test]
    fn more_columns_than_rows() {
        let cost = vec![vec![10.0, 1.0, 10.0, 10.0], vec![1.0, 10.0, 10.0, 10.0]];
        assert_eq!(solve(&cost), vec![Some(1), Some(0)]);
    }

    #[test]
    fn more_rows_than_columns_leaves_rows_unassigned() {
        let cost = vec![vec![5.0], vec![1.0], vec![3.0]];
        let a = solve(&cost);
        assert_eq!(a, vec![None, Some(0), None]);
    }

    #[test]
    fn empty_inputs() {
        assert!(solve(&[]).is_empty());
        let no_cols: Vec<Vec<f64>> = vec![vec![], vec![]];
        assert_eq!(solve(&no_cols), vec![None, None]);
    }

    #[test]
    fn deterministic_under_ties() {
        let cost = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        let a = solve(&cost);
        let b = solve(&cost);
        assert_eq!(a, b);
        assert_eq!(total(&cost, &a), 2.0);
    }

    #[test]
    fn identity_on_diagonal() {
        let n = 6;
        let cost: Vec<Vec<f64>> = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 0.0 } else { 1.0 }).collect())
            .collect();
        let a = solve(&cost);
        for (i, j) in a.iter().enumerate() {
            assert_eq!(*j, Some(i));
        }
    }
}
