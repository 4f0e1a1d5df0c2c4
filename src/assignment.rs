/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of celltrack-watershed.

  celltrack-watershed is free software: you can redistribute it and/or modify it
  under the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  celltrack-watershed is distributed in the hope that it will be useful, but
  WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
  FITNESS FOR A PARTICULAR PURPOSE. See the European Union Public License for
  more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with celltrack-watershed.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Minimum-cost bipartite assignment.

use ndarray as nd;
use serde::{Deserialize, Serialize};

/// Cost of a pair that may never be assigned. Any cost at or above this value
/// is treated as forbidden.
pub const FORBIDDEN: f64 = 1e9;

/// Algorithm used to match regions across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSolver {
  /// Optimal assignment (Kuhn-Munkres with potentials), `O(n³)`
  #[default]
  Hungarian,
  /// Cheapest pair first, `O(n² log n)`
  Greedy,
}

impl AssignmentSolver {
  /// Assigns rows to columns of `cost`. Returns `(row, column)` pairs in
  /// ascending row order. Forbidden pairs are never returned, so rows and
  /// columns without an allowed partner stay unassigned.
  pub fn solve(&self, cost: nd::ArrayView2<f64>) -> Vec<(usize, usize)> {
    match self {
      AssignmentSolver::Hungarian => hungarian(cost),
      AssignmentSolver::Greedy => greedy(cost),
    }
  }
}

/// Optimal assignment of a rectangular cost matrix.
///
/// The matrix is padded to a square with forbidden costs. Because a forbidden
/// pair costs more than any sum of allowed pairs, the solution first
/// maximises the number of allowed pairs and then minimises their total cost.
pub fn hungarian(cost: nd::ArrayView2<f64>) -> Vec<(usize, usize)> {
  let (n_rows, n_cols) = cost.dim();
  if n_rows == 0 || n_cols == 0 {
    return Vec::new();
  }
  let n = n_rows.max(n_cols);

  //Square cost matrix, padded and clamped to the forbidden cost
  let mut c = nd::Array2::from_elem((n, n), FORBIDDEN);
  c.slice_mut(nd::s![..n_rows, ..n_cols]).assign(&cost.mapv(|x| if x.is_nan() { FORBIDDEN } else { x.min(FORBIDDEN) }));

  //Potentials and matching are 1-indexed; index 0 is the dummy source column
  let mut u = vec![0.0f64; n + 1];
  let mut v = vec![0.0f64; n + 1];
  //p[j]: row assigned to column j (0 = unassigned)
  let mut p = vec![0usize; n + 1];
  //way[j]: predecessor of column j on the augmenting path
  let mut way = vec![0usize; n + 1];

  for i in 1..=n {
    p[0] = i;
    let mut j0 = 0usize;
    let mut min_val = vec![f64::INFINITY; n + 1];
    let mut used = vec![false; n + 1];

    //(1) shortest augmenting path, updating potentials as we go
    loop {
      used[j0] = true;
      let i0 = p[j0];
      let mut delta = f64::INFINITY;
      let mut j1 = 0usize;
      for j in 1..=n {
        if used[j] {
          continue;
        }
        let val = c[(i0 - 1, j - 1)] - u[i0] - v[j];
        if val < min_val[j] {
          min_val[j] = val;
          way[j] = j0;
        }
        if min_val[j] < delta {
          delta = min_val[j];
          j1 = j;
        }
      }
      for j in 0..=n {
        if used[j] {
          u[p[j]] += delta;
          v[j] -= delta;
        } else {
          min_val[j] -= delta;
        }
      }
      j0 = j1;
      if p[j0] == 0 {
        break;
      }
    }

    //(2) augment the matching along the path
    loop {
      p[j0] = p[way[j0]];
      j0 = way[j0];
      if j0 == 0 {
        break;
      }
    }
  }

  //(3) collect the real, allowed pairs
  let mut pairs: Vec<(usize, usize)> = (1..=n)
    .filter(|&j| p[j] != 0)
    .map(|j| (p[j] - 1, j - 1))
    .filter(|&(row, col)| row < n_rows && col < n_cols && cost[(row, col)] < FORBIDDEN)
    .collect();
  pairs.sort_unstable();
  pairs
}

/// Repeatedly assigns the cheapest remaining allowed pair (ties broken by row,
/// then column) until no allowed pair between free rows and columns remains.
pub fn greedy(cost: nd::ArrayView2<f64>) -> Vec<(usize, usize)> {
  let (n_rows, n_cols) = cost.dim();
  let mut candidates: Vec<((usize, usize), f64)> =
    cost.indexed_iter().filter(|&(_, &x)| x < FORBIDDEN).map(|(idx, &x)| (idx, x)).collect();
  candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

  let (mut row_free, mut col_free) = (vec![true; n_rows], vec![true; n_cols]);
  let mut pairs = Vec::new();
  for ((row, col), _) in candidates {
    if row_free[row] && col_free[col] {
      row_free[row] = false;
      col_free[col] = false;
      pairs.push((row, col));
    }
  }
  pairs.sort_unstable();
  pairs
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hungarian_finds_the_optimum_where_greedy_does_not() {
    //Greedy takes (0,0) first and is left with the expensive (1,1)
    let cost = nd::arr2(&[[1.0, 2.0], [2.0, 10.0]]);
    assert_eq!(hungarian(cost.view()), vec![(0, 1), (1, 0)]);
    assert_eq!(greedy(cost.view()), vec![(0, 0), (1, 1)]);
  }

  #[test]
  fn rectangular_matrices_leave_extra_rows_unassigned() {
    let cost = nd::arr2(&[[0.5], [0.1], [0.9]]);
    assert_eq!(hungarian(cost.view()), vec![(1, 0)]);
    let wide = nd::arr2(&[[0.7, 0.2, 0.4]]);
    assert_eq!(hungarian(wide.view()), vec![(0, 1)]);
  }

  #[test]
  fn forbidden_pairs_are_never_returned() {
    let cost = nd::arr2(&[[FORBIDDEN, 0.3], [FORBIDDEN, FORBIDDEN]]);
    assert_eq!(hungarian(cost.view()), vec![(0, 1)]);
    assert_eq!(greedy(cost.view()), vec![(0, 1)]);
    let none = nd::Array2::from_elem((2, 2), FORBIDDEN);
    assert!(hungarian(none.view()).is_empty());
  }

  #[test]
  fn more_pairs_beat_cheaper_pairs() {
    //Taking the cheap (0,0) would leave row 1 without a partner
    let cost = nd::arr2(&[[0.0, 1.5], [1.5, FORBIDDEN]]);
    assert_eq!(hungarian(cost.view()), vec![(0, 1), (1, 0)]);
  }

  #[test]
  fn empty_input() {
    let cost = nd::Array2::<f64>::zeros((0, 3));
    assert!(hungarian(cost.view()).is_empty());
    assert!(greedy(cost.view()).is_empty());
  }
}
