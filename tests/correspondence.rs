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

use celltrack_watershed::assignment::{greedy, hungarian, FORBIDDEN};
use celltrack_watershed::prelude::*;

const SHAPE: (usize, usize) = (40, 40);

fn with_regions(regions: &[(u16, std::ops::Range<usize>, std::ops::Range<usize>)]) -> nd::Array2<u16> {
  let mut raster = nd::Array2::zeros(SHAPE);
  for (label, rows, cols) in regions {
    raster.slice_mut(nd::s![rows.clone(), cols.clone()]).fill(*label);
  }
  raster
}

#[test]
fn zero_frames_give_a_zero_mask() {
  let zeros = nd::Array2::<u16>::zeros((100, 100));
  let engine = CorrespondenceEngine::default();
  let out = engine.correspond(Some(zeros.view()), Some(zeros.view()), (100, 100), 1).unwrap();
  assert!(out.mask.iter().all(|&l| l == 0));
  assert_eq!(out.cell_count(), 0);
}

#[test]
fn overlapping_region_keeps_its_identity() {
  let previous = with_regions(&[(5, 10..20, 10..20)]);
  let current = with_regions(&[(1, 11..21, 11..21)]);
  let out = CorrespondenceEngine::default().correspond(Some(previous.view()), Some(current.view()), SHAPE, 1).unwrap();

  assert_eq!(out.mask, with_regions(&[(5, 11..21, 11..21)]));
  assert_eq!(out.matched, vec![(5, 1)]);
  assert!(out.born.is_empty() && out.lost.is_empty());
  assert_eq!(out.next_identity, 6);
}

#[test]
fn disjoint_region_gets_a_fresh_identity() {
  let previous = with_regions(&[(3, 2..8, 2..8)]);
  let current = with_regions(&[(1, 25..32, 25..32)]);
  let out = CorrespondenceEngine::default().correspond(Some(previous.view()), Some(current.view()), SHAPE, 1).unwrap();

  assert_eq!(out.mask, with_regions(&[(4, 25..32, 25..32)]));
  assert!(!out.mask.iter().any(|&l| l == 3));
  assert_eq!(out.born, vec![4]);
  assert_eq!(out.lost, vec![3]);
}

#[test]
fn fallback_table() {
  let previous = with_regions(&[(2, 0..5, 0..5), (9, 20..30, 20..30)]);
  let current = with_regions(&[(1, 10..15, 10..15), (2, 30..35, 0..5)]);
  let engine = CorrespondenceEngine::default();

  //previous only: everything is lost
  let out = engine.correspond(Some(previous.view()), None, SHAPE, 1).unwrap();
  assert!(out.mask.iter().all(|&l| l == 0));
  assert_eq!(out.lost, vec![2, 9]);
  assert_eq!(out.next_identity, 10);

  //current only: passed through unchanged
  let out = engine.correspond(None, Some(current.view()), SHAPE, 1).unwrap();
  assert_eq!(out.mask, current);
  assert_eq!(out.born, vec![1, 2]);
  assert_eq!(out.next_identity, 3);

  //neither
  let out = engine.correspond(None, None, SHAPE, 7).unwrap();
  assert_eq!(out.mask, nd::Array2::<u16>::zeros(SHAPE));
  assert_eq!(out.next_identity, 7);
}

#[test]
fn identity_floor_is_respected() {
  let previous = with_regions(&[(3, 2..8, 2..8)]);
  let current = with_regions(&[(1, 2..8, 2..8), (2, 25..32, 25..32), (3, 33..36, 0..4)]);
  let out = CorrespondenceEngine::default().correspond(Some(previous.view()), Some(current.view()), SHAPE, 12).unwrap();

  assert_eq!(out.matched, vec![(3, 1)]);
  assert_eq!(out.born, vec![12, 13]);
  assert_eq!(out.mask[(30, 30)], 12);
  assert_eq!(out.mask[(34, 1)], 13);
  assert_eq!(out.next_identity, 14);
}

#[test]
fn largest_overlap_wins() {
  //Region 1 overlaps identity 7 by 30 px and identity 8 by 10 px
  let previous = with_regions(&[(7, 0..10, 0..10), (8, 0..10, 10..20)]);
  let current = with_regions(&[(1, 0..10, 7..11), (2, 0..10, 13..20)]);
  for solver in [AssignmentSolver::Hungarian, AssignmentSolver::Greedy] {
    let engine = CorrespondenceEngine::default().with_solver(solver);
    let out = engine.correspond(Some(previous.view()), Some(current.view()), SHAPE, 1).unwrap();
    assert_eq!(out.matched, vec![(7, 1), (8, 2)], "{solver:?}");
  }
}

#[test]
fn sole_overlap_keeps_identity_when_a_neighbour_ties_on_it() {
  //Region 1 only touches identity 1 (10 px). Region 2 touches identity 1 by
  //10 px and identity 2 by 20 px, region 3 covers identity 2 by 30 px.
  let previous = with_regions(&[(1, 0..10, 0..10), (2, 0..10, 20..30)]);
  let current = with_regions(&[(1, 0..10, 0..1), (2, 0..10, 9..22), (3, 0..10, 22..25)]);
  for solver in [AssignmentSolver::Hungarian, AssignmentSolver::Greedy] {
    let engine = CorrespondenceEngine::default().with_solver(solver);
    let out = engine.correspond(Some(previous.view()), Some(current.view()), SHAPE, 1).unwrap();
    assert_eq!(out.matched, vec![(1, 1), (2, 3)], "{solver:?}");
    assert_eq!(out.born, vec![3], "{solver:?}");
    assert!(out.lost.is_empty());
    assert_eq!(out.mask[(5, 0)], 1);
    assert_eq!(out.mask[(5, 15)], 3);
    assert_eq!(out.mask[(5, 23)], 2);
  }
}

#[test]
fn division_keeps_identity_on_the_larger_daughter() {
  let previous = with_regions(&[(4, 10..20, 10..30)]);
  let current = with_regions(&[(1, 10..20, 10..17), (2, 10..20, 18..30)]);
  let out = CorrespondenceEngine::default().correspond(Some(previous.view()), Some(current.view()), SHAPE, 1).unwrap();

  assert_eq!(out.matched, vec![(4, 2)]);
  assert_eq!(out.born, vec![5]);
  assert_eq!(out.mask[(15, 12)], 5);
  assert_eq!(out.mask[(15, 25)], 4);
}

#[test]
fn ambiguous_overlaps_are_solved_optimally() {
  //Identity 1 overlaps both current regions equally, identity 2 only region 2
  let previous = with_regions(&[(1, 0..4, 0..10), (2, 4..8, 5..10)]);
  let current = with_regions(&[(1, 0..8, 0..5), (2, 0..8, 5..10)]);
  let out = CorrespondenceEngine::default().correspond(Some(previous.view()), Some(current.view()), SHAPE, 1).unwrap();

  assert_eq!(out.matched, vec![(1, 1), (2, 2)]);
  assert!(out.born.is_empty() && out.lost.is_empty());
}

#[test]
fn shape_mismatch_is_rejected() {
  let previous = nd::Array2::<u16>::zeros((10, 10));
  let current = nd::Array2::<u16>::zeros((10, 11));
  let engine = CorrespondenceEngine::default();
  assert!(matches!(
    engine.correspond(Some(previous.view()), Some(current.view()), (10, 10), 1),
    Err(Error::ShapeMismatch { .. })
  ));
  assert!(matches!(engine.relabel(previous.view(), current.view(), 1), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn exhausted_identities_overflow() {
  let previous = with_regions(&[(u16::MAX, 0..5, 0..5)]);
  let current = with_regions(&[(1, 20..25, 20..25)]);
  let out = CorrespondenceEngine::default().correspond(Some(previous.view()), Some(current.view()), SHAPE, 1);
  assert!(matches!(out, Err(Error::LabelOverflow)));
}

#[test]
fn solvers_agree_on_easy_problems() {
  let cost = nd::arr2(&[[0.1, 0.9, FORBIDDEN], [0.8, 0.2, 0.7], [FORBIDDEN, 0.6, 0.05]]);
  assert_eq!(hungarian(cost.view()), vec![(0, 0), (1, 1), (2, 2)]);
  assert_eq!(greedy(cost.view()), hungarian(cost.view()));
}
