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

//! Stage timings, only compiled with the `debug` feature.

use std::time::Instant;

/// Wall-clock time spent in each stage of a run, in milliseconds.
#[derive(Clone, Debug, Default)]
pub struct PerfReport {
  pub stages: Vec<(&'static str, usize)>,
  pub total_ms: usize,
}

impl PerfReport {
  /// Runs `stage`, recording how long it took under `name`.
  pub fn time<T>(&mut self, name: &'static str, stage: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let out = stage();
    self.stages.push((name, start.elapsed().as_millis() as usize));
    out
  }

  pub fn stage_total(&self) -> usize {
    self.stages.iter().map(|&(_, ms)| ms).sum()
  }
}

impl std::fmt::Display for PerfReport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    writeln!(f, ">---------[Performance Summary]---------")?;
    for (name, ms) in &self.stages {
      writeln!(f, ">  {name}: {ms}ms")?;
    }
    writeln!(f, ">--------------------------------+ total")?;
    write!(
      f,
      ">  {}ms with {}ms overhead (Δt)",
      self.total_ms,
      self.total_ms.saturating_sub(self.stage_total())
    )
  }
}
