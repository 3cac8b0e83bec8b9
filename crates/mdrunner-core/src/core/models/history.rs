/// Running sums of the energy terms, used for averages and fluctuations over the
/// whole run, including all previous parts of a restarted run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnergyHistory {
    pub term_names: Vec<String>,
    pub samples: u64,
    pub sums: Vec<f64>,
    pub sums_of_squares: Vec<f64>,
}

impl EnergyHistory {
    pub fn with_terms(names: &[&str]) -> Self {
        Self {
            term_names: names.iter().map(|n| n.to_string()).collect(),
            samples: 0,
            sums: vec![0.0; names.len()],
            sums_of_squares: vec![0.0; names.len()],
        }
    }

    pub fn accumulate(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.sums.len());
        for (i, v) in values.iter().enumerate() {
            self.sums[i] += v;
            self.sums_of_squares[i] += v * v;
        }
        self.samples += 1;
    }

    pub fn average(&self, term: usize) -> Option<f64> {
        (self.samples > 0).then(|| self.sums[term] / self.samples as f64)
    }

    pub fn fluctuation(&self, term: usize) -> Option<f64> {
        let mean = self.average(term)?;
        let mean_sq = self.sums_of_squares[term] / self.samples as f64;
        Some((mean_sq - mean * mean).max(0.0).sqrt())
    }
}

/// Time-averaged restraint values that a restart must continue from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RestraintHistory {
    /// Exponential decay time of the time average in ps.
    pub tau: f64,
    pub time_averages: Vec<f64>,
    pub instantaneous: Vec<f64>,
}

impl RestraintHistory {
    pub fn is_empty(&self) -> bool {
        self.time_averages.is_empty()
    }
}

/// All accumulator state owned by the run lifecycle and handed by reference to the
/// long-running algorithm.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservablesHistory {
    pub energy: EnergyHistory,
    pub distance_restraints: RestraintHistory,
    pub orientation_restraints: RestraintHistory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_and_fluctuations_follow_samples() {
        let mut history = EnergyHistory::with_terms(&["potential", "kinetic"]);
        assert_eq!(history.average(0), None);
        history.accumulate(&[1.0, 10.0]);
        history.accumulate(&[3.0, 10.0]);
        assert_eq!(history.average(0), Some(2.0));
        assert_eq!(history.fluctuation(0), Some(1.0));
        assert_eq!(history.fluctuation(1), Some(0.0));
    }
}
