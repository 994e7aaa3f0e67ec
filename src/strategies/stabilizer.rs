use crate::types::{RegimeId, RegimeLabel, SmoothedRegime};

/// Hysteresis filter on raw regime labels.
///
/// A new regime replaces the current one only after `k` consecutive raw
/// observations of it. Seeing the current regime again clears the challenger.
#[derive(Debug, Clone)]
pub struct RegimeStabilizer {
    k: usize,
    current: Option<RegimeId>,
    persistence: usize,
    candidate: Option<(RegimeId, usize)>,
    confidence: f64,
}

impl RegimeStabilizer {
    pub fn new(hysteresis_k: usize) -> Self {
        Self {
            k: hysteresis_k.max(1),
            current: None,
            persistence: 0,
            candidate: None,
            confidence: 0.0,
        }
    }

    pub fn current(&self) -> Option<SmoothedRegime> {
        self.current.map(|regime| SmoothedRegime {
            regime,
            persistence: self.persistence,
            confidence: self.confidence,
            pending: self.candidate,
        })
    }

    /// Feed one raw label; returns the smoothed regime after it
    pub fn step(&mut self, raw: Option<&RegimeLabel>) -> Option<SmoothedRegime> {
        let label = match raw {
            Some(label) => label,
            None => return self.current(),
        };
        let observed = label.regime;

        match self.current {
            None => self.switch_to(observed),
            Some(current) if current == observed => {
                self.candidate = None;
                self.persistence += 1;
            }
            Some(_) => {
                let count = match self.candidate {
                    Some((candidate, count)) if candidate == observed => count + 1,
                    _ => 1,
                };
                if count >= self.k {
                    self.switch_to(observed);
                } else {
                    self.candidate = Some((observed, count));
                    self.persistence += 1;
                }
            }
        }

        self.confidence = label
            .probabilities
            .get(self.current.unwrap_or(observed))
            .copied()
            .unwrap_or(0.0);
        self.current()
    }

    fn switch_to(&mut self, regime: RegimeId) {
        self.current = Some(regime);
        self.persistence = 1;
        self.candidate = None;
    }
}
