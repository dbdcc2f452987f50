use tracing::warn;

/// Relative spread of the devices' own estimates that indicates unbalanced discharge.
pub const DIVERGENCE_RATIO: f64 = 0.2;

/// Seconds until the bank is empty at the present net draw, or `None` unless discharging.
pub fn time_to_go(total_current: f64, soc_percent: f64, total_capacity_ah: f64) -> Option<f64> {
    if total_current >= 0.0 {
        return None;
    }
    let remaining_ah = total_capacity_ah * soc_percent / 100.0;
    Some(-3600.0 * remaining_ah / total_current)
}

/// Computes the bank-wide remaining time and reports, once per process, when the
/// devices' own estimates disagree by more than [`DIVERGENCE_RATIO`].
#[derive(Debug, Default)]
pub struct RemainingTimeEstimator {
    divergence_reported: bool,
}

impl RemainingTimeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estimate(
        &mut self,
        total_current: f64,
        soc_percent: f64,
        total_capacity_ah: f64,
        peer_estimates: &[f64],
    ) -> Option<f64> {
        let estimate = time_to_go(total_current, soc_percent, total_capacity_ah)?;
        if !self.divergence_reported {
            if let Some((min, max)) = divergence(peer_estimates) {
                warn!(
                    "Device time-to-go estimates diverge: min={:.1}h, max={:.1}h, aggregate={:.1}h",
                    min / 3600.0,
                    max / 3600.0,
                    estimate / 3600.0
                );
                warn!("Parallel batteries are discharging at different rates; check for impedance mismatch or uneven battery health");
                self.divergence_reported = true;
            }
        }
        Some(estimate)
    }

    pub fn divergence_reported(&self) -> bool {
        self.divergence_reported
    }
}

fn divergence(peer_estimates: &[f64]) -> Option<(f64, f64)> {
    let mut peers = peer_estimates.iter().copied().filter(|ttg| *ttg > 0.0);
    let first = peers.next()?;
    let (min, max) = peers.fold((first, first), |(lo, hi), ttg| (lo.min(ttg), hi.max(ttg)));
    ((max - min) / max > DIVERGENCE_RATIO).then_some((min, max))
}
