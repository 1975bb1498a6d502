use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::{PercentRange, StatsRanges};
use crate::core::vm::{VirtualMachine, VmStats};

/// Synthetic telemetry source. Nothing here is measured, it only has to look
/// plausible: bounded percentages and counters that never go backwards.
#[derive(Debug, Clone)]
pub struct StatsSampler {
    ranges: StatsRanges,
}

impl StatsSampler {
    pub fn new(ranges: StatsRanges) -> Self {
        Self { ranges }
    }

    pub fn sample(&self, vm: &VirtualMachine, now: DateTime<Utc>) -> VmStats {
        let mut rng = rand::thread_rng();

        let rx_delta = rng.gen_range(1..=self.ranges.max_rx_delta_bytes.max(1));
        let tx_delta = rng.gen_range(1..=self.ranges.max_tx_delta_bytes.max(1));

        VmStats {
            cpu_usage_percent: percent(&mut rng, self.ranges.cpu_percent),
            ram_usage_percent: percent(&mut rng, self.ranges.ram_percent),
            disk_usage_percent: percent(&mut rng, self.ranges.disk_percent),
            network_rx_bytes: vm.stats.network_rx_bytes.saturating_add(rx_delta),
            network_tx_bytes: vm.stats.network_tx_bytes.saturating_add(tx_delta),
            uptime_seconds: vm.uptime_seconds(now),
            last_stats_update: Some(now),
        }
    }
}

impl Default for StatsSampler {
    fn default() -> Self {
        Self::new(StatsRanges::default())
    }
}

fn percent<R: Rng>(rng: &mut R, range: PercentRange) -> f64 {
    let min = range.min.clamp(0.0, 100.0);
    let max = range.max.clamp(0.0, 100.0);
    if min >= max {
        return min;
    }
    rng.gen_range(min..max)
}
