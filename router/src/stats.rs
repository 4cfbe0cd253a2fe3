use crate::link::LinkTable;
use crate::qmgr::QueueManager;

/// How often counters are recorded, in microseconds of uptime.
const STATS_INTERVAL: u64 = 300_000;

/// Periodically emits traffic counters as structured events on the `stats`
/// target, and a totals summary at shutdown.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    last: u64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample if the last one is at least 300 ms old.
    pub fn tick(&mut self, uptime: u64, lt: &LinkTable, qm: &QueueManager) {
        if uptime - self.last < STATS_INTERVAL {
            return;
        }
        self.last = uptime;

        let totals = lt.totals();
        tracing::info!(
            target: "stats",
            uptime,
            pkts_in = totals.in_pkts,
            pkts_out = totals.out_pkts,
            bytes_in = totals.in_bytes,
            bytes_out = totals.out_bytes,
            queued = qm.total_pkts(),
        );

        for (lnk, entry) in lt.iter() {
            if entry.in_pkts() == 0 && entry.out_pkts() == 0 {
                continue;
            }
            tracing::debug!(
                target: "stats",
                link = lnk,
                pkts_in = entry.in_pkts(),
                pkts_out = entry.out_pkts(),
                bytes_in = entry.in_bytes(),
                bytes_out = entry.out_bytes(),
                queued = qm.qlen_pkts(lnk),
            );
        }
    }

    /// Logs the end-of-run traffic totals.
    pub fn summary(&self, lt: &LinkTable) {
        let totals = lt.totals();

        tracing::info!(
            "{} packets received, {} packets sent",
            totals.in_pkts,
            totals.out_pkts
        );
        tracing::info!(
            "{} from routers, {} to routers",
            totals.router_in_pkts,
            totals.router_out_pkts
        );
        tracing::info!(
            "{} from clients, {} to clients",
            totals.client_in_pkts,
            totals.client_out_pkts
        );
    }
}
