use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Accumulates the time spent on completed work items. Safe to share between worker threads.
#[derive(Debug, Default)]
pub struct WorkTimer {
    total_us: AtomicU64,
    items_completed: AtomicU64,
}

impl WorkTimer {
    pub fn complete_item(&self, d: Duration) {
        let us: u64 = d.as_micros().try_into().unwrap_or(u64::MAX);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.items_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn items_completed(&self) -> u64 {
        self.items_completed.load(Ordering::Relaxed)
    }

    pub fn total_time(&self) -> Duration {
        Duration::from_micros(self.total_us.load(Ordering::Relaxed))
    }

    pub fn average_time_us(&self) -> u64 {
        self.total_us.load(Ordering::Relaxed) / self.items_completed().max(1)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
