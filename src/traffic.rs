use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate byte counters for one front-end.
///
/// `upload` counts client -> destination bytes, `download` counts
/// destination -> client bytes.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrafficCounters {
    pub fn add_upload(&self, n: u64) { self.upload.fetch_add(n, Ordering::Relaxed); }
    pub fn add_download(&self, n: u64) { self.download.fetch_add(n, Ordering::Relaxed); }
    pub fn upload(&self) -> u64 { self.upload.load(Ordering::Relaxed) }
    pub fn download(&self) -> u64 { self.download.load(Ordering::Relaxed) }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            upload: self.upload(),
            download: self.download(),
        }
    }

    pub fn reset(&self) {
        self.upload.store(0, Ordering::Relaxed);
        self.download.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub upload: u64,
    pub download: u64,
}

impl TrafficSnapshot {
    /// Bytes moved since `earlier`, per direction.
    pub fn since(&self, earlier: &TrafficSnapshot) -> TrafficSnapshot {
        TrafficSnapshot {
            upload: self.upload.saturating_sub(earlier.upload),
            download: self.download.saturating_sub(earlier.download),
        }
    }
}

/// Render a byte count with a binary unit suffix, e.g. `1.50 KiB`.
pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let counters = TrafficCounters::default();
        counters.add_upload(10);
        counters.add_upload(5);
        counters.add_download(7);
        assert_eq!(counters.snapshot(), TrafficSnapshot { upload: 15, download: 7 });

        counters.reset();
        assert_eq!(counters.snapshot(), TrafficSnapshot::default());
    }

    #[test]
    fn snapshot_delta() {
        let before = TrafficSnapshot { upload: 100, download: 50 };
        let after = TrafficSnapshot { upload: 150, download: 50 };
        assert_eq!(after.since(&before), TrafficSnapshot { upload: 50, download: 0 });
    }

    #[test]
    fn human_readable_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.50 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MiB");
    }
}
