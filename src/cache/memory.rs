/// Process memory pressure probes for the resolution cache
///
/// The cache collapses TTLs to the floor when the host is close to running out of
/// memory. Linux hosts read `/proc/meminfo`; anywhere else the probe reports no pressure.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Source of the current memory usage ratio (0.0 – 1.0)
pub trait MemoryMonitor: Send + Sync + std::fmt::Debug {
    fn usage_ratio(&self) -> f64;
}

/// `/proc/meminfo` reader, sampled at most once per refresh interval
#[derive(Debug)]
pub struct SystemMemoryMonitor {
    refresh: Duration,
    sample: Mutex<Option<(Instant, f64)>>,
}

impl SystemMemoryMonitor {
    pub fn new(refresh: Duration) -> Self {
        Self {
            refresh,
            sample: Mutex::new(None),
        }
    }

    fn read_ratio() -> f64 {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(text) => parse_meminfo(&text).unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }
}

impl Default for SystemMemoryMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl MemoryMonitor for SystemMemoryMonitor {
    fn usage_ratio(&self) -> f64 {
        let mut sample = self.sample.lock();
        if let Some((taken, ratio)) = *sample {
            if taken.elapsed() < self.refresh {
                return ratio;
            }
        }
        let ratio = Self::read_ratio();
        *sample = Some((Instant::now(), ratio));
        ratio
    }
}

/// Used fraction from `MemTotal` / `MemAvailable`
fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<f64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total).clamp(0.0, 1.0))
}

/// Constant ratio, for tests and hosts where probing is undesirable
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryMonitor(pub f64);

impl MemoryMonitor for FixedMemoryMonitor {
    fn usage_ratio(&self) -> f64 {
        self.0
    }
}
