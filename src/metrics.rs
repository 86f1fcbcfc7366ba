//! Periodic host resource sampling.
//!
//! The sampler asks a [`MetricsSource`] for CPU and memory readings on a
//! fixed cadence and logs them. Sources are blocking, so each query runs on
//! the blocking pool. The loop has no stop signal; it lives until its task
//! is aborted or the runtime shuts down.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Metrics errors
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("sampling task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A point-in-time source of CPU and memory readings.
pub trait MetricsSource: Send + Sync + 'static {
    /// Returns `(cpu, memory)` as display text.
    fn sample(&self) -> Result<(String, String), MetricsError>;
}

/// One reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub taken_at: DateTime<Utc>,
    pub cpu: String,
    pub memory: String,
}

/// Reads `/proc/loadavg` and `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
}

impl ProcfsSource {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternate procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, name: &str) -> Result<String, MetricsError> {
        let path = self.root.join(name);
        std::fs::read_to_string(&path).map_err(|source| MetricsError::Read {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for ProcfsSource {
    fn sample(&self) -> Result<(String, String), MetricsError> {
        let cpu = parse_loadavg(&self.read("loadavg")?)?;
        let memory = parse_meminfo(&self.read("meminfo")?)?;
        Ok((cpu, memory))
    }
}

/// `0.52 0.58 0.59 1/467 12345` -> `load average: 0.52, 0.58, 0.59`
fn parse_loadavg(contents: &str) -> Result<String, MetricsError> {
    let loads: Vec<&str> = contents.split_whitespace().take(3).collect();
    if loads.len() < 3 {
        return Err(MetricsError::Malformed("loadavg"));
    }
    Ok(format!("load average: {}", loads.join(", ")))
}

/// Summarize total, available and used memory in MiB.
fn parse_meminfo(contents: &str) -> Result<String, MetricsError> {
    let field = |name: &str| -> Option<u64> {
        contents
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse().ok())
    };

    let total = field("MemTotal").ok_or(MetricsError::Malformed("meminfo"))?;
    let available = field("MemAvailable")
        .or_else(|| field("MemFree"))
        .ok_or(MetricsError::Malformed("meminfo"))?;

    Ok(format!(
        "total: {} MiB, used: {} MiB, available: {} MiB",
        total / 1024,
        total.saturating_sub(available) / 1024,
        available / 1024
    ))
}

/// Periodic sampler.
pub struct MetricsSampler {
    source: Arc<dyn MetricsSource>,
    interval: Duration,
}

impl MetricsSampler {
    pub fn new(source: Arc<dyn MetricsSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Take one sample on the blocking pool.
    pub async fn sample_once(&self) -> Result<MetricSample, MetricsError> {
        let source = Arc::clone(&self.source);
        let (cpu, memory) = tokio::task::spawn_blocking(move || source.sample()).await??;
        Ok(MetricSample {
            taken_at: Utc::now(),
            cpu,
            memory,
        })
    }

    /// Sample forever. Failed samples are logged and skipped.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.sample_once().await {
                Ok(sample) => info!(
                    at = %sample.taken_at.format("%H:%M:%S"),
                    cpu = %sample.cpu,
                    memory = %sample.memory,
                    "Resource usage"
                ),
                Err(e) => warn!(error = %e, "Failed to sample resources"),
            }
        }
    }

    /// Run on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every other call.
    #[derive(Default)]
    struct FlakySource {
        calls: AtomicUsize,
    }

    impl MetricsSource for FlakySource {
        fn sample(&self) -> Result<(String, String), MetricsError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 0 {
                Err(MetricsError::Malformed("test"))
            } else {
                Ok((format!("cpu {call}"), format!("mem {call}")))
            }
        }
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/467 12345\n").unwrap(),
            "load average: 0.52, 0.58, 0.59"
        );
        assert!(parse_loadavg("0.52").is_err());
    }

    #[test]
    fn test_parse_meminfo() {
        let contents = "MemTotal:       16384000 kB\n\
                        MemFree:         1024000 kB\n\
                        MemAvailable:    8192000 kB\n";
        assert_eq!(
            parse_meminfo(contents).unwrap(),
            "total: 16000 MiB, used: 8000 MiB, available: 8000 MiB"
        );

        let no_available = "MemTotal: 2048 kB\nMemFree: 1024 kB\n";
        assert_eq!(
            parse_meminfo(no_available).unwrap(),
            "total: 2 MiB, used: 1 MiB, available: 1 MiB"
        );

        assert!(parse_meminfo("Buffers: 12 kB\n").is_err());
    }

    #[test]
    fn test_missing_procfs_is_an_error() {
        let source = ProcfsSource::with_root("/nonexistent/procfs");
        assert!(matches!(source.sample(), Err(MetricsError::Read { .. })));
    }

    #[tokio::test]
    async fn test_sample_once_uses_source() {
        let source = Arc::new(FlakySource::default());
        let sampler = MetricsSampler::new(source.clone(), Duration::from_secs(5));

        assert!(sampler.sample_once().await.is_err());
        let sample = sampler.sample_once().await.unwrap();
        assert_eq!(sample.cpu, "cpu 1");
        assert_eq!(sample.memory, "mem 1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failures() {
        let source = Arc::new(FlakySource::default());
        let sampler = MetricsSampler::new(source.clone(), Duration::from_secs(5));

        let task = sampler.spawn();
        for _ in 0..100 {
            if source.calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        task.abort();

        // The first call fails; later ticks still sample.
        assert!(source.calls.load(Ordering::SeqCst) >= 3);
    }
}
