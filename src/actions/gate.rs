//! Submission gate
//!
//! Mutating calls for one (provider, account) pass through a single gate:
//! at most `max_in_flight` calls at a time, and consecutive submissions at
//! least `min_interval` apart. Gates are shared by every policy and region
//! of a run.

use crate::error::ProviderError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;

/// Gate settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    pub max_in_flight: usize,
    #[serde(with = "millis")]
    pub min_interval: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            min_interval: Duration::from_millis(100),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Bounded in-flight calls plus a minimum spacing between submissions
#[derive(Debug)]
pub struct SubmissionGate {
    permits: Semaphore,
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl SubmissionGate {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            permits: Semaphore::new(limit.max_in_flight.max(1)),
            min_interval: limit.min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for a free slot. The permit is released when dropped.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, ProviderError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Permanent("submission gate closed".to_string()))?;

        if !self.min_interval.is_zero() {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let at = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(at + self.min_interval);
            drop(next);
            tokio::time::sleep_until(at).await;
        }
        Ok(permit)
    }
}

/// Gates by (provider, account)
#[derive(Debug, Default)]
pub struct GateRegistry {
    limit: RateLimit,
    gates: DashMap<(String, String), Arc<SubmissionGate>>,
}

impl GateRegistry {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            gates: DashMap::new(),
        }
    }

    pub fn gate(&self, provider: &str, account: &str) -> Arc<SubmissionGate> {
        self.gates
            .entry((provider.to_string(), account.to_string()))
            .or_insert_with(|| Arc::new(SubmissionGate::new(self.limit)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_spaces_submissions() {
        let gate = SubmissionGate::new(RateLimit {
            max_in_flight: 10,
            min_interval: Duration::from_millis(100),
        });
        let start = Instant::now();
        for _ in 0..3 {
            drop(gate.acquire().await.unwrap());
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_in_flight_is_bounded() {
        let gate = Arc::new(SubmissionGate::new(RateLimit {
            max_in_flight: 2,
            min_interval: Duration::ZERO,
        }));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let (gate, current, peak) = (gate.clone(), current.clone(), peak.clone());
                tokio::spawn(async move {
                    let _permit = gate.acquire().await.unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_gates_are_per_account() {
        let registry = GateRegistry::new(RateLimit::default());
        let a = registry.gate("aws", "1");
        assert!(Arc::ptr_eq(&a, &registry.gate("aws", "1")));
        assert!(!Arc::ptr_eq(&a, &registry.gate("aws", "2")));
    }
}
