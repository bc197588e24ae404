//! Admission control.
//!
//! The governor is the only state shared across submissions. A single mutex
//! guards the admitted count, the admitted memory and the set of outstanding
//! tokens, so the capacity check and the reservation happen atomically.
//! The lock is never held across an `.await`.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error};

use crate::error::{AdmissionError, ConsistencyFault};
use crate::metrics::MetricsCollector;

/// Proof of admission. Holds `memory_mb` of reserved capacity until released.
///
/// Deliberately not `Clone`: one admission, one token.
#[derive(Debug, PartialEq, Eq)]
pub struct AdmissionToken {
    id: u64,
    memory_mb: u64,
}

impl AdmissionToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }
}

/// Ceilings the governor enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorLimits {
    pub max_concurrent: usize,
    pub aggregate_memory_mb: u64,
}

/// Point-in-time view of governor accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GovernorSnapshot {
    pub admitted: usize,
    pub memory_mb: u64,
    pub max_concurrent: usize,
    pub aggregate_memory_mb: u64,
}

#[derive(Debug, Default)]
struct Accounting {
    admitted: usize,
    memory_mb: u64,
    outstanding: HashSet<u64>,
    next_id: u64,
}

/// Capacity-gated admission for submissions.
#[derive(Debug)]
pub struct ResourceGovernor {
    limits: GovernorLimits,
    state: Mutex<Accounting>,
    metrics: MetricsCollector,
}

impl ResourceGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(Accounting::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn limits(&self) -> GovernorLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, Accounting> {
        // Every critical section leaves accounting consistent, so a poisoned
        // lock still holds valid data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves a slot and `memory_mb` of aggregate memory.
    ///
    /// Never waits: when either ceiling would be exceeded the call returns
    /// `CapacityExceeded` immediately and nothing is reserved.
    pub fn try_admit(&self, memory_mb: u64) -> Result<AdmissionToken, AdmissionError> {
        let mut state = self.lock();

        let available_mb = self.limits.aggregate_memory_mb.saturating_sub(state.memory_mb);
        if state.admitted >= self.limits.max_concurrent || memory_mb > available_mb {
            return Err(AdmissionError::CapacityExceeded {
                admitted: state.admitted,
                max_concurrent: self.limits.max_concurrent,
                requested_mb: memory_mb,
                available_mb,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.admitted += 1;
        state.memory_mb += memory_mb;
        state.outstanding.insert(id);

        let (admitted, total_mb) = (state.admitted, state.memory_mb);
        drop(state);

        self.metrics.update_admitted(admitted, total_mb);
        debug!(token = id, memory_mb, admitted, "Admitted submission");

        Ok(AdmissionToken { id, memory_mb })
    }

    /// Returns the token's reservation.
    ///
    /// A token can be released once. A second release, or a token this
    /// governor never issued, is reported as a [`ConsistencyFault`] and leaves
    /// the accounting untouched.
    pub fn release(&self, token: &AdmissionToken) -> Result<(), ConsistencyFault> {
        let mut state = self.lock();

        if !state.outstanding.remove(&token.id) {
            // Ids are issued sequentially, so an id at or below the last one
            // issued that is no longer outstanding was already released.
            let fault = if token.id != 0 && token.id <= state.next_id {
                ConsistencyFault::DoubleRelease { token: token.id }
            } else {
                ConsistencyFault::UnknownToken { token: token.id }
            };
            drop(state);

            error!(token = token.id, fault = %fault, "Admission accounting fault");
            self.metrics.record_consistency_fault(match fault {
                ConsistencyFault::DoubleRelease { .. } => "double_release",
                _ => "unknown_token",
            });
            return Err(fault);
        }

        state.admitted -= 1;
        state.memory_mb -= token.memory_mb;

        let (admitted, total_mb) = (state.admitted, state.memory_mb);
        drop(state);

        self.metrics.update_admitted(admitted, total_mb);
        debug!(token = token.id, admitted, "Released admission");

        Ok(())
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.lock();
        GovernorSnapshot {
            admitted: state.admitted,
            memory_mb: state.memory_mb,
            max_concurrent: self.limits.max_concurrent,
            aggregate_memory_mb: self.limits.aggregate_memory_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(max_concurrent: usize, aggregate_memory_mb: u64) -> ResourceGovernor {
        ResourceGovernor::new(GovernorLimits {
            max_concurrent,
            aggregate_memory_mb,
        })
    }

    #[test]
    fn test_admit_and_release() {
        let gov = governor(2, 512);
        let token = gov.try_admit(128).unwrap();
        assert_eq!(gov.snapshot().admitted, 1);
        assert_eq!(gov.snapshot().memory_mb, 128);

        gov.release(&token).unwrap();
        assert_eq!(gov.snapshot().admitted, 0);
        assert_eq!(gov.snapshot().memory_mb, 0);
    }

    #[test]
    fn test_concurrency_ceiling() {
        let gov = governor(2, 4096);
        let _a = gov.try_admit(10).unwrap();
        let _b = gov.try_admit(10).unwrap();

        let err = gov.try_admit(10).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::CapacityExceeded {
                admitted: 2,
                max_concurrent: 2,
                ..
            }
        ));
        assert_eq!(gov.snapshot().admitted, 2);
    }

    #[test]
    fn test_memory_ceiling_is_inclusive() {
        let gov = governor(8, 256);
        let _a = gov.try_admit(128).unwrap();
        let _b = gov.try_admit(128).unwrap();

        let err = gov.try_admit(1).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::CapacityExceeded {
                available_mb: 0,
                ..
            }
        ));
        assert_eq!(gov.snapshot().memory_mb, 256);
    }

    #[test]
    fn test_rejection_consumes_nothing() {
        let gov = governor(1, 100);
        assert!(gov.try_admit(200).is_err());
        assert_eq!(
            gov.snapshot(),
            GovernorSnapshot {
                admitted: 0,
                memory_mb: 0,
                max_concurrent: 1,
                aggregate_memory_mb: 100,
            }
        );
    }

    #[test]
    fn test_double_release_detected() {
        let gov = governor(2, 512);
        let token = gov.try_admit(64).unwrap();
        let _other = gov.try_admit(64).unwrap();

        gov.release(&token).unwrap();
        let err = gov.release(&token).unwrap_err();
        assert_eq!(err, ConsistencyFault::DoubleRelease { token: token.id() });

        // Accounting untouched by the faulty release.
        assert_eq!(gov.snapshot().admitted, 1);
        assert_eq!(gov.snapshot().memory_mb, 64);
    }

    #[test]
    fn test_unknown_token_detected() {
        let gov = governor(2, 512);
        let _held = gov.try_admit(64).unwrap();

        let never_issued = AdmissionToken {
            id: 100,
            memory_mb: 64,
        };
        let err = gov.release(&never_issued).unwrap_err();
        assert_eq!(err, ConsistencyFault::UnknownToken { token: 100 });
        assert_eq!(gov.snapshot().admitted, 1);
        assert_eq!(gov.snapshot().memory_mb, 64);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_ceiling() {
        let gov = Arc::new(governor(4, 100_000));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let gov = Arc::clone(&gov);
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..50 {
                        if let Ok(token) = gov.try_admit(1) {
                            assert!(gov.snapshot().admitted <= 4);
                            held.push(token);
                        }
                        if held.len() > 1 {
                            let token = held.remove(0);
                            gov.release(&token).unwrap();
                        }
                    }
                    for token in held {
                        gov.release(&token).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(gov.snapshot().admitted, 0);
        assert_eq!(gov.snapshot().memory_mb, 0);
    }
}
