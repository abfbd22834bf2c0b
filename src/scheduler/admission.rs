//! Admission control against a shared, license-limited resource.
//!
//! The tool's licenses are shared with jobs this driver does not track, so
//! the in-flight count comes from the cluster backend rather than from the
//! queue.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::BackendError;
use crate::runner::backend::ClusterBackend;

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Open { in_flight: usize, capacity: usize },
    Blocked { in_flight: usize, capacity: usize },
    /// The backend could not be queried; treated as blocked.
    Unknown { reason: String },
}

impl Admission {
    pub fn is_open(&self) -> bool {
        matches!(self, Admission::Open { .. })
    }
}

/// Gates driver cycles on the number of in-flight jobs.
pub struct AdmissionController {
    backend: Arc<dyn ClusterBackend>,
    job_name: String,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(backend: Arc<dyn ClusterBackend>, job_name: impl Into<String>, capacity: usize) -> Self {
        Self {
            backend,
            job_name: job_name.into(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs of this workload currently known to the backend.
    pub async fn current_in_flight(&self) -> Result<usize, BackendError> {
        self.backend.in_flight(&self.job_name).await
    }

    /// Checks whether another job may start.
    pub async fn check(&self) -> Admission {
        match self.current_in_flight().await {
            Ok(in_flight) if in_flight >= self.capacity => Admission::Blocked {
                in_flight,
                capacity: self.capacity,
            },
            Ok(in_flight) => {
                debug!(in_flight, capacity = self.capacity, "Admission open");
                Admission::Open {
                    in_flight,
                    capacity: self.capacity,
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not query in-flight jobs; holding admission");
                Admission::Unknown {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::backend::Reservation;
    use async_trait::async_trait;

    struct FixedBackend(Option<usize>);

    #[async_trait]
    impl ClusterBackend for FixedBackend {
        async fn in_flight(&self, _job_name: &str) -> Result<usize, BackendError> {
            self.0.ok_or_else(|| BackendError::QueryFailed {
                program: "squeue".to_string(),
                code: 1,
                stderr: "slurm_load_jobs error".to_string(),
            })
        }

        fn launch_command(&self, _reservation: &Reservation, command: Vec<String>) -> Vec<String> {
            command
        }
    }

    fn controller(in_flight: Option<usize>, capacity: usize) -> AdmissionController {
        AdmissionController::new(Arc::new(FixedBackend(in_flight)), "stilq", capacity)
    }

    #[tokio::test]
    async fn test_open_below_capacity() {
        assert!(controller(Some(1), 2).check().await.is_open());
        assert!(controller(Some(0), 1).check().await.is_open());
    }

    #[tokio::test]
    async fn test_blocked_at_capacity() {
        assert_eq!(
            controller(Some(1), 1).check().await,
            Admission::Blocked {
                in_flight: 1,
                capacity: 1
            }
        );
        assert!(!controller(Some(5), 2).check().await.is_open());
    }

    #[tokio::test]
    async fn test_query_failure_blocks() {
        let admission = controller(None, 4).check().await;
        assert!(matches!(admission, Admission::Unknown { .. }));
        assert!(!admission.is_open());
    }
}
