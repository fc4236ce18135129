//! Request admission rules shared by every allocator.

use api_types::IsolationType;
use error_stack::report;

use super::error::{AllocationError, Result};
use super::types::{AllocationRequest, Share};

/// Operator-configured limits on what workloads may request.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPolicy {
    /// When false, requests asking for co-tenancy are refused.
    pub sharing_enabled: bool,
    pub min_fraction: f64,
    pub max_fraction: f64,
    pub allowed_isolation_types: Vec<IsolationType>,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            sharing_enabled: true,
            min_fraction: Share::MIN_FRACTION,
            max_fraction: Share::MAX_FRACTION,
            allowed_isolation_types: IsolationType::ALL.to_vec(),
        }
    }
}

impl AllocationPolicy {
    /// Validates the shape of a request, then the configured policy.
    ///
    /// Returns the requested share on success.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::Validation`] for empty identity fields or a
    ///   fraction outside `[0.1, 1.0]`
    /// - [`AllocationError::PolicyViolation`] when sharing is disabled, the
    ///   fraction is outside the configured bounds, or the isolation type is
    ///   not allowed
    pub fn admit(&self, request: &AllocationRequest) -> Result<Share> {
        validate_identity(request)?;
        let share = Share::from_fraction(request.fraction)?;

        if request.sharing_enabled && !self.sharing_enabled {
            return Err(report!(AllocationError::policy(
                "sharing was requested but is disabled on this node"
            )));
        }
        if request.fraction < self.min_fraction || request.fraction > self.max_fraction {
            return Err(report!(AllocationError::policy(format!(
                "fraction {} is outside the configured range [{}, {}]",
                request.fraction, self.min_fraction, self.max_fraction
            ))));
        }
        if !self.allowed_isolation_types.contains(&request.isolation_type) {
            return Err(report!(AllocationError::policy(format!(
                "isolation type `{}` is not allowed",
                request.isolation_type
            ))));
        }
        Ok(share)
    }
}

fn validate_identity(request: &AllocationRequest) -> Result<()> {
    let missing = [
        ("id", request.id.as_str()),
        ("pod_name", request.workload.pod_name.as_str()),
        ("namespace", request.workload.namespace.as_str()),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| name)
    .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(report!(AllocationError::validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        ))))
    }
}

#[cfg(test)]
mod tests {
    use api_types::{GpuRequest, WorkloadRef};

    use super::*;

    fn request(fraction: f64) -> AllocationRequest {
        AllocationRequest::new(
            "alloc-1",
            WorkloadRef::new("default", "trainer", "main"),
            &GpuRequest {
                fraction,
                memory_mib: 1024,
                sharing_enabled: true,
                isolation_type: IsolationType::Shared,
            },
        )
    }

    fn is_policy(err: &error_stack::Report<AllocationError>) -> bool {
        matches!(err.current_context(), AllocationError::PolicyViolation { .. })
    }

    #[test]
    fn default_policy_admits_valid_request() {
        let share = AllocationPolicy::default().admit(&request(0.25)).unwrap();
        assert_eq!(share.millis(), 250);
    }

    #[test]
    fn missing_identity_is_validation_error() {
        let mut req = request(0.5);
        req.id.clear();
        req.workload.namespace = "  ".to_string();
        let err = AllocationPolicy::default().admit(&req).unwrap_err();
        match err.current_context() {
            AllocationError::Validation { reason } => {
                assert!(reason.contains("id"));
                assert!(reason.contains("namespace"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn out_of_range_fraction_is_validation_not_policy() {
        let err = AllocationPolicy::default().admit(&request(0.01)).unwrap_err();
        assert!(matches!(
            err.current_context(),
            AllocationError::Validation { .. }
        ));
    }

    #[test]
    fn policy_violations() {
        let no_sharing = AllocationPolicy {
            sharing_enabled: false,
            ..Default::default()
        };
        assert!(is_policy(&no_sharing.admit(&request(0.5)).unwrap_err()));

        let bounded = AllocationPolicy {
            min_fraction: 0.25,
            max_fraction: 0.5,
            ..Default::default()
        };
        assert!(is_policy(&bounded.admit(&request(0.75)).unwrap_err()));
        assert!(bounded.admit(&request(0.5)).is_ok());

        let no_process = AllocationPolicy {
            allowed_isolation_types: vec![IsolationType::Shared],
            ..Default::default()
        };
        let mut req = request(0.5);
        req.isolation_type = IsolationType::Process;
        assert!(is_policy(&no_process.admit(&req).unwrap_err()));
    }
}
