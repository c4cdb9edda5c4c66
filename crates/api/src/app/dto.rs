use serde::Deserialize;

use tenantflow_infra::jobs::JobSource;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EnqueueJobRequest {
    #[serde(default)]
    pub source: JobSource,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunBatchRequest {
    pub max_jobs: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    pub tenant_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OperatorRunRequest {
    pub max_signals: Option<usize>,
    pub max_actions: Option<usize>,
}

/// Upper bound for caller-supplied limits.
pub const MAX_LIMIT: usize = 500;

pub fn clamp_limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(None, 50), 50);
        assert_eq!(clamp_limit(Some(0), 50), 1);
        assert_eq!(clamp_limit(Some(10_000), 50), MAX_LIMIT);
    }

    #[test]
    fn enqueue_body_defaults_to_manual() {
        let body: EnqueueJobRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(body.source, JobSource::Manual);
        assert!(body.metadata.is_null());
    }
}
