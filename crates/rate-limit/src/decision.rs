use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The fixed-window counter is above the effective limit.
    QuotaExhausted,
    /// The token bucket holds less than one token.
    BucketEmpty,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::QuotaExhausted => "quota_exhausted",
            RejectReason::BucketEmpty => "bucket_empty",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// What let a request skip admission entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassKind {
    Secret,
    TrustedNetwork,
    TrustedAgent,
}

impl fmt::Display for BypassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BypassKind::Secret => "secret",
            BypassKind::TrustedNetwork => "trusted_network",
            BypassKind::TrustedAgent => "trusted_agent",
        })
    }
}

/// The engine's verdict on one request.
///
/// This is caller-facing: it carries the effective limit but never the
/// penalty level that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub admitted: bool,
    pub profile: String,
    pub limit: u64,
    pub current: u64,
    pub remaining: u64,
    pub reset_after_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass: Option<BypassKind>,
}

impl Decision {
    pub fn bypassed(profile: &str, kind: BypassKind) -> Self {
        Self {
            admitted: true,
            profile: profile.to_string(),
            limit: 0,
            current: 0,
            remaining: 0,
            reset_after_secs: 0,
            retry_after_secs: None,
            reason: None,
            bypass: Some(kind),
        }
    }

    /// HTTP status a front end should answer with.
    pub fn status_code(&self) -> u16 {
        if self.admitted {
            200
        } else {
            429
        }
    }

    /// Standard rate-limit response headers. Bypassed requests get none.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.bypass.is_some() {
            return Vec::new();
        }
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_after_secs.to_string()),
        ];
        if let Some(retry) = self.retry_after_secs {
            headers.push(("Retry-After", retry.to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected() -> Decision {
        Decision {
            admitted: false,
            profile: "login".into(),
            limit: 5,
            current: 6,
            remaining: 0,
            reset_after_secs: 42,
            retry_after_secs: Some(44),
            reason: Some(RejectReason::QuotaExhausted),
            bypass: None,
        }
    }

    #[test]
    fn rejection_headers() {
        let headers = rejected().headers();
        assert_eq!(
            headers,
            vec![
                ("X-RateLimit-Limit", "5".to_string()),
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Reset", "42".to_string()),
                ("Retry-After", "44".to_string()),
            ]
        );
        assert_eq!(rejected().status_code(), 429);
    }

    #[test]
    fn bypass_has_no_headers() {
        let decision = Decision::bypassed("default", BypassKind::TrustedNetwork);
        assert!(decision.admitted);
        assert!(decision.headers().is_empty());
    }

    #[test]
    fn serializes_reason_code() {
        let json = serde_json::to_value(rejected()).unwrap();
        assert_eq!(json["reason"], "quota_exhausted");
        assert!(json.get("bypass").is_none());
        assert!(json.get("penalty_level").is_none());
    }
}
