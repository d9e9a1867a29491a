use std::collections::BTreeSet;

use docvault_contracts::AccessPolicy;
use serde::Serialize;
use serde_json::{Map, Value};

/// Resources created before access policies existed carry no policy record.
/// They are readable by every principal, and that default is load-bearing for
/// existing content.
pub const DEFAULT_PUBLIC_WITHOUT_POLICY: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    Owner,
    Public,
    AllowListed,
    NoPolicy,
    NotAllowed,
    PolicyUnavailable,
}

impl AccessReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessReason::Owner => "owner",
            AccessReason::Public => "public",
            AccessReason::AllowListed => "allow_listed",
            AccessReason::NoPolicy => "no_policy",
            AccessReason::NotAllowed => "not_allowed",
            AccessReason::PolicyUnavailable => "policy_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allow: bool,
    pub reason: AccessReason,
}

impl AccessDecision {
    fn grant(reason: AccessReason) -> Self {
        Self {
            allow: true,
            reason,
        }
    }

    fn deny(reason: AccessReason) -> Self {
        Self {
            allow: false,
            reason,
        }
    }

    /// Decision used when the policy record could not be fetched. A lookup
    /// failure is not the same as a missing policy and never grants access.
    pub fn unavailable() -> Self {
        Self::deny(AccessReason::PolicyUnavailable)
    }
}

pub fn evaluate(principal_id: &str, policy: Option<&AccessPolicy>) -> AccessDecision {
    let Some(policy) = policy else {
        return if DEFAULT_PUBLIC_WITHOUT_POLICY {
            AccessDecision::grant(AccessReason::NoPolicy)
        } else {
            AccessDecision::deny(AccessReason::NoPolicy)
        };
    };

    let principal_id = principal_id.trim();
    if principal_id.is_empty() {
        return AccessDecision::deny(AccessReason::NotAllowed);
    }
    if policy.owner == principal_id {
        return AccessDecision::grant(AccessReason::Owner);
    }
    if policy.is_public {
        return AccessDecision::grant(AccessReason::Public);
    }
    if policy.allowed_principals.contains(principal_id) {
        return AccessDecision::grant(AccessReason::AllowListed);
    }
    AccessDecision::deny(AccessReason::NotAllowed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePolicyError {
    message: String,
}

impl ParsePolicyError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParsePolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParsePolicyError {}

/// Parses a policy record as served by the policy resource. `expected_resource_id`
/// guards against a resolver returning another resource's record.
pub fn parse_access_policy(
    value: &Value,
    expected_resource_id: &str,
) -> Result<AccessPolicy, ParsePolicyError> {
    let Some(obj) = value.as_object() else {
        return Err(ParsePolicyError::new("access policy must be an object"));
    };

    let resource_id = required_string(obj, "resource_id")?;
    if resource_id != expected_resource_id {
        return Err(ParsePolicyError::new(format!(
            "access policy is for `{}`, expected `{}`",
            resource_id, expected_resource_id
        )));
    }

    let owner = required_string(obj, "owner")?;

    let is_public = match obj.get("is_public") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(ParsePolicyError::new(
                "access policy `is_public` must be a boolean",
            ));
        }
    };

    let allowed_principals = parse_principals(obj, "allowed_principals")?;

    Ok(AccessPolicy {
        resource_id,
        owner,
        is_public,
        allowed_principals,
    })
}

fn required_string(obj: &Map<String, Value>, key: &str) -> Result<String, ParsePolicyError> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ParsePolicyError::new(format!(
                "access policy `{}` must be a non-empty string",
                key
            ))
        })
}

fn parse_principals(
    obj: &Map<String, Value>,
    key: &str,
) -> Result<BTreeSet<String>, ParsePolicyError> {
    let Some(value) = obj.get(key) else {
        return Ok(BTreeSet::new());
    };
    if value.is_null() {
        return Ok(BTreeSet::new());
    }

    let Some(arr) = value.as_array() else {
        return Err(ParsePolicyError::new(format!(
            "access policy `{}` must be an array",
            key
        )));
    };

    let mut out = BTreeSet::new();
    for raw in arr {
        let principal = raw
            .as_str()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ParsePolicyError::new(format!(
                    "access policy `{}` must be a string array",
                    key
                ))
            })?;
        out.insert(principal.to_string());
    }
    Ok(out)
}
