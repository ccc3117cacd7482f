//! Permission evaluation.
//!
//! Evaluation is pure: the caller resolves the effective policy set and hands
//! it in. An explicit deny anywhere in the set wins over every allow, and the
//! absence of a matching statement is a deny.

use serde::{Deserialize, Serialize};

use latchkey_core::AuthError;

use crate::matching::{action_match, interpolate_user, resource_match};
use crate::model::{Effect, Policy};
use crate::permissions::{Node, Permission};

/// Outcome of evaluating one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Allow,
    Deny,
    /// No statement spoke to the request.
    Neutral,
}

impl CheckResult {
    pub fn is_allowed(self) -> bool {
        self == CheckResult::Allow
    }
}

/// Input to an authorization decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub username: String,
    pub required_permissions: Node,
}

/// Result of an authorization decision.
///
/// A deny is a normal answer: `allowed` is false and `error` carries
/// [`AuthError::InsufficientPermissions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub allowed: bool,
    pub error: Option<AuthError>,
}

impl AuthorizationResponse {
    pub fn from_check(username: &str, result: CheckResult) -> Self {
        if result.is_allowed() {
            Self {
                allowed: true,
                error: None,
            }
        } else {
            Self {
                allowed: false,
                error: Some(AuthError::InsufficientPermissions {
                    username: username.to_string(),
                }),
            }
        }
    }
}

/// Evaluate a permission tree for `username` against its policies.
pub fn check_permissions(node: &Node, username: &str, policies: &[Policy]) -> CheckResult {
    match node {
        Node::Permission(perm) => check_permission(perm, username, policies),
        Node::Or(children) => {
            let mut allowed = false;
            for child in children {
                match check_permissions(child, username, policies) {
                    CheckResult::Deny => return CheckResult::Deny,
                    CheckResult::Allow => allowed = true,
                    CheckResult::Neutral => {}
                }
            }
            if allowed {
                CheckResult::Allow
            } else {
                CheckResult::Neutral
            }
        }
        Node::And(children) => {
            for child in children {
                let result = check_permissions(child, username, policies);
                if result != CheckResult::Allow {
                    return result;
                }
            }
            CheckResult::Allow
        }
    }
}

fn check_permission(perm: &Permission, username: &str, policies: &[Policy]) -> CheckResult {
    let mut allowed = false;
    for statement in policies.iter().flat_map(|p| p.statements.iter()) {
        let resource = interpolate_user(&statement.resource, username);
        if !resource_match(&resource, &perm.resource) {
            continue;
        }
        if !statement.actions.iter().any(|a| action_match(a, perm.action())) {
            continue;
        }
        match statement.effect {
            Effect::Deny => return CheckResult::Deny,
            Effect::Allow => allowed = true,
        }
    }
    if allowed {
        CheckResult::Allow
    } else {
        CheckResult::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Statement;

    fn policy(name: &str, statements: Vec<Statement>) -> Policy {
        Policy::new(name, statements)
    }

    #[test]
    fn deny_overrides_allow() {
        let policies = vec![
            policy("allow-read", vec![Statement::allow(["read"], "res/1")]),
            policy("deny-read", vec![Statement::deny(["read"], "res/1")]),
        ];
        let node = Node::permission("read", "res/1");
        assert_eq!(check_permissions(&node, "alice", &policies), CheckResult::Deny);
    }

    #[test]
    fn deny_applies_to_resources_containing_star() {
        let policies = vec![
            policy("everything", vec![Statement::allow(["fs:*"], "*")]),
            policy(
                "no-secrets",
                vec![Statement::deny(["fs:ReadObject"], "arn:lk:fs:::repository/secret/*")],
            ),
        ];
        let node = Node::permission("fs:ReadObject", "arn:lk:fs:::repository/secret/*/payroll.csv");
        assert_eq!(check_permissions(&node, "alice", &policies), CheckResult::Deny);
    }

    #[test]
    fn deny_wins_regardless_of_order() {
        let policies = vec![policy(
            "mixed",
            vec![
                Statement::deny(["fs:*"], "*"),
                Statement::allow(["fs:ReadObject"], "*"),
            ],
        )];
        let node = Node::permission("fs:ReadObject", "repo/a");
        assert_eq!(check_permissions(&node, "alice", &policies), CheckResult::Deny);
    }

    #[test]
    fn no_policies_is_neutral_and_not_allowed() {
        let node = Node::permission("read", "res/1");
        let result = check_permissions(&node, "alice", &[]);
        assert_eq!(result, CheckResult::Neutral);
        let response = AuthorizationResponse::from_check("alice", result);
        assert!(!response.allowed);
        assert_eq!(
            response.error,
            Some(AuthError::InsufficientPermissions {
                username: "alice".into()
            })
        );
    }

    #[test]
    fn non_matching_statements_are_ignored() {
        let policies = vec![policy(
            "other",
            vec![
                Statement::deny(["write"], "res/1"),
                Statement::allow(["read"], "res/*"),
            ],
        )];
        let node = Node::permission("read", "res/1");
        assert_eq!(check_permissions(&node, "alice", &policies), CheckResult::Allow);
    }

    #[test]
    fn user_placeholder_is_interpolated() {
        let policies = vec![policy(
            "self-service",
            vec![Statement::allow(["auth:*"], "arn:lk:auth:::user/${user}")],
        )];
        let own = Node::permission("auth:CreateCredentials", "arn:lk:auth:::user/alice");
        let other = Node::permission("auth:CreateCredentials", "arn:lk:auth:::user/bob");
        assert_eq!(check_permissions(&own, "alice", &policies), CheckResult::Allow);
        assert_eq!(check_permissions(&other, "alice", &policies), CheckResult::Neutral);
    }

    #[test]
    fn or_and_composition() {
        let policies = vec![policy(
            "p",
            vec![
                Statement::allow(["read"], "*"),
                Statement::deny(["delete"], "*"),
            ],
        )];
        let read = Node::permission("read", "x");
        let write = Node::permission("write", "x");
        let delete = Node::permission("delete", "x");

        let any = Node::Or(vec![write.clone(), read.clone()]);
        assert_eq!(check_permissions(&any, "u", &policies), CheckResult::Allow);

        let any_with_deny = Node::Or(vec![read.clone(), delete.clone()]);
        assert_eq!(check_permissions(&any_with_deny, "u", &policies), CheckResult::Deny);

        let all = Node::And(vec![read.clone(), write]);
        assert_eq!(check_permissions(&all, "u", &policies), CheckResult::Neutral);

        let all_with_deny = Node::And(vec![read, delete]);
        assert_eq!(check_permissions(&all_with_deny, "u", &policies), CheckResult::Deny);
    }

    #[test]
    fn empty_composites() {
        assert_eq!(check_permissions(&Node::And(vec![]), "u", &[]), CheckResult::Allow);
        assert_eq!(check_permissions(&Node::Or(vec![]), "u", &[]), CheckResult::Neutral);
    }
}
