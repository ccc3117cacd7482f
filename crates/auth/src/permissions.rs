use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// A single permission a request requires: an action on a resource.
///
/// Actions are opaque strings such as `"fs:ReadObject"`; resources are ARNs
/// or hierarchical paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub action: Cow<'static, str>,
    pub resource: String,
}

impl Permission {
    pub fn new(action: impl Into<Cow<'static, str>>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} on {}", self.action, self.resource)
    }
}

/// Required permissions as a boolean expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Permission(Permission),
    /// Satisfied when any child is allowed and none is denied.
    Or(Vec<Node>),
    /// Satisfied when every child is allowed.
    And(Vec<Node>),
}

impl Node {
    pub fn permission(action: impl Into<Cow<'static, str>>, resource: impl Into<String>) -> Self {
        Node::Permission(Permission::new(action, resource))
    }
}

impl From<Permission> for Node {
    fn from(value: Permission) -> Self {
        Node::Permission(value)
    }
}
