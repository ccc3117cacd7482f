//! Identifier and policy content validation.
//!
//! Everything here runs before a write reaches the store.

use once_cell::sync::Lazy;
use regex::Regex;

use latchkey_core::{AuthError, AuthResult};

use crate::model::{Policy, Statement};

static ENTITY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\w+=,.@\-]{1,127}$").expect("entity id pattern must compile")
});

// `service:Name`, a bare name, or a pattern over either using `*` and `?`.
static ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\*|[a-zA-Z0-9_*?]+(:[a-zA-Z0-9_*?]+)?)$").expect("action pattern must compile")
});

static ARN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^arn:[^:\s]*:[^:\s]*:[^:\s]*:[^:\s]*:\S+$")
        .expect("arn pattern must compile")
});

static RESOURCE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s:]+$").expect("resource pattern must compile"));

/// Validate a user, group or policy display name.
pub fn validate_entity_id(field: &'static str, value: &str) -> AuthResult<()> {
    if ENTITY_ID.is_match(value) {
        Ok(())
    } else {
        Err(AuthError::validation(
            field,
            value,
            "must be 1-127 characters of letters, digits or +=,.@_-",
        ))
    }
}

pub fn validate_action(action: &str) -> AuthResult<()> {
    if ACTION.is_match(action) {
        Ok(())
    } else {
        Err(AuthError::validation(
            "action",
            action,
            "expected '*', 'name' or 'service:Name'",
        ))
    }
}

/// A resource is `*`, an ARN, or a hierarchical path without whitespace.
pub fn validate_resource(resource: &str) -> AuthResult<()> {
    let ok = if resource.starts_with("arn:") {
        ARN.is_match(resource)
    } else {
        RESOURCE_PATH.is_match(resource)
    };
    if ok {
        Ok(())
    } else {
        Err(AuthError::validation(
            "resource",
            resource,
            "expected '*', an ARN or a path without whitespace",
        ))
    }
}

pub fn validate_statement(statement: &Statement) -> AuthResult<()> {
    if statement.actions.is_empty() {
        return Err(AuthError::validation(
            "action",
            "",
            "statement must name at least one action",
        ));
    }
    for action in &statement.actions {
        validate_action(action)?;
    }
    validate_resource(&statement.resource)
}

/// Validate a policy's name and every statement it carries.
///
/// The effect needs no check here: [`crate::Effect`] only has two values and
/// parsing rejects anything else.
pub fn validate_policy(policy: &Policy) -> AuthResult<()> {
    validate_entity_id("policy", &policy.display_name)?;
    policy.statements.iter().try_for_each(validate_statement)
}

/// Parse an effect name as written in stored policy documents.
pub fn parse_effect(value: &str) -> AuthResult<crate::Effect> {
    match value {
        v if v.eq_ignore_ascii_case("allow") => Ok(crate::Effect::Allow),
        v if v.eq_ignore_ascii_case("deny") => Ok(crate::Effect::Deny),
        other => Err(AuthError::validation(
            "effect",
            other,
            "expected 'allow' or 'deny'",
        )),
    }
}
