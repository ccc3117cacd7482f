//! Wildcard and ARN matching for action and resource patterns.

/// Placeholder replaced by the requesting username before matching.
pub const USER_PLACEHOLDER: &str = "${user}";

/// Glob match where `*` matches any run of characters (including none) and
/// `?` matches exactly one.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();

    let (mut pi, mut vi) = (0usize, 0usize);
    // Position of the last `*` seen in the pattern and the value index it was
    // tried against.
    let mut star: Option<(usize, usize)> = None;

    while vi < v.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, vi));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if let Some((sp, sv)) = star {
            pi = sp + 1;
            vi = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Parsed `arn:partition:service:region:account:resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arn<'a> {
    pub partition: &'a str,
    pub service: &'a str,
    pub region: &'a str,
    pub account: &'a str,
    pub resource: &'a str,
}

impl<'a> Arn<'a> {
    /// Parse an ARN; the resource part may itself contain `:`.
    pub fn parse(value: &'a str) -> Option<Self> {
        let mut parts = value.splitn(6, ':');
        if parts.next()? != "arn" {
            return None;
        }
        Some(Self {
            partition: parts.next()?,
            service: parts.next()?,
            region: parts.next()?,
            account: parts.next()?,
            resource: parts.next()?,
        })
    }
}

/// Whether a resource pattern covers a requested resource.
///
/// `*` covers everything. ARN patterns are matched field by field against ARN
/// resources; an ARN pattern never covers a non-ARN resource and the other way
/// around. Anything else is matched as a whole-string glob.
pub fn resource_match(pattern: &str, resource: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (Arn::parse(pattern), Arn::parse(resource)) {
        (Some(p), Some(r)) => {
            wildcard_match(p.partition, r.partition)
                && wildcard_match(p.service, r.service)
                && wildcard_match(p.region, r.region)
                && wildcard_match(p.account, r.account)
                && wildcard_match(p.resource, r.resource)
        }
        (None, None) => wildcard_match(pattern, resource),
        _ => false,
    }
}

pub fn action_match(pattern: &str, action: &str) -> bool {
    wildcard_match(pattern, action)
}

/// Substitute the requesting username into a statement's resource pattern.
pub fn interpolate_user<'a>(pattern: &'a str, username: &str) -> std::borrow::Cow<'a, str> {
    if pattern.contains(USER_PLACEHOLDER) {
        std::borrow::Cow::Owned(pattern.replace(USER_PLACEHOLDER, username))
    } else {
        std::borrow::Cow::Borrowed(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn globs() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("fs:*", "fs:ReadObject"));
        assert!(wildcard_match("fs:Read*", "fs:ReadObject"));
        assert!(!wildcard_match("fs:Read*", "fs:WriteObject"));
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "ac"));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
        assert!(!wildcard_match("a*b*c", "axxbyy"));
        assert!(wildcard_match("res/1", "res/1"));
        assert!(!wildcard_match("res/1", "res/10"));
    }

    #[test]
    fn arn_fields_match_independently() {
        let pattern = "arn:lk:fs:::repository/main/*";
        assert!(resource_match(pattern, "arn:lk:fs:::repository/main/object.txt"));
        assert!(!resource_match(pattern, "arn:lk:fs:::repository/dev/object.txt"));
        assert!(!resource_match(pattern, "arn:lk:auth:::repository/main/object.txt"));
        assert!(resource_match("arn:lk:*:::*", "arn:lk:auth:::user/alice"));
    }

    #[test]
    fn pattern_star_backtracks_over_literal_star() {
        assert!(wildcard_match("*", "**"));
        assert!(wildcard_match("*", "* "));
        assert!(wildcard_match("secret/*", "secret/*/x"));
        assert!(wildcard_match("a*b", "a*xb"));
        assert!(resource_match(
            "arn:lk:fs:::repository/secret/*",
            "arn:lk:fs:::repository/secret/*/payroll.csv"
        ));
    }

    #[test]
    fn arn_and_plain_paths_never_mix() {
        assert!(!resource_match("arn:lk:fs:::*", "repository/main"));
        assert!(!resource_match("repository/*", "arn:lk:fs:::repository/main"));
        assert!(resource_match("*", "arn:lk:fs:::repository/main"));
        assert!(resource_match("*", "repository/main"));
    }

    #[test]
    fn resource_part_may_contain_colons() {
        let arn = Arn::parse("arn:lk:fs:::repo:branch/key").unwrap();
        assert_eq!(arn.resource, "repo:branch/key");
    }

    #[test]
    fn user_interpolation() {
        assert_eq!(
            interpolate_user("arn:lk:auth:::user/${user}", "alice"),
            "arn:lk:auth:::user/alice"
        );
        assert!(matches!(
            interpolate_user("res/1", "alice"),
            std::borrow::Cow::Borrowed(_)
        ));
    }

    proptest! {
        #[test]
        fn star_matches_anything(value in ".*") {
            prop_assert!(wildcard_match("*", &value));
        }

        #[test]
        fn literal_matches_itself(value in "[a-z/:]{0,20}") {
            prop_assert!(wildcard_match(&value, &value));
        }

        #[test]
        fn prefix_star_matches_extensions(prefix in "[a-z]{0,8}", rest in "[a-z]{0,8}") {
            let pattern = format!("{prefix}*");
            let value = format!("{prefix}{rest}");
            prop_assert!(wildcard_match(&pattern, &value));
        }
    }
}
