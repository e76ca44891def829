use regex::Regex;

/// Test a required ACL against the set of ACLs granted to a token.
///
/// Rules prefixed with `!` are denial rules and take precedence over
/// every grant. A `None` or empty requirement is always allowed.
#[must_use]
pub fn matches_required_acl(acls: &[String], auth_id: &str, required_acl: Option<&str>) -> bool {
    let required = match required_acl {
        None => return true,
        Some(required) if required.is_empty() => return true,
        Some(required) => required,
    };

    let (negative, positive): (Vec<&str>, Vec<&str>) = acls
        .iter()
        .map(String::as_str)
        .partition(|acl| acl.starts_with('!'));

    for acl in negative {
        if acl_to_regex(&acl[1..], auth_id).is_match(required) {
            return false;
        }
    }

    for acl in positive {
        if acl_to_regex(acl, auth_id).is_match(required) {
            return true;
        }
    }

    false
}

/// Compile a single ACL pattern into an anchored regex.
///
/// `*` matches within one dot-separated segment, `#` matches across
/// segments. A whole segment `me` also matches the token's `auth_id`;
/// `me` embedded inside a segment is left untouched.
fn acl_to_regex(acl: &str, auth_id: &str) -> Regex {
    let pattern = regex::escape(acl)
        .replace("\\*", "[^.]*?")
        .replace("\\#", ".*?");
    let pattern = substitute_me(&pattern, auth_id);

    Regex::new(&format!("^{pattern}$")).expect("a valid regex")
}

fn substitute_me(pattern: &str, auth_id: &str) -> String {
    let auth_id = regex::escape(auth_id);
    let mut pattern = pattern.replace("\\.me\\.", &format!("\\.(me|{auth_id})\\."));
    if pattern.ends_with("\\.me") {
        pattern = format!("{}\\.(me|{auth_id})", &pattern[..pattern.len() - 4]);
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acls(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn no_required_acl_is_allowed() {
        assert!(matches_required_acl(&[], "ABC", None));
        assert!(matches_required_acl(&[], "ABC", Some("")));
        assert!(!matches_required_acl(&[], "ABC", Some("confd.users.read")));
    }

    #[test]
    fn exact_match() {
        let granted = acls(&["confd.users.read"]);
        assert!(matches_required_acl(&granted, "ABC", Some("confd.users.read")));
        assert!(!matches_required_acl(&granted, "ABC", Some("confd.users.write")));
    }

    #[test]
    fn me_substitution() {
        let granted = acls(&["dird.me.contacts.read"]);
        assert!(matches_required_acl(&granted, "ABC", Some("dird.ABC.contacts.read")));
        assert!(matches_required_acl(&granted, "ABC", Some("dird.me.contacts.read")));
        assert!(!matches_required_acl(&granted, "ABC", Some("dird.XYZ.contacts.read")));
    }

    #[test]
    fn me_at_the_end() {
        let granted = acls(&["dird.contacts.me"]);
        assert!(matches_required_acl(&granted, "ABC", Some("dird.contacts.ABC")));
        assert!(matches_required_acl(&granted, "ABC", Some("dird.contacts.me")));
        assert!(!matches_required_acl(&granted, "ABC", Some("dird.contacts.XYZ")));
    }

    #[test]
    fn me_inside_a_segment_is_not_substituted() {
        let granted = acls(&["foo.named.bar"]);
        assert!(matches_required_acl(&granted, "ABC", Some("foo.named.bar")));
        assert!(!matches_required_acl(&granted, "ABC", Some("foo.naABCd.bar")));
    }

    #[test]
    fn single_segment_wildcard() {
        let granted = acls(&["confd.*.read"]);
        assert!(matches_required_acl(&granted, "ABC", Some("confd.users.read")));
        assert!(!matches_required_acl(
            &granted,
            "ABC",
            Some("confd.users.extensions.read")
        ));
    }

    #[test]
    fn multi_segment_wildcard() {
        let granted = acls(&["confd.#.read"]);
        assert!(matches_required_acl(&granted, "ABC", Some("confd.users.read")));
        assert!(matches_required_acl(
            &granted,
            "ABC",
            Some("confd.users.extensions.read")
        ));
    }

    #[test]
    fn negative_rules_take_precedence() {
        let granted = acls(&["confd.#", "!confd.users.#"]);
        assert!(!matches_required_acl(&granted, "ABC", Some("confd.users.read")));
        assert!(matches_required_acl(&granted, "ABC", Some("confd.lines.read")));
    }

    #[test]
    fn adding_a_negative_rule_only_removes_grants() {
        let granted = acls(&["confd.#"]);
        let requests = ["confd.users.read", "confd.lines.read", "confd.users"];
        let allowed_before: Vec<bool> = requests
            .iter()
            .map(|required| matches_required_acl(&granted, "ABC", Some(*required)))
            .collect();

        let restricted = acls(&["confd.#", "!confd.users.#"]);
        for (required, was_allowed) in requests.iter().zip(allowed_before) {
            let allowed = matches_required_acl(&restricted, "ABC", Some(*required));
            assert!(was_allowed || !allowed);
        }
    }
}
