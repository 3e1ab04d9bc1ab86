//! `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.

/// Expand placeholders from the process environment.
///
/// A variable that is unset and has no fallback is left as written so the
/// validator can point at it.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let placeholder = &after[..end];
        let (name, fallback) = match placeholder.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (placeholder, None),
        };
        match (lookup(name), fallback) {
            (Some(value), _) if !name.is_empty() => output.push_str(&value),
            (None, Some(fallback)) if !name.is_empty() => output.push_str(fallback),
            _ => {
                output.push_str("${");
                output.push_str(placeholder);
                output.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "ENDPOINT" => Some("Sales".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_env_with("name = \"${ENDPOINT}\"", lookup),
            "name = \"Sales\""
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(substitute_env_with("${MISSING}", lookup), "${MISSING}");
    }

    #[test]
    fn falls_back_when_unset() {
        assert_eq!(substitute_env_with("${MISSING:-error}", lookup), "error");
        assert_eq!(substitute_env_with("${EMPTY:-error}", lookup), "");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env_with("a ${ENDPOINT", lookup), "a ${ENDPOINT");
        assert_eq!(substitute_env_with("${}", lookup), "${}");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
