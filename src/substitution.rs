//! `{{name}}` / `${name}` variable tokens.
//!
//! A single left-to-right scan. Replacement values are never rescanned, and
//! tokens without a matching variable are copied through unchanged.

use std::collections::HashMap;

enum Token<'a> {
    /// Name and the byte length of the whole token.
    Var(&'a str, usize),
    Literal(char),
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['{', '}', '\n', '\r'])
}

fn next_token(rest: &str) -> Option<Token<'_>> {
    let (open, close) = if rest.starts_with("{{") {
        ("{{", "}}")
    } else if rest.starts_with("${") {
        ("${", "}")
    } else {
        return rest.chars().next().map(Token::Literal);
    };
    if let Some(end) = rest[open.len()..].find(close) {
        let raw = &rest[open.len()..open.len() + end];
        let name = raw.trim();
        if valid_name(name) {
            return Some(Token::Var(name, open.len() + end + close.len()));
        }
    }
    // Malformed or unterminated: emit the first char and keep scanning.
    rest.chars().next().map(Token::Literal)
}

/// Replaces every resolvable token in `text` with its value from `variables`.
pub fn substitute(text: &str, variables: &HashMap<String, String>) -> String {
    if !text.contains("{{") && !text.contains("${") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(token) = next_token(&text[pos..]) {
        match token {
            Token::Var(name, len) => {
                match variables.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&text[pos..pos + len]),
                }
                pos += len;
            }
            Token::Literal(c) => {
                out.push(c);
                pos += c.len_utf8();
            }
        }
    }
    out
}

/// Names of all well-formed tokens in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut pos = 0;
    while let Some(token) = next_token(&text[pos..]) {
        match token {
            Token::Var(name, len) => {
                names.push(name.to_string());
                pos += len;
            }
            Token::Literal(c) => pos += c.len_utf8(),
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn both_token_styles_resolve() {
        let v = vars(&[("name", "Kim"), ("id", "42")]);
        assert_eq!(substitute("Hi {{name}} #${id}", &v), "Hi Kim #42");
        assert_eq!(substitute("{{ name }}", &v), "Kim");
    }

    #[test]
    fn unresolved_tokens_stay_byte_identical() {
        let v = vars(&[("a", "1")]);
        assert_eq!(substitute("x {{missing}} ${other} {{a}}", &v), "x {{missing}} ${other} 1");
    }

    #[test]
    fn text_without_tokens_is_unchanged_and_idempotent() {
        let v = vars(&[("a", "1")]);
        for s in ["", "plain", "braces { } and $ signs", "확인 버튼", "{single}"] {
            let once = substitute(s, &v);
            assert_eq!(once, s);
            assert_eq!(substitute(&once, &v), once);
        }
    }

    #[test]
    fn values_are_not_rescanned() {
        let v = vars(&[("a", "{{b}}"), ("b", "nope")]);
        assert_eq!(substitute("{{a}}", &v), "{{b}}");
    }

    #[test]
    fn malformed_tokens_pass_through_best_effort() {
        let v = vars(&[("x", "1")]);
        assert_eq!(substitute("{{x", &v), "{{x");
        assert_eq!(substitute("${", &v), "${");
        assert_eq!(substitute("{{{{x}}}}", &v), "{{1}}");
        assert_eq!(substitute("{{}}", &v), "{{}}");
    }

    #[test]
    fn placeholders_lists_names() {
        assert_eq!(placeholders("{{a}} and ${b} and {{a}}"), vec!["a", "b", "a"]);
        assert!(placeholders("none").is_empty());
    }
}
