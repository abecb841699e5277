//! JVM options passed to the registry through the environment
//!
//! Users may set JVM options through two variables: [`JAVA_OPTIONS`] and the
//! deprecated [`JAVA_OPTIONS_LEGACY`]. The operator adds its own options (the
//! TLS certificate paths, for example) through [`JAVA_OPTIONS_OPERATOR`]. The
//! three are parsed as shell words, merged option by option and written back
//! as a single [`JAVA_OPTIONS`] variable. [`JAVA_OPTIONS_COMBINED`] holds the
//! merged value in the env cache until it is written.

use crate::error::{OperatorError, Result};
use k8s_openapi::api::core::v1::EnvVar;
use std::collections::BTreeMap;

pub const JAVA_OPTIONS: &str = "JAVA_OPTS_APPEND";
pub const JAVA_OPTIONS_LEGACY: &str = "JAVA_OPTIONS";
pub const JAVA_OPTIONS_OPERATOR: &str = "JAVA_OPTS_APPEND_OPERATOR";
pub const JAVA_OPTIONS_COMBINED: &str = "JAVA_OPTS_APPEND_COMBINED";

/// Variables that only exist inside the env cache
pub fn is_internal(name: &str) -> bool {
    name == JAVA_OPTIONS_OPERATOR || name == JAVA_OPTIONS_COMBINED
}

/// Options keyed by the part before the first `=`; `None` for a bare flag
pub type JavaOptions = BTreeMap<String, Option<String>>;

/// Split `input` into shell words.
///
/// Single quotes are literal, double quotes honour `\` before `"`, `\`, `$`
/// and `` ` ``, and a backslash outside quotes escapes the next character.
pub fn split_shell_words(input: &str) -> Result<Vec<String>> {
    #[derive(PartialEq)]
    enum State {
        Between,
        Word,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut word = String::new();
    let mut state = State::Between;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Between | State::Word => match c {
                c if c.is_whitespace() => {
                    if state == State::Word {
                        words.push(std::mem::take(&mut word));
                    }
                    state = State::Between;
                }
                '\'' => state = State::Single,
                '"' => state = State::Double,
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| {
                        OperatorError::InvalidConfig(format!("trailing backslash in '{}'", input))
                    })?;
                    word.push(escaped);
                    state = State::Word;
                }
                c => {
                    word.push(c);
                    state = State::Word;
                }
            },
            State::Single => match c {
                '\'' => state = State::Word,
                c => word.push(c),
            },
            State::Double => match c {
                '"' => state = State::Word,
                '\\' => match chars.next() {
                    Some(escaped @ ('"' | '\\' | '$' | '`')) => word.push(escaped),
                    Some(other) => {
                        word.push('\\');
                        word.push(other);
                    }
                    None => break,
                },
                c => word.push(c),
            },
        }
    }

    match state {
        State::Single | State::Double => Err(OperatorError::InvalidConfig(format!(
            "unterminated quote in '{}'",
            input
        ))),
        State::Word => {
            words.push(word);
            Ok(words)
        }
        State::Between => Ok(words),
    }
}

/// Parse shell quoted JVM options, later duplicates win
pub fn parse(input: &str) -> Result<JavaOptions> {
    Ok(split_shell_words(input)?
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (word, None),
        })
        .collect())
}

/// Quote `word` so [`split_shell_words`] reads it back unchanged
fn quote(word: &str) -> String {
    let plain = !word.is_empty()
        && !word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\' | '$' | '`'));
    if plain {
        word.to_string()
    } else if !word.contains('\'') {
        format!("'{}'", word)
    } else {
        let mut quoted = String::with_capacity(word.len() + 2);
        quoted.push('"');
        for c in word.chars() {
            if matches!(c, '"' | '\\' | '$' | '`') {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted.push('"');
        quoted
    }
}

/// Render options as one shell quoted string, ordered by key
pub fn render(options: &JavaOptions) -> String {
    options
        .iter()
        .map(|(key, value)| match value {
            Some(value) => quote(&format!("{}={}", key, value)),
            None => quote(key),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Merge option sets; a later set overrides the same key of an earlier one
pub fn merge<'a>(sets: impl IntoIterator<Item = &'a JavaOptions>) -> JavaOptions {
    let mut merged = JavaOptions::new();
    for set in sets {
        merged.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Replace the internal variables of a linearized env list.
///
/// The combined value takes the place of [`JAVA_OPTIONS`] if the list carries
/// one, or its own place otherwise. The operator variable is dropped.
pub fn finalize(vars: Vec<EnvVar>) -> Vec<EnvVar> {
    let combined = vars
        .iter()
        .find(|v| v.name == JAVA_OPTIONS_COMBINED)
        .map(|v| v.value.clone());
    let Some(combined) = combined else {
        return vars
            .into_iter()
            .filter(|v| v.name != JAVA_OPTIONS_OPERATOR)
            .collect();
    };

    let has_java_options = vars.iter().any(|v| v.name == JAVA_OPTIONS);
    let merged = EnvVar {
        name: JAVA_OPTIONS.to_string(),
        value: combined,
        ..Default::default()
    };
    let mut merged = Some(merged);
    let mut out = Vec::with_capacity(vars.len());
    for var in vars {
        let slot = if has_java_options {
            var.name == JAVA_OPTIONS
        } else {
            var.name == JAVA_OPTIONS_COMBINED
        };
        if slot {
            out.extend(merged.take());
        } else if !is_internal(&var.name) && var.name != JAVA_OPTIONS {
            out.push(var);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options(pairs: &[(&str, Option<&str>)]) -> JavaOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(String::from)))
            .collect()
    }

    fn var(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_quoted_options() {
        let legacy = "-Xms256m -Xmx1g -Dsimple=value -Ddots.dots.dots=true -Dspaces=\"one two three\" '-Dsingle quoted = true' \"-Ddouble quoted = true \"";
        assert_eq!(
            parse(legacy).unwrap(),
            options(&[
                ("-Xms256m", None),
                ("-Xmx1g", None),
                ("-Dsimple", Some("value")),
                ("-Ddots.dots.dots", Some("true")),
                ("-Dspaces", Some("one two three")),
                ("-Dsingle quoted ", Some(" true")),
                ("-Ddouble quoted ", Some(" true ")),
            ])
        );

        let append = "'-Dsingle quoted = false'          -Xms512          \n\n-Djust.quote=\"'\" -Djust.double.quote='\"'\n\n-Dspaces=\"one two three  four \"";
        assert_eq!(
            parse(append).unwrap(),
            options(&[
                ("-Dsingle quoted ", Some(" false")),
                ("-Xms512", None),
                ("-Djust.quote", Some("'")),
                ("-Djust.double.quote", Some("\"")),
                ("-Dspaces", Some("one two three  four ")),
            ])
        );
    }

    #[test]
    fn test_parse_rejects_unterminated_quote() {
        assert!(parse("-Da='open").is_err());
        assert!(parse("-Da=\"open").is_err());
        assert!(parse("-Da=b\\").is_err());
        assert_eq!(parse("   ").unwrap(), JavaOptions::new());
    }

    #[test]
    fn test_merge_and_render() {
        let legacy = parse("-Dcolor=green -Dcute=false").unwrap();
        let append = parse("-Danimal=frog -Dcute=true").unwrap();
        let merged = merge([&legacy, &append]);

        assert_eq!(render(&merged), "-Danimal=frog -Dcolor=green -Dcute=true");
    }

    #[test]
    fn test_render_survives_parsing() {
        let merged = merge([
            &parse("'-Dsingle quoted = true' -Xmx1g").unwrap(),
            &parse("-Djust.quote=\"'\" -Djust.double.quote='\"' -Dcost='$5'").unwrap(),
        ]);
        let rendered = render(&merged);
        assert_eq!(parse(&rendered).unwrap(), merged);
    }

    #[test]
    fn test_finalize_replaces_java_options() {
        let vars = vec![
            var(JAVA_OPTIONS_LEGACY, "-Dcolor=green"),
            var(JAVA_OPTIONS, "-Danimal=frog"),
            var("VAR_3_NAME", "VAR_3_VALUE"),
            var(JAVA_OPTIONS_OPERATOR, "-Dtls=on"),
            var(JAVA_OPTIONS_COMBINED, "-Danimal=frog -Dcolor=green -Dtls=on"),
        ];
        let names: Vec<(String, Option<String>)> = finalize(vars)
            .into_iter()
            .map(|v| (v.name, v.value))
            .collect();
        assert_eq!(
            names,
            vec![
                (JAVA_OPTIONS_LEGACY.to_string(), Some("-Dcolor=green".to_string())),
                (
                    JAVA_OPTIONS.to_string(),
                    Some("-Danimal=frog -Dcolor=green -Dtls=on".to_string())
                ),
                ("VAR_3_NAME".to_string(), Some("VAR_3_VALUE".to_string())),
            ]
        );
    }

    #[test]
    fn test_finalize_without_user_options() {
        let vars = vec![
            var("A", "1"),
            var(JAVA_OPTIONS_OPERATOR, "-Dtls=on"),
            var(JAVA_OPTIONS_COMBINED, "-Dtls=on"),
        ];
        let names: Vec<String> = finalize(vars).into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["A".to_string(), JAVA_OPTIONS.to_string()]);

        let names: Vec<String> = finalize(vec![var("A", "1"), var(JAVA_OPTIONS_OPERATOR, "x")])
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["A".to_string()]);
    }
}
