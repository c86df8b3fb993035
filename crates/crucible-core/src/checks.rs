//! Test-check evaluation.
//!
//! Pure functions applying a [`TestCheck`] either to a process exit code
//! or to the raw source texts. A check type that doesn't apply to the
//! value being checked passes vacuously, so a case may freely mix
//! source-text and exit-code checks.

use crate::protocol::TestCheck;

/// Check type applied to the final stage's exit code.
pub const CHECK_EXIT_CODE: &str = "exit_code";
/// Check type requiring some source text to contain the argument.
pub const CHECK_TEXT_CONTAINS: &str = "text_contains";
/// Check type requiring no source text to contain the argument.
pub const CHECK_TEXT_EXCLUDES: &str = "text_excludes";

/// A check whose argument can't be interpreted.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("failed to perform {kind} check: bad argument {arg:?}: {source}")]
    MalformedArg {
        kind: String,
        arg: String,
        source: std::num::ParseIntError,
    },
}

/// Apply an `exit_code` check to a process exit code.
///
/// Other check types pass vacuously.
///
/// # Errors
///
/// Returns [`CheckError::MalformedArg`] if the check argument doesn't
/// parse as a signed integer. The caller reports this as a stage error
/// and counts the check as failed.
pub fn check_exit_code(check: &TestCheck, exit_code: i32) -> Result<bool, CheckError> {
    if check.kind != CHECK_EXIT_CODE {
        return Ok(true);
    }
    let desired: i32 = check
        .arg
        .parse()
        .map_err(|source| CheckError::MalformedArg {
            kind: check.kind.clone(),
            arg: check.arg.clone(),
            source,
        })?;
    Ok(exit_code == desired)
}

/// Apply a `text_contains` / `text_excludes` check to the source texts.
///
/// Other check types pass vacuously.
#[must_use]
pub fn check_sources(check: &TestCheck, texts: &[String]) -> bool {
    match check.kind.as_str() {
        CHECK_TEXT_CONTAINS => texts.iter().any(|text| text.contains(&check.arg)),
        CHECK_TEXT_EXCLUDES => !texts.iter().any(|text| text.contains(&check.arg)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(kind: &str, arg: &str) -> TestCheck {
        TestCheck {
            kind: kind.to_owned(),
            arg: arg.to_owned(),
        }
    }

    #[test]
    fn exit_code_check_compares_parsed_argument() {
        assert!(check_exit_code(&check("exit_code", "0"), 0).unwrap());
        assert!(!check_exit_code(&check("exit_code", "0"), 1).unwrap());
        assert!(check_exit_code(&check("exit_code", "-1"), -1).unwrap());
    }

    #[test]
    fn exit_code_check_ignores_other_types() {
        assert!(check_exit_code(&check("text_contains", "x"), 42).unwrap());
    }

    #[test]
    fn malformed_exit_code_argument_is_an_error() {
        let err = check_exit_code(&check("exit_code", "zero"), 0).unwrap_err();
        assert!(err.to_string().contains("exit_code"));
    }

    #[test]
    fn text_contains_matches_any_source() {
        let texts = vec!["int main() {}".to_owned(), "// helper".to_owned()];
        assert!(check_sources(&check("text_contains", "main"), &texts));
        assert!(!check_sources(&check("text_contains", "goto"), &texts));
    }

    #[test]
    fn text_excludes_requires_absence_everywhere() {
        let texts = vec!["int main() {}".to_owned(), "// helper".to_owned()];
        assert!(check_sources(&check("text_excludes", "goto"), &texts));
        assert!(!check_sources(&check("text_excludes", "helper"), &texts));
    }

    #[test]
    fn source_checks_ignore_other_types() {
        assert!(check_sources(&check("exit_code", "0"), &["x".to_owned()]));
    }
}
