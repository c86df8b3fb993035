//! Wire envelopes exchanged with the backend.
//!
//! Envelopes are JSON objects; the discriminator is the set of populated
//! fields, not a type tag. Inbound frames all deserialize into one
//! [`ClientEnvelope`] of optional fields. Outbound frames are a sum type
//! serialized `untagged`, so only the active variant's fields reach the
//! wire. Every outbound envelope carries the `request_id` of the request
//! that produced it.

use serde::{Deserialize, Serialize};

/// Command that opens a request.
pub const COMMAND_NEW: &str = "new";
/// Command that kills the currently running stage's child process.
pub const COMMAND_STOP: &str = "stop";

/// Stage name used for pre-stage request processing.
pub const STAGE_INIT: &str = "init";

/// Substring of a target name that makes the worker expect a test suite
/// before the sources.
pub const TESTS_TARGET_MARKER: &str = "tests";

/// One user source file as received from the backend.
///
/// `text` is base64 on the wire; `hash` is the lowercase hex MD5 of the
/// decoded bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
    pub hash: String,
}

/// A single check within a test case.
///
/// `exit_code` checks apply to the final stage's exit code;
/// `text_contains` / `text_excludes` apply to the raw source texts.
/// Unknown types are vacuously true wherever they don't apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCheck {
    #[serde(rename = "type")]
    pub kind: String,
    pub arg: String,
}

/// A described list of checks, all of which must pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub description: String,
    pub checks: Vec<TestCheck>,
}

/// The optional per-request test suite.
///
/// `init_test_cases` run against the source texts before any stage;
/// `test_cases` fan out over the final stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSuite {
    #[serde(default)]
    pub init_test_cases: Vec<TestCase>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl TestSuite {
    /// A suite with no cases at all is not a suite.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.init_test_cases.is_empty() && self.test_cases.is_empty()
    }
}

/// Any frame the backend may send.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub source_files: Option<Vec<SourceFile>>,
    #[serde(default)]
    pub init_test_cases: Option<Vec<TestCase>>,
    #[serde(default)]
    pub test_cases: Option<Vec<TestCase>>,
}

impl ClientEnvelope {
    /// Interpret this envelope as a test suite, if either case list is
    /// populated.
    #[must_use]
    pub fn test_suite(&self) -> Option<TestSuite> {
        if self.init_test_cases.is_none() && self.test_cases.is_none() {
            return None;
        }
        Some(TestSuite {
            init_test_cases: self.init_test_cases.clone().unwrap_or_default(),
            test_cases: self.test_cases.clone().unwrap_or_default(),
        })
    }
}

/// Any frame the worker sends to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WorkerEvent {
    /// Stage lifecycle marker, `event` is `"started"` or `"completed"`.
    Stage {
        event: &'static str,
        stage: String,
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        test_case: Option<String>,
    },

    /// One chunk of child output, base64-encoded.
    Output {
        output: String,
        #[serde(rename = "type")]
        kind: &'static str,
        stage: String,
        request_id: String,
    },

    /// Exit code of the stage's child process.
    ExitCode {
        exit_code: i32,
        stage: String,
        request_id: String,
    },

    /// Wall-clock duration of the stage.
    Duration {
        duration_sec: f64,
        stage: String,
        request_id: String,
    },

    /// Verdict for one test case.
    TestResult {
        test_case: String,
        result: bool,
        stage: String,
        request_id: String,
    },

    /// A request-scoped error, also logged on the worker side.
    Error {
        description: String,
        stage: String,
        request_id: String,
    },

    /// Terminal envelope; exactly one per request, always last.
    Finish { finish: bool, request_id: String },
}

impl WorkerEvent {
    /// The originating request, present on every variant.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Stage { request_id, .. }
            | Self::Output { request_id, .. }
            | Self::ExitCode { request_id, .. }
            | Self::Duration { request_id, .. }
            | Self::TestResult { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::Finish { request_id, .. } => request_id,
        }
    }

    #[must_use]
    pub fn started(stage: &str, request_id: &str, test_case: Option<usize>) -> Self {
        Self::Stage {
            event: "started",
            stage: stage.to_owned(),
            request_id: request_id.to_owned(),
            test_case: test_case.map(|i| i.to_string()),
        }
    }

    #[must_use]
    pub fn completed(stage: &str, request_id: &str) -> Self {
        Self::Stage {
            event: "completed",
            stage: stage.to_owned(),
            request_id: request_id.to_owned(),
            test_case: None,
        }
    }

    #[must_use]
    pub fn output(encoded: String, kind: &'static str, stage: &str, request_id: &str) -> Self {
        Self::Output {
            output: encoded,
            kind,
            stage: stage.to_owned(),
            request_id: request_id.to_owned(),
        }
    }

    #[must_use]
    pub fn exit_code(exit_code: i32, stage: &str, request_id: &str) -> Self {
        Self::ExitCode {
            exit_code,
            stage: stage.to_owned(),
            request_id: request_id.to_owned(),
        }
    }

    #[must_use]
    pub fn duration(duration_sec: f64, stage: &str, request_id: &str) -> Self {
        Self::Duration {
            duration_sec,
            stage: stage.to_owned(),
            request_id: request_id.to_owned(),
        }
    }

    #[must_use]
    pub fn test_result(index: usize, result: bool, stage: &str, request_id: &str) -> Self {
        Self::TestResult {
            test_case: index.to_string(),
            result,
            stage: stage.to_owned(),
            request_id: request_id.to_owned(),
        }
    }

    #[must_use]
    pub fn error(description: String, stage: &str, request_id: &str) -> Self {
        Self::Error {
            description,
            stage: stage.to_owned(),
            request_id: request_id.to_owned(),
        }
    }

    #[must_use]
    pub fn finish(request_id: &str) -> Self {
        Self::Finish {
            finish: true,
            request_id: request_id.to_owned(),
        }
    }
}
