//! Per-request driver.
//!
//! A request walks a fixed ladder: negotiate the optional test suite
//! (targets containing `"tests"`), ingest sources, run init-test checks
//! against the source texts, then run the resolved stage chain — with a
//! per-test-case fan-out over the final stage when a suite is present.
//! Whatever path a request takes, it closes with exactly one `finish`
//! envelope.

use tokio::sync::mpsc;
use tracing::info;

use crucible_core::checks::check_sources;
use crucible_core::protocol::{
    ClientEnvelope, TestSuite, WorkerEvent, STAGE_INIT, TESTS_TARGET_MARKER,
};
use crucible_core::rules::BuildStages;

use crate::config::WorkerConfig;
use crate::ingest::stage_sources;
use crate::stage::StageRun;
use crate::transport::Outbound;

/// Everything a request needs besides its message queues.
pub struct RequestContext<'a> {
    pub request_id: String,
    /// Stage name the client asked to reach.
    pub target: String,
    pub rules: &'a BuildStages,
    pub config: &'a WorkerConfig,
}

/// Drive one request to completion and emit its terminal `finish`.
pub async fn handle_request(
    ctx: RequestContext<'_>,
    events: &mpsc::Sender<Outbound>,
    inbound: &mut mpsc::Receiver<ClientEnvelope>,
) {
    info!(request_id = %ctx.request_id, target = %ctx.target, "request started");

    run_request(&ctx, events, inbound).await;

    let _ = events
        .send(Outbound::Event(WorkerEvent::finish(&ctx.request_id)))
        .await;
    info!(request_id = %ctx.request_id, "request finished");
}

async fn run_request(
    ctx: &RequestContext<'_>,
    events: &mpsc::Sender<Outbound>,
    inbound: &mut mpsc::Receiver<ClientEnvelope>,
) {
    let request_id = ctx.request_id.as_str();

    // Test-suite negotiation.
    let suite: Option<TestSuite> = if ctx.target.contains(TESTS_TARGET_MARKER) {
        let Some(envelope) = inbound.recv().await else {
            return;
        };
        match envelope.test_suite() {
            Some(suite) if !suite.is_empty() => Some(suite),
            _ => {
                send_init_error(
                    events,
                    request_id,
                    "Expected a test suite with at least one test case".to_owned(),
                )
                .await;
                return;
            }
        }
    } else {
        None
    };

    // Source ingestion.
    let Some(envelope) = inbound.recv().await else {
        return;
    };
    let files = envelope.source_files.unwrap_or_default();
    let staged = match stage_sources(&files, ctx.config).await {
        Ok(staged) => staged,
        Err(e) => {
            send_init_error(events, request_id, format!("Failed to read source code: {e}")).await;
            return;
        }
    };

    // Init-test checks run against the decoded texts, which are dropped
    // right after so they don't sit in memory while stages run.
    if let Some(suite) = &suite {
        for (index, test_case) in suite.init_test_cases.iter().enumerate() {
            let passed = test_case
                .checks
                .iter()
                .all(|check| check_sources(check, &staged.texts));
            let _ = events
                .send(Outbound::Event(WorkerEvent::test_result(
                    index, passed, STAGE_INIT, request_id,
                )))
                .await;
            if !passed {
                info!(request_id, test_case = index, "init test rejected the sources");
                return;
            }
        }
    }
    let source_files = staged.paths;
    drop(staged.texts);

    // Stage chain.
    let stages = match ctx.rules.stages_for_target(&ctx.target) {
        Ok(stages) => stages,
        Err(e) => {
            send_init_error(events, request_id, format!("Failed to resolve target: {e}")).await;
            return;
        }
    };

    match &suite {
        None => {
            for stage in &stages {
                let run = StageRun {
                    stage,
                    test_case: None,
                    source_files: &source_files,
                    request_id,
                };
                if !run.run(events, inbound).await {
                    break;
                }
            }
        }
        Some(suite) => {
            let Some((last, head)) = stages.split_last() else {
                return;
            };
            for stage in head {
                let run = StageRun {
                    stage,
                    test_case: None,
                    source_files: &source_files,
                    request_id,
                };
                if !run.run(events, inbound).await {
                    return;
                }
            }
            for (index, test_case) in suite.test_cases.iter().enumerate() {
                let run = StageRun {
                    stage: last,
                    test_case: Some((test_case, index)),
                    source_files: &source_files,
                    request_id,
                };
                if !run.run(events, inbound).await {
                    break;
                }
            }
        }
    }
}

async fn send_init_error(events: &mpsc::Sender<Outbound>, request_id: &str, description: String) {
    let _ = events
        .send(Outbound::Event(WorkerEvent::error(
            description,
            STAGE_INIT,
            request_id,
        )))
        .await;
}
