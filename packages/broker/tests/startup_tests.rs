//! The supervisor refuses to start without a handler for a configured class.

#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashMap;

use broker::broker_core::JobType;
use broker::{JobHandlerRegistry, SupervisorArgs, start_supervisor};
use common::{Harness, TestResult};
use tokio::sync::broadcast;

#[tokio::test]
async fn missing_handler_fails_startup() -> TestResult {
    let harness = Harness::new().await?;
    let config = harness.queue(JobType::Executable).clone();
    let (events, _rx) = broadcast::channel(8);

    let started = start_supervisor(SupervisorArgs {
        manager: harness.manager.clone(),
        repository: harness.repository.clone(),
        handlers: JobHandlerRegistry::new(),
        topology: HashMap::from([(JobType::Executable, config.clone())]),
        concurrency: 1,
        storage: None,
        cleanup: None,
        events,
    })
    .await;

    assert!(started.is_err());
    // Provisioning ran before the handler lookup.
    assert!(harness.broker.has_queue(&config.name).await);
    Ok(())
}
