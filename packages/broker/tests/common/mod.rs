#![allow(dead_code, clippy::disallowed_methods)]

use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker::broker_core::{JobType, QueueConfig};
use broker::{
    ConnectionManager, ConnectionSettings, Delivery, DeliveryStream, Engine, EngineFuture,
    EngineInvocation, EngineOutput, MemoryBroker, MessageChannel, QueueProvisioner,
    QueueTopologyFactory, class_prefix,
};
use db::DbConfig;
use db::repositories::SurrealJobRepository;
use futures_util::StreamExt;
use storage::{JobStorage, Storage, StorageAreas, StorageConfig};

pub type TestResult = Result<(), Box<dyn Error>>;

/// Configuration for every job class, each with its own queue names.
pub fn topology_source() -> HashMap<String, String> {
    let mut source = HashMap::new();
    for job_type in JobType::ALL {
        let prefix = class_prefix(job_type);
        let base = job_type.as_str();
        for (suffix, value) in [
            ("QUEUE_ID", format!("{base}.jobs")),
            ("QUEUE_DURABLE", "true".to_string()),
            ("QUEUE_MAXLENGTH", "1000".to_string()),
            ("MSG_TTL", "86400000".to_string()),
            ("MSG_PREFETCH_COUNT", "1".to_string()),
            ("EXCHANGE_ID", format!("{base}.exchange")),
            ("EXCHANGE_TYPE", "direct".to_string()),
            ("EXCHANGE_DURABLE", "true".to_string()),
            ("BINDING_KEY", format!("{base}.jobs")),
            ("ROUTING_KEY", format!("{base}.jobs")),
            ("DEAD_LETTER_EXCHANGE_ID", format!("{base}.dlx")),
            ("DEAD_LETTER_EXCHANGE_TYPE", "direct".to_string()),
            ("DEAD_LETTER_EXCHANGE_DURABLE", "true".to_string()),
            ("DEAD_LETTER_QUEUE_ID", format!("{base}.dlq")),
            ("DEAD_LETTER_QUEUE_DURABLE", "true".to_string()),
            ("DEAD_LETTER_BINDING_KEY", format!("{base}.dead")),
            ("DEAD_LETTER_ROUTING_KEY", format!("{base}.dead")),
        ] {
            source.insert(format!("MQ_{prefix}_{suffix}"), value);
        }
    }
    source
}

pub fn topology() -> HashMap<JobType, QueueConfig> {
    QueueTopologyFactory::new(topology_source())
        .all()
        .expect("test topology is complete")
}

/// Records invocations and writes `report` to the `--output` path.
pub struct FakeEngine {
    pub exit_code: i32,
    pub report: Option<String>,
    seen: Mutex<Vec<EngineInvocation>>,
}

impl FakeEngine {
    pub fn new(exit_code: i32, report: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            exit_code,
            report: report.map(str::to_string),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl Engine for FakeEngine {
    fn run<'a>(&'a self, invocation: &'a EngineInvocation) -> EngineFuture<'a> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(invocation.clone());
            let output = invocation
                .args
                .iter()
                .position(|a| a == "--output")
                .and_then(|i| invocation.args.get(i + 1));
            if let (Some(path), Some(report)) = (output, &self.report) {
                tokio::fs::write(path, report).await.unwrap();
            }
            Ok(EngineOutput {
                exit_code: self.exit_code,
                stdout: "done".into(),
                stderr: String::new(),
                elapsed: Duration::from_millis(3),
            })
        })
    }
}

/// One in-process broker, job store and object store.
pub struct Harness {
    pub broker: MemoryBroker,
    pub manager: Arc<ConnectionManager>,
    pub repository: Arc<SurrealJobRepository>,
    pub jobs: JobStorage,
    pub topology: HashMap<JobType, QueueConfig>,
}

impl Harness {
    pub async fn new() -> Result<Self, Box<dyn Error>> {
        let broker = MemoryBroker::new();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.connector()),
            ConnectionSettings::new("memory://").with_backoff(Duration::from_millis(1)),
        ));
        let db = db::init(&DbConfig::memory()).await?;
        let storage = Storage::new(StorageConfig::memory()).await?;
        Ok(Self {
            broker,
            manager,
            repository: Arc::new(SurrealJobRepository::new(db)),
            jobs: JobStorage::new(storage, StorageAreas::default())?,
            topology: topology(),
        })
    }

    pub fn queue(&self, job_type: JobType) -> &QueueConfig {
        &self.topology[&job_type]
    }

    /// Declare every job class's topology.
    pub async fn provision(&self) -> TestResult {
        let channel = self.manager.get_channel("provisioner").await?;
        for config in self.topology.values() {
            QueueProvisioner.setup_queue(config, channel.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn channel(&self, service: &str) -> Result<Arc<dyn MessageChannel>, Box<dyn Error>> {
        Ok(self.manager.get_channel(service).await?)
    }
}

/// Next delivery from a consumer stream, failing after a second.
pub async fn next_delivery(stream: &mut DeliveryStream) -> Result<Option<Delivery>, Box<dyn Error>> {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await?
        .ok_or_else(|| "consumer stream ended".into())
}
