//! Shared message and mapped types used across integration flows.

use keel_bus::{parse_severity, Message, Severity};
use keel_kv::{KvMapped, Schema};
use serde::{Deserialize, Serialize};
use std::sync::{Once, OnceLock};

// =============================================================================
// LOGGING
// =============================================================================

static LOGGING: Once = Once::new();

/// Install a quiet test subscriber once per process. `RUST_LOG` still applies.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let mut config = keel_telemetry::TelemetryConfig::for_component("tests");
        config.log_level = "warn".to_string();
        if let Err(e) = keel_telemetry::init_logging(&config) {
            eprintln!("test logging not installed: {e}");
        }
        tracing::debug!(service = %config.service_name, "test logging ready");
    });
}

// =============================================================================
// BUS MESSAGES
// =============================================================================

/// Node health report; the level is free-form text from the node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node: String,
    pub level: String,
    pub detail: String,
}

impl NodeHealth {
    pub fn new(node: &str, level: &str, detail: &str) -> Self {
        Self {
            node: node.to_string(),
            level: level.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl Message for NodeHealth {
    fn severity(&self) -> Option<Severity> {
        parse_severity(&self.level)
    }
}

/// Image lifecycle event. Carries no severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEvent {
    pub image: String,
    pub action: String,
}

impl Message for ImageEvent {}

/// Deployment step outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub pipeline: String,
    pub stage: u32,
    pub failed: bool,
}

impl Message for DeployOutcome {
    fn severity(&self) -> Option<Severity> {
        Some(if self.failed {
            Severity::Error
        } else {
            Severity::Info
        })
    }
}

// =============================================================================
// MAPPED OBJECTS
// =============================================================================

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl KvMapped for EnvVar {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<EnvVar>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("env-var")
                .field("key", |e: &EnvVar| &e.key, |e, v| e.key = v)
                .field("value", |e: &EnvVar| &e.value, |e, v| e.value = v)
                .build()
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
    pub env: Vec<EnvVar>,
    pub timeout_secs: Option<u64>,
}

impl KvMapped for Stage {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Stage>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("stage")
                .field("name", |s: &Stage| &s.name, |s, v| s.name = v)
                .field("image", |s: &Stage| &s.image, |s, v| s.image = v)
                .list("commands", |s: &Stage| &s.commands, |s, v| s.commands = v)
                .nested_list("env", |s: &Stage| &s.env, |s, v| s.env = v)
                .optional_field(
                    "timeout",
                    |s: &Stage| &s.timeout_secs,
                    |s, v| s.timeout_secs = v,
                )
                .build()
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Source {
    pub repository: String,
    pub branch: String,
}

impl KvMapped for Source {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Source>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("source")
                .field(
                    "repository",
                    |s: &Source| &s.repository,
                    |s, v| s.repository = v,
                )
                .field("branch", |s: &Source| &s.branch, |s, v| s.branch = v)
                .build()
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Notify {
    pub email: String,
    pub on_failure_only: bool,
}

impl KvMapped for Notify {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Notify>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("notify")
                .field("email", |n: &Notify| &n.email, |n, v| n.email = v)
                .field(
                    "on-failure-only",
                    |n: &Notify| &n.on_failure_only,
                    |n, v| n.on_failure_only = v,
                )
                .build()
        })
    }
}

/// Deployment pipeline definition.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub description: Option<String>,
    pub labels: Vec<String>,
    pub source: Source,
    pub stages: Vec<Stage>,
    pub notify: Option<Notify>,
}

impl KvMapped for Pipeline {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Pipeline>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("pipeline")
                .field("name", |p: &Pipeline| &p.name, |p, v| p.name = v)
                .optional_field(
                    "description",
                    |p: &Pipeline| &p.description,
                    |p, v| p.description = v,
                )
                .list("labels", |p: &Pipeline| &p.labels, |p, v| p.labels = v)
                .nested("source", |p: &Pipeline| &p.source, |p, v| p.source = v)
                .nested_list("stages", |p: &Pipeline| &p.stages, |p, v| p.stages = v)
                .optional_nested("notify", |p: &Pipeline| &p.notify, |p, v| p.notify = v)
                .build()
        })
    }
}

/// A three-stage pipeline with every field shape populated.
pub fn sample_pipeline(name: &str) -> Pipeline {
    let stage = |stage: &str, image: &str, commands: &[&str]| Stage {
        name: stage.to_string(),
        image: image.to_string(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        env: vec![EnvVar {
            key: "STAGE".to_string(),
            value: stage.to_string(),
        }],
        timeout_secs: Some(600),
    };

    Pipeline {
        name: name.to_string(),
        description: Some("build and ship the web frontend".to_string()),
        labels: vec!["web".to_string(), "nightly".to_string()],
        source: Source {
            repository: "git@example.org:web/frontend.git".to_string(),
            branch: "main".to_string(),
        },
        stages: vec![
            stage("build", "node:20", &["npm ci", "npm run build"]),
            stage("test", "node:20", &["npm test"]),
            stage("ship", "docker:27", &["docker build .", "docker push"]),
        ],
        notify: Some(Notify {
            email: "ops@example.org".to_string(),
            on_failure_only: true,
        }),
    }
}
