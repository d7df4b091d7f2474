//! Harness configuration.
//!
//! Loaded from a YAML file (`trackbench.yml` by convention). The
//! prompt text and the tool catalog are deliberately external files:
//! they are incidental configuration the pipeline treats as opaque.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use trackbench_adapters::{WorkerCommand, DEFAULT_BASE_URL, DEFAULT_CALL_TIMEOUT};
use trackbench_proto::ToolSpec;

/// Top-level configuration for a harness run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Worker process launch settings.
    #[serde(default)]
    pub worker: WorkerSection,

    /// Chat service settings (resolution and evaluation roles).
    #[serde(default)]
    pub chat: ChatSection,

    /// Pipeline timing and rubric settings.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Session tracking settings.
    #[serde(default)]
    pub tracking: TrackingSection,

    /// Case suite file, resolved against the config directory when
    /// relative.
    #[serde(default = "default_cases_file")]
    pub cases_file: PathBuf,

    /// Directory the config file was loaded from; relative paths in
    /// the config resolve against it.
    #[serde(skip)]
    base_dir: PathBuf,
}

/// Worker process launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: String,

    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,

    /// Working directory for the worker process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Environment entries layered over the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Regex matched against worker stdout to detect readiness.
    #[serde(default = "default_ready_pattern")]
    pub ready_pattern: Option<String>,

    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Tool invoked once after startup as a best-effort health probe.
    /// Probe failure is logged, never fatal.
    #[serde(default)]
    pub health_check_tool: Option<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            working_dir: None,
            env: HashMap::new(),
            ready_pattern: default_ready_pattern(),
            startup_grace_ms: default_startup_grace_ms(),
            health_check_tool: None,
        }
    }
}

impl WorkerSection {
    /// Converts the section into the supervisor's launch description.
    pub fn to_command(&self) -> WorkerCommand {
        let mut command = WorkerCommand::new(&self.command);
        command.args = self.args.clone();
        command.working_dir = self.working_dir.clone();
        command.env = self.env.clone();
        command.ready_pattern = self.ready_pattern.clone();
        command.startup_grace = Duration::from_millis(self.startup_grace_ms);
        command
    }
}

/// Chat service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSection {
    /// Model used for intent resolution and follow-up rounds.
    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for the evaluation role.
    #[serde(default = "default_model")]
    pub eval_model: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            eval_model: default_model(),
            base_url: default_base_url(),
        }
    }
}

/// Pipeline timing and rubric settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Per-RPC-call timeout.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Delay between test cases, for external rate limiting.
    #[serde(default = "default_inter_case_delay_ms")]
    pub inter_case_delay_ms: u64,

    /// Optional overall deadline per conversation. Off by default:
    /// only per-RPC timeouts bound a conversation then.
    #[serde(default)]
    pub conversation_timeout_secs: Option<u64>,

    /// Evaluation rubric; criterion names key the score map.
    #[serde(default = "default_rubric")]
    pub rubric: Vec<RubricCriterion>,

    /// Instruction text file for the resolution round, resolved
    /// against the config directory when relative.
    #[serde(default = "default_system_prompt_file")]
    pub system_prompt_file: PathBuf,

    /// Tool catalog file, resolved against the config directory when
    /// relative.
    #[serde(default = "default_tools_file")]
    pub tools_file: PathBuf,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            inter_case_delay_ms: default_inter_case_delay_ms(),
            conversation_timeout_secs: None,
            rubric: default_rubric(),
            system_prompt_file: default_system_prompt_file(),
            tools_file: default_tools_file(),
        }
    }
}

/// One evaluation criterion: its score-map key and the question the
/// judge is asked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RubricCriterion {
    pub name: String,
    pub prompt: String,
}

/// Session tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSection {
    /// Directory session files are written to.
    #[serde(default = "default_tracking_dir")]
    pub dir: PathBuf,

    /// Session label recorded in each session file.
    #[serde(default = "default_session_label")]
    pub label: String,

    /// How many issue-frequency entries the report surfaces.
    #[serde(default = "default_top_issues")]
    pub top_issues: usize,
}

impl Default for TrackingSection {
    fn default() -> Self {
        Self {
            dir: default_tracking_dir(),
            label: default_session_label(),
            top_issues: default_top_issues(),
        }
    }
}

/// Errors loading or resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HarnessConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        debug!(path = %path.display(), "Loaded harness config");
        Ok(config)
    }

    /// Reads the resolution-round instruction text.
    pub fn system_prompt(&self) -> Result<String, ConfigError> {
        let path = self.resolve(&self.pipeline.system_prompt_file);
        std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path, source })
    }

    /// Reads the declared tool catalog.
    pub fn tool_catalog(&self) -> Result<Vec<ToolSpec>, ConfigError> {
        let path = self.resolve(&self.pipeline.tools_file);
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let file: CatalogFile = serde_yaml::from_str(&content)?;
        Ok(file
            .tools
            .into_iter()
            .map(|tool| ToolSpec::function(tool.name, tool.description, tool.parameters))
            .collect())
    }

    /// Path of the case suite file.
    pub fn cases_path(&self) -> PathBuf {
        self.resolve(&self.cases_file)
    }

    /// Resolves a config-relative path.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// On-disk shape of the tool catalog file.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    tools: Vec<CatalogTool>,
}

#[derive(Debug, Deserialize)]
struct CatalogTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_parameters")]
    parameters: serde_json::Value,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn default_worker_command() -> String {
    "python".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec![
        "-m".to_string(),
        "server.app".to_string(),
        "--transport".to_string(),
        "stdio".to_string(),
    ]
}

fn default_ready_pattern() -> Option<String> {
    Some("Server started|initialize".to_string())
}

fn default_startup_grace_ms() -> u64 {
    3000
}

fn default_model() -> String {
    "gpt-4-turbo-preview".to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_millis() as u64
}

fn default_inter_case_delay_ms() -> u64 {
    1000
}

fn default_rubric() -> Vec<RubricCriterion> {
    [
        ("correctness", "Did it understand and execute the right action?"),
        ("completeness", "Was all necessary information provided?"),
        ("helpfulness", "Does this help the user achieve their goal?"),
        ("clarity", "Is the response clear and easy to understand?"),
    ]
    .iter()
    .map(|(name, prompt)| RubricCriterion {
        name: (*name).to_string(),
        prompt: (*prompt).to_string(),
    })
    .collect()
}

fn default_system_prompt_file() -> PathBuf {
    PathBuf::from("system-prompt.md")
}

fn default_tools_file() -> PathBuf {
    PathBuf::from("tools.yml")
}

fn default_cases_file() -> PathBuf {
    PathBuf::from("cases.yml")
}

fn default_tracking_dir() -> PathBuf {
    PathBuf::from("conversation-tracking")
}

fn default_session_label() -> String {
    "nlp-execution-tests".to_string()
}

fn default_top_issues() -> usize {
    5
}
