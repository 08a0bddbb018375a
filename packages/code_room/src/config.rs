use anyhow::{Context, Result, ensure};
use run_sandbox::Toolchain;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Upper bound for every `*_secs` setting
const MAX_DURATION_SECS: u64 = 24 * 60 * 60;
/// Upper bound for every `*_kb` setting (1 GiB)
const MAX_SIZE_KB: usize = 1024 * 1024;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [rooms]
//                    capacity = 4
//
//   env var:         CODE_ROOM_ROOMS__CAPACITY=4   (double underscore = nesting)
//
//   toolchains:      [run.languages.ruby]
//                    source_file = "main.rb"
//                    command = ["ruby", "main.rb"]

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub rooms: RoomsFileConfig,
    #[serde(default)]
    pub run: RunFileConfig,
    #[serde(default)]
    pub questions: QuestionsFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Room membership and document limits (lives under `[rooms]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomsFileConfig {
    /// Maximum simultaneous participants per room
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// How long an empty room survives before it is discarded
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Time a new connection has to send its `init` frame
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Frames buffered per participant before the connection is dropped
    #[serde(default = "default_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Commands buffered per room actor
    #[serde(default = "default_queue_capacity")]
    pub command_queue_capacity: usize,
    #[serde(default = "default_max_document_kb")]
    pub max_document_kb: usize,
    /// Language of a freshly created room when the joiner does not name one
    #[serde(default = "default_language")]
    pub default_language: String,
}

impl Default for RoomsFileConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            grace_period_secs: default_grace_period_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            outbound_queue_capacity: default_queue_capacity(),
            command_queue_capacity: default_queue_capacity(),
            max_document_kb: default_max_document_kb(),
            default_language: default_language(),
        }
    }
}

/// Execution settings (lives under `[run]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunFileConfig {
    #[serde(default = "default_run_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_kb")]
    pub max_output_kb: usize,
    /// Wrapper placed in front of every toolchain command, e.g.
    /// `["bwrap", "--unshare-all", "--die-with-parent", ...]`
    #[serde(default)]
    pub sandbox_prefix: Vec<String>,
    /// The runnable languages. Anything not listed here is editable only.
    #[serde(default = "default_toolchains")]
    pub languages: BTreeMap<String, Toolchain>,
}

impl Default for RunFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_run_timeout_secs(),
            max_output_kb: default_max_output_kb(),
            sandbox_prefix: Vec::new(),
            languages: default_toolchains(),
        }
    }
}

/// Question bank source (lives under `[questions]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuestionsFileConfig {
    /// JSON array of questions; no questions are served when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_capacity() -> usize {
    2
}
fn default_grace_period_secs() -> u64 {
    30
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_document_kb() -> usize {
    1024
}
fn default_language() -> String {
    "python".to_string()
}
fn default_run_timeout_secs() -> u64 {
    10
}
fn default_max_output_kb() -> usize {
    1024
}

pub fn default_toolchains() -> BTreeMap<String, Toolchain> {
    BTreeMap::from([
        (
            "python".to_string(),
            Toolchain::new("main.py", ["python3", "-u", "main.py"]),
        ),
        (
            "java".to_string(),
            Toolchain::new("Main.java", ["java", "Main.java"]),
        ),
        (
            "cpp".to_string(),
            Toolchain::new(
                "main.cpp",
                ["sh", "-c", "g++ -O2 -std=c++17 -o main main.cpp && ./main"],
            ),
        ),
    ])
}

impl FileConfig {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.rooms.capacity >= 1, "rooms.capacity must be at least 1");
        ensure!(
            self.rooms.outbound_queue_capacity >= 1,
            "rooms.outbound_queue_capacity must be at least 1"
        );
        ensure!(
            self.rooms.command_queue_capacity >= 1,
            "rooms.command_queue_capacity must be at least 1"
        );
        ensure!(
            self.rooms.handshake_timeout_secs >= 1,
            "rooms.handshake_timeout_secs must be at least 1"
        );
        ensure!(self.run.timeout_secs >= 1, "run.timeout_secs must be at least 1");
        for (key, secs) in [
            ("rooms.grace_period_secs", self.rooms.grace_period_secs),
            ("rooms.handshake_timeout_secs", self.rooms.handshake_timeout_secs),
            ("run.timeout_secs", self.run.timeout_secs),
        ] {
            ensure!(
                secs <= MAX_DURATION_SECS,
                "{key} must be at most {MAX_DURATION_SECS} (one day)"
            );
        }
        for (key, kb) in [
            ("rooms.max_document_kb", self.rooms.max_document_kb),
            ("run.max_output_kb", self.run.max_output_kb),
        ] {
            ensure!(kb <= MAX_SIZE_KB, "{key} must be at most {MAX_SIZE_KB} (1 GiB)");
        }
        for (language, toolchain) in &self.run.languages {
            ensure!(
                !toolchain.command.is_empty(),
                "run.languages.{language}.command is empty"
            );
            ensure!(
                toolchain.has_plain_source_file(),
                "run.languages.{language}.source_file must be a bare file name"
            );
        }
        Ok(())
    }
}

/// Build a figment that layers: defaults → config.toml → CODE_ROOM_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CODE_ROOM_ROOMS__CAPACITY=4`  →  `rooms.capacity = 4`
///   `CODE_ROOM_RUN__TIMEOUT_SECS=5`  →  `run.timeout_secs = 5`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CODE_ROOM_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Room behavior (runtime view).
#[derive(Clone, Debug)]
pub struct RoomConfig {
    pub capacity: usize,
    pub grace_period: Duration,
    pub handshake_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub command_queue_capacity: usize,
    pub max_document_bytes: usize,
    pub default_language: String,
}

impl RoomConfig {
    pub fn from_file(fc: &RoomsFileConfig) -> Self {
        Self {
            capacity: fc.capacity,
            grace_period: Duration::from_secs(fc.grace_period_secs),
            handshake_timeout: Duration::from_secs(fc.handshake_timeout_secs),
            outbound_queue_capacity: fc.outbound_queue_capacity,
            command_queue_capacity: fc.command_queue_capacity,
            max_document_bytes: fc.max_document_kb.saturating_mul(1024),
            default_language: fc.default_language.clone(),
        }
    }
}

/// Execution behavior (runtime view).
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub sandbox_prefix: Vec<String>,
    pub languages: BTreeMap<String, Toolchain>,
}

impl RunConfig {
    pub fn from_file(fc: &RunFileConfig) -> Self {
        Self {
            timeout: Duration::from_secs(fc.timeout_secs),
            max_output_bytes: fc.max_output_kb.saturating_mul(1024),
            sandbox_prefix: fc.sandbox_prefix.clone(),
            languages: fc.languages.clone(),
        }
    }

    pub fn toolchain(&self, language: &str) -> Option<&Toolchain> {
        self.languages.get(language)
    }
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct CodeRoomConfig {
    pub data_dir: PathBuf,
}

impl CodeRoomConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".code-room"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_rooms_file_config_defaults() {
        let d = RoomsFileConfig::default();
        assert_eq!(d.capacity, 2);
        assert_eq!(d.grace_period_secs, 30);
        assert_eq!(d.handshake_timeout_secs, 10);
        assert_eq!(d.outbound_queue_capacity, 256);
        assert_eq!(d.max_document_kb, 1024);
        assert_eq!(d.default_language, "python");
    }

    #[test]
    fn test_run_file_config_defaults() {
        let d = RunFileConfig::default();
        assert_eq!(d.timeout_secs, 10);
        assert!(d.sandbox_prefix.is_empty());
        let languages: Vec<_> = d.languages.keys().cloned().collect();
        assert_eq!(languages, vec!["cpp", "java", "python"]);
    }

    #[test]
    fn test_defaults_validate() {
        FileConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut fc = FileConfig::default();
        fc.rooms.capacity = 0;
        assert!(fc.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_escaping_source_file() {
        let mut fc = FileConfig::default();
        fc.run
            .languages
            .insert("evil".into(), Toolchain::new("../x.sh", ["sh", "x.sh"]));
        let err = fc.validate().unwrap_err().to_string();
        assert!(err.contains("run.languages.evil"));
    }

    #[test]
    fn test_validate_rejects_instant_handshake() {
        let mut fc = FileConfig::default();
        fc.rooms.handshake_timeout_secs = 0;
        let err = fc.validate().unwrap_err().to_string();
        assert!(err.contains("rooms.handshake_timeout_secs"));
    }

    #[test]
    fn test_validate_caps_durations() {
        let mut fc = FileConfig::default();
        fc.run.timeout_secs = u64::MAX;
        assert!(fc.validate().unwrap_err().to_string().contains("run.timeout_secs"));

        let mut fc = FileConfig::default();
        fc.rooms.grace_period_secs = u64::MAX;
        assert!(fc.validate().unwrap_err().to_string().contains("rooms.grace_period_secs"));

        let mut fc = FileConfig::default();
        fc.rooms.handshake_timeout_secs = MAX_DURATION_SECS + 1;
        assert!(fc.validate().is_err());

        // the bound itself is accepted and adds to an Instant without overflow
        let mut fc = FileConfig::default();
        fc.run.timeout_secs = MAX_DURATION_SECS;
        fc.rooms.grace_period_secs = MAX_DURATION_SECS;
        fc.validate().unwrap();
        let rc = RunConfig::from_file(&fc.run);
        let _ = tokio::time::Instant::now() + rc.timeout;
    }

    #[test]
    fn test_validate_caps_sizes() {
        let mut fc = FileConfig::default();
        fc.rooms.max_document_kb = usize::MAX;
        assert!(fc.validate().unwrap_err().to_string().contains("rooms.max_document_kb"));

        let mut fc = FileConfig::default();
        fc.run.max_output_kb = MAX_SIZE_KB + 1;
        assert!(fc.validate().unwrap_err().to_string().contains("run.max_output_kb"));

        let mut fc = FileConfig::default();
        fc.rooms.max_document_kb = MAX_SIZE_KB;
        fc.validate().unwrap();
    }

    #[test]
    fn test_size_conversion_saturates() {
        let fc = RoomsFileConfig {
            max_document_kb: usize::MAX,
            ..Default::default()
        };
        assert_eq!(RoomConfig::from_file(&fc).max_document_bytes, usize::MAX);
    }

    // ── runtime views ───────────────────────────────────────────────────

    #[test]
    fn test_room_config_from_file() {
        let fc = RoomsFileConfig {
            capacity: 5,
            grace_period_secs: 2,
            max_document_kb: 8,
            ..Default::default()
        };
        let rc = RoomConfig::from_file(&fc);
        assert_eq!(rc.capacity, 5);
        assert_eq!(rc.grace_period, Duration::from_secs(2));
        assert_eq!(rc.max_document_bytes, 8 * 1024);
    }

    #[test]
    fn test_run_config_toolchain_lookup() {
        let rc = RunConfig::from_file(&RunFileConfig::default());
        assert_eq!(rc.timeout, Duration::from_secs(10));
        assert_eq!(rc.max_output_bytes, 1024 * 1024);
        assert_eq!(rc.toolchain("python").unwrap().source_file, "main.py");
        assert!(rc.toolchain("markdown").is_none());
    }

    // ── CodeRoomConfig ──────────────────────────────────────────────────

    #[test]
    fn test_code_room_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("nested");
        let config = CodeRoomConfig::new(Some(nested.clone())).unwrap();
        assert_eq!(config.data_dir, nested);
        assert!(nested.exists());
        assert_eq!(config.config_toml_path(), nested.join("config.toml"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.rooms.capacity, 2);
        assert!(fc.questions.path.is_none());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[rooms]\ncapacity = 6\n\n[run]\ntimeout_secs = 3\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.rooms.capacity, 6);
        assert_eq!(fc.run.timeout_secs, 3);
        // untouched sections keep their defaults
        assert_eq!(fc.rooms.grace_period_secs, 30);
    }

    #[test]
    fn test_load_config_adds_toolchain() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[run.languages.ruby]\nsource_file = \"main.rb\"\ncommand = [\"ruby\", \"main.rb\"]\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert!(fc.run.languages.contains_key("ruby"));
        assert!(fc.run.languages.contains_key("python"));
    }
}
