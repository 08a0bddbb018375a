use std::collections::BTreeMap;
use std::time::Duration;

use run_sandbox::Toolchain;

use crate::AppState;
use crate::config::{RoomConfig, RoomsFileConfig, RunConfig, RunFileConfig};
use crate::questions::QuestionBank;

/// Run settings with a single `shell` language so run tests only need `sh`.
pub fn test_run_config() -> RunConfig {
    let mut run_config = RunConfig::from_file(&RunFileConfig::default());
    run_config.languages = BTreeMap::from([(
        "shell".to_string(),
        Toolchain::new("main.sh", ["sh", "main.sh"]),
    )]);
    run_config.timeout = Duration::from_secs(5);
    run_config
}

pub fn test_room_config() -> RoomConfig {
    RoomConfig::from_file(&RoomsFileConfig::default())
}

/// Build a fully-wired `AppState` with default room settings, the `shell`
/// toolchain and an empty question bank.
pub fn test_app_state() -> AppState {
    AppState::new(test_room_config(), test_run_config(), QuestionBank::default())
}
