use serde::{Deserialize, Serialize};

/// How to run source code for one language.
///
/// The code is written to `source_file` inside the job's scratch directory and
/// `command` is executed from that directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub source_file: String,
    pub command: Vec<String>,
}

impl Toolchain {
    pub fn new<I, S>(source_file: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_file: source_file.into(),
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    /// True when `source_file` is a bare file name.
    pub fn has_plain_source_file(&self) -> bool {
        let name = self.source_file.as_str();
        !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\')
    }
}
