//! Authoritative document state and edit reconciliation.
//!
//! An edit is accepted only when it was made against the current version.
//! There is no transform of stale edits: the sender gets `version_mismatch`
//! and a fresh snapshot, and retries from there.

use crate::error::SessionError;
use crate::ws::protocol::{DocSnapshot, Edit};

#[derive(Debug, Clone)]
pub struct Document {
    text: String,
    version: u64,
    max_bytes: usize,
}

impl Document {
    pub fn new(max_bytes: usize) -> Self {
        Self::with_text(String::new(), max_bytes)
    }

    pub fn with_text(text: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            text: text.into(),
            version: 0,
            max_bytes,
        }
    }

    #[cfg(test)]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            text: self.text.clone(),
            version: self.version,
        }
    }

    /// Validate `edit` against the current state and apply it.
    ///
    /// On any error the document is left untouched.
    pub fn try_apply(&mut self, edit: &Edit) -> Result<DocSnapshot, SessionError> {
        if edit.base_version != self.version {
            return Err(SessionError::VersionMismatch {
                base: edit.base_version,
                current: self.version,
            });
        }

        let len = self.text.chars().count();
        if edit.range_start > edit.range_end || edit.range_end > len {
            return Err(SessionError::InvalidEdit {
                start: edit.range_start,
                end: edit.range_end,
                len,
            });
        }

        let start = byte_offset(&self.text, edit.range_start);
        let end = byte_offset(&self.text, edit.range_end);

        let size = self.text.len() - (end - start) + edit.text.len();
        if size > self.max_bytes {
            return Err(SessionError::DocumentTooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        self.text.replace_range(start..end, &edit.text);
        self.version += 1;
        Ok(self.snapshot())
    }
}

/// Byte index of the `chars`-th character; the end of the string when
/// `chars` equals the character count.
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}
