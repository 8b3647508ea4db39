//! NewType wrappers for the identifiers that travel between the submitter,
//! the bus, the dispatcher and the metadata store.
//!
//! Runs, scripts and blobs are all addressed by plain strings on the wire.
//! Wrapping them keeps a script id from being passed where a blob key is
//! expected (the dispatcher resolves one into the other).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ValidationError;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// Identifier of a single submitted job and its tracked outcome.
    ///
    /// Minted fresh (UUID v4) on every submission, so resubmitting the same
    /// script always produces an independent run.
    RunId
);

newtype_string!(
    /// Identifier of an uploaded script record.
    ///
    /// This is what `script_key` carries in a job payload. It is resolved to a
    /// [`BlobKey`] through the metadata store, never used as a blob path.
    ScriptId
);

newtype_string!(
    /// Key of an object in the blob store bucket (e.g. `scripts/<id>/train.py`).
    BlobKey
);

impl RunId {
    /// Mint a fresh random run id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ScriptId {
    /// Mint a fresh random script id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl BlobKey {
    /// Key under which a script body is uploaded.
    pub fn for_script(script_id: &ScriptId, file_name: &str) -> Self {
        Self(format!("scripts/{}/{}", script_id, file_name))
    }

    /// Key under which a run's weights file is uploaded.
    pub fn for_weights(run_id: &RunId, file_name: &str) -> Self {
        Self(format!("weights/{}/{}", run_id, file_name))
    }
}

/// Separator used when a tag set is persisted as a single string.
pub const TAG_DELIMITER: char = ',';

/// Unordered set of short run labels.
///
/// Stored as one delimited string, so a tag may not contain the delimiter
/// itself. The constructor is the only way in and enforces that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Tags(BTreeSet<String>);

impl Tags {
    pub fn new<I, S>(tags: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for tag in tags {
            let tag = tag.into();
            let trimmed = tag.trim();
            if trimmed.is_empty() || trimmed.contains(TAG_DELIMITER) {
                return Err(ValidationError::InvalidTag(tag));
            }
            set.insert(trimmed.to_string());
        }
        Ok(Self(set))
    }

    /// Parse the persisted form. Empty segments are skipped.
    pub fn split(joined: &str) -> Self {
        Self(
            joined
                .split(TAG_DELIMITER)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Persisted form; `None` for an empty set.
    pub fn join(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(&TAG_DELIMITER.to_string()),
        )
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_generate_is_uuid() {
        let id = RunId::generate();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
        assert_ne!(id, RunId::generate());
    }

    #[test]
    fn test_script_id_serde() {
        let id = ScriptId::new("abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc\"");

        let parsed: ScriptId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_blob_key_layout() {
        let script = ScriptId::new("s1");
        assert_eq!(
            BlobKey::for_script(&script, "train.py").as_str(),
            "scripts/s1/train.py"
        );

        let run = RunId::new("r1");
        assert_eq!(
            BlobKey::for_weights(&run, "model.h5").as_str(),
            "weights/r1/model.h5"
        );
    }

    #[test]
    fn test_tags_join_and_split() {
        let tags = Tags::new(["test", "baseline", "test"]).unwrap();
        assert_eq!(tags.len(), 2);

        let joined = tags.join().unwrap();
        assert_eq!(joined, "baseline,test");
        assert_eq!(Tags::split(&joined), tags);
    }

    #[test]
    fn test_tags_reject_delimiter() {
        let err = Tags::new(["ok", "not,ok"]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTag(t) if t == "not,ok"));
    }

    #[test]
    fn test_tags_reject_blank() {
        assert!(Tags::new(["  "]).is_err());
    }

    #[test]
    fn test_empty_tags_have_no_persisted_form() {
        assert_eq!(Tags::default().join(), None);
        assert!(Tags::split("").is_empty());
        assert!(Tags::split(",,").is_empty());
    }
}
