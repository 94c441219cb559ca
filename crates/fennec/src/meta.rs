//! Channel descriptor persistence: `meta.json` in each channel directory.

use crate::channel::Channel;
use crate::error::{FennecError, Result};
use std::fs;
use std::path::Path;

/// File name of the descriptor inside a channel directory.
pub const META_FILE: &str = "meta.json";

/// Reads the descriptor stored in `dir`, or writes `fallback` there when the
/// directory holds none yet. A numeric channel directory without a readable
/// descriptor is a validation failure: the engine refuses to open it.
pub fn read_or_create(dir: &Path, fallback: Option<&Channel>) -> Result<Channel> {
    let path = dir.join(META_FILE);
    if path.exists() {
        let content = fs::read_to_string(&path)?;
        let ch: Channel = serde_json::from_str(&content).map_err(|e| {
            FennecError::Validation(format!("corrupt channel descriptor at {path:?}: {e}"))
        })?;
        return Ok(ch);
    }
    match fallback {
        Some(ch) => {
            create(dir, ch)?;
            Ok(ch.clone())
        }
        None => Err(FennecError::Validation(format!(
            "channel directory {dir:?} is missing {META_FILE}"
        ))),
    }
}

/// Writes (or rewrites) the descriptor for `ch` into `dir`.
pub fn create(dir: &Path, ch: &Channel) -> Result<()> {
    fs::create_dir_all(dir)?;
    let content = serde_json::to_string_pretty(ch)
        .map_err(|e| FennecError::Validation(format!("cannot encode channel descriptor: {e}")))?;
    fs::write(dir.join(META_FILE), content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKey;
    use crate::telem::DataType;
    use tempfile::TempDir;

    #[test]
    fn test_read_or_create_round_trip() {
        let dir = TempDir::new().unwrap();
        let ch = Channel {
            key: ChannelKey(7),
            name: "pressure".into(),
            data_type: DataType::Float32,
            rate: 25.0,
            ..Default::default()
        };
        let created = read_or_create(dir.path(), Some(&ch)).unwrap();
        assert_eq!(created, ch);

        // A second read ignores the fallback and returns the stored copy.
        let reread = read_or_create(dir.path(), None).unwrap();
        assert_eq!(reread, ch);
    }

    #[test]
    fn test_missing_meta_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let err = read_or_create(dir.path(), None).unwrap_err();
        assert!(matches!(err, FennecError::Validation(_)));
    }
}
