//! Configuration of a complete streaming stack.

use std::path::Path;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use streamer_error::{StreamerError, StreamerResult, streamer_err};
use streamer_metrics::StreamerMetrics;

use crate::device::{FileDevice, FileDeviceConfig};
use crate::read_splitter::{ReadSplitter, ReadSplitterConfig};
use crate::stack::{StreamStackEntry, link_stages};

/// The stages of a stack, from head to device.
///
/// ```json
/// {
///     "read_splitter": { "max_read_size": 65536, "size_alignment": 4096 },
///     "device": { "worker_threads": 4 }
/// }
/// ```
///
/// Omitted options take their defaults. A `null` read splitter leaves reads unsplit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamerConfig {
    pub read_splitter: Option<ReadSplitterConfig>,
    pub device: FileDeviceConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            read_splitter: Some(ReadSplitterConfig::default()),
            device: FileDeviceConfig::default(),
        }
    }
}

impl StreamerConfig {
    pub fn from_json(json: &str) -> StreamerResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> StreamerResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| StreamerError::from(err).with_context(format!("reading {}", path.display())))?;
        Self::from_json(&json).map_err(|err| err.with_context(format!("loading {}", path.display())))
    }

    pub fn validate(&self) -> StreamerResult<()> {
        if let Some(read_splitter) = &self.read_splitter {
            read_splitter.validate()?;
        }
        self.device.validate()
    }

    /// Memory alignment that avoids realignment of reads by the stack.
    pub fn preferred_alignment(&self) -> u64 {
        self.read_splitter
            .as_ref()
            .map_or(1, |read_splitter| read_splitter.memory_alignment)
    }

    /// Construct the stages and link them, returning the head of the stack.
    pub fn build_stack(&self, metrics: &StreamerMetrics) -> StreamerResult<Rc<dyn StreamStackEntry>> {
        let mut stages: Vec<Rc<dyn StreamStackEntry>> = Vec::with_capacity(2);
        if let Some(read_splitter) = &self.read_splitter {
            stages.push(Rc::new(ReadSplitter::new(read_splitter, metrics)?));
        }
        stages.push(Rc::new(FileDevice::new(self.device.clone(), metrics)?));

        let names = stages.iter().map(|stage| stage.name()).collect::<Vec<_>>();
        log::debug!("building streamer stack: {}", names.join(" -> "));

        link_stages(stages).ok_or_else(|| streamer_err!(InvalidConfiguration: "empty stack"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use streamer_error::StreamerError;
    use streamer_metrics::StreamerMetrics;
    use tempfile::NamedTempFile;

    use crate::config::StreamerConfig;

    #[test]
    fn defaults_fill_missing_options() {
        let config = StreamerConfig::from_json(
            r#"{ "read_splitter": { "max_read_size": 65536 }, "device": { "worker_threads": 4 } }"#,
        )
        .unwrap();
        let read_splitter = config.read_splitter.unwrap();
        assert_eq!(read_splitter.max_read_size, 65536);
        assert_eq!(read_splitter.buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.device.worker_threads, 4);
        assert_eq!(config.device.max_in_flight_reads, 8);
    }

    #[test]
    fn null_splitter_builds_device_only() {
        let config = StreamerConfig::from_json(r#"{ "read_splitter": null }"#).unwrap();
        assert_eq!(config.preferred_alignment(), 1);
        let head = config.build_stack(&StreamerMetrics::default()).unwrap();
        assert_eq!(head.name(), "file_device");
    }

    #[test]
    fn default_stack_starts_with_splitter() {
        let head = StreamerConfig::default()
            .build_stack(&StreamerMetrics::default())
            .unwrap();
        assert_eq!(head.name(), "read_splitter");
    }

    #[test]
    fn invalid_json_and_options() {
        assert!(matches!(
            StreamerConfig::from_json("{ not json"),
            Err(StreamerError::Json(_))
        ));
        assert!(matches!(
            StreamerConfig::from_json(r#"{ "read_splitter": { "size_alignment": 3 } }"#),
            Err(StreamerError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            StreamerConfig::from_json(r#"{ "device": { "max_in_flight_reads": 0 } }"#),
            Err(StreamerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "device": {{ "name": "ssd", "max_file_handles": 4 }} }}"#).unwrap();
        let config = StreamerConfig::from_path(file.path()).unwrap();
        assert_eq!(config.device.name, "ssd");
        assert_eq!(config.device.max_file_handles, 4);

        let err = StreamerConfig::from_path("/does/not/exist.json").unwrap_err();
        assert!(matches!(err.root_cause(), StreamerError::Io(_)));
    }
}
