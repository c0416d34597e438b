use parking_lot::RwLock;
use serde_derive::Serialize;
use std::sync::Arc;

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::source::{FrameSource, SourceDescriptor};
use crate::stream::{SourceStats, StreamBuffer};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RegistryStats {
    pub total_sources: usize,
    pub active_sources: usize,
    pub healthy_sources: usize,
    pub sources: Vec<SourceStats>,
}

/// Source id to stream buffer mapping; sources can be added and removed at runtime.
pub struct SourceRegistry {
    config: StreamConfig,
    streams: RwLock<Vec<Arc<StreamBuffer>>>,
}

impl SourceRegistry {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(Vec::new()),
        }
    }

    /// Registers a source without starting it.
    pub fn add(&self, descriptor: SourceDescriptor, source: Box<dyn FrameSource>) -> Result<()> {
        let mut streams = self.streams.write();

        if streams.iter().any(|s| s.id() == descriptor.id) {
            return Err(Error::DuplicateSource(descriptor.id));
        }

        tracing::info!(source_id = %descriptor.id, name = %descriptor.name, kind = ?descriptor.kind, "Added source");
        streams.push(Arc::new(StreamBuffer::new(descriptor, source, self.config)));
        Ok(())
    }

    /// Registers and starts a source. A source that fails to open is not kept.
    pub fn add_and_start(
        &self,
        descriptor: SourceDescriptor,
        source: Box<dyn FrameSource>,
    ) -> Result<()> {
        let id = descriptor.id.clone();
        self.add(descriptor, source)?;

        if let Err(err) = self.start(&id) {
            self.streams.write().retain(|s| s.id() != id);
            return Err(err);
        }

        Ok(())
    }

    pub fn start(&self, source_id: &str) -> Result<()> {
        self.get(source_id)
            .ok_or_else(|| Error::UnknownSource(source_id.to_string()))?
            .start()
    }

    /// Starts every registered source, returning the ids that failed.
    pub fn start_all(&self) -> Vec<(String, Error)> {
        self.snapshot()
            .into_iter()
            .filter(|s| !s.is_running())
            .filter_map(|s| s.start().err().map(|e| (s.id().to_string(), e)))
            .collect()
    }

    /// Stops and removes the source.
    pub fn remove(&self, source_id: &str) -> Result<()> {
        let stream = {
            let mut streams = self.streams.write();
            let idx = streams
                .iter()
                .position(|s| s.id() == source_id)
                .ok_or_else(|| Error::UnknownSource(source_id.to_string()))?;

            streams.remove(idx)
        };

        stream.stop();
        tracing::info!(source_id, "Removed source");
        Ok(())
    }

    pub fn stop_all(&self) {
        for stream in self.snapshot() {
            stream.stop();
        }
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<StreamBuffer>> {
        self.streams
            .read()
            .iter()
            .find(|s| s.id() == source_id)
            .cloned()
    }

    pub fn latest_frame(&self, source_id: &str) -> Option<Frame> {
        self.get(source_id).and_then(|s| s.latest_frame())
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.get(source_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.streams
            .read()
            .iter()
            .map(|s| s.descriptor().clone())
            .collect()
    }

    /// Ids of running sources, in registration order.
    pub fn active_sources(&self) -> Vec<String> {
        self.streams
            .read()
            .iter()
            .filter(|s| s.is_running())
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn source_stats(&self, source_id: &str) -> Option<SourceStats> {
        self.get(source_id).map(|s| s.stats())
    }

    pub fn statistics(&self) -> RegistryStats {
        let sources: Vec<SourceStats> = self.snapshot().iter().map(|s| s.stats()).collect();

        RegistryStats {
            total_sources: sources.len(),
            active_sources: sources.iter().filter(|s| s.running).count(),
            healthy_sources: sources.iter().filter(|s| s.healthy).count(),
            sources,
        }
    }

    fn snapshot(&self) -> Vec<Arc<StreamBuffer>> {
        self.streams.read().clone()
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceKind, SubmittedSource};
    use crate::stream::tests::ScriptedSource;
    use image::RgbImage;
    use std::time::{Duration, Instant};

    fn config() -> StreamConfig {
        StreamConfig {
            retry_backoff: Duration::from_millis(5),
            reconnect_backoff: Duration::from_millis(5),
            ..StreamConfig::default()
        }
    }

    fn descriptor(id: &str) -> SourceDescriptor {
        SourceDescriptor::new(id, id.to_uppercase(), SourceKind::Submitted)
    }

    #[test]
    fn add_start_and_remove() {
        let registry = SourceRegistry::new(config());
        let (source, submitter) = SubmittedSource::new("web", 4);
        let source = source.with_poll_interval(Duration::from_millis(5));

        registry.add_and_start(descriptor("web"), Box::new(source)).unwrap();
        registry
            .add(descriptor("idle"), Box::new(ScriptedSource::frames(0, 1, 1)))
            .unwrap();

        assert!(matches!(
            registry.add(descriptor("web"), Box::new(ScriptedSource::frames(0, 1, 1))),
            Err(Error::DuplicateSource(_))
        ));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_sources(), vec!["web"]);

        assert!(submitter.submit(RgbImage::new(32, 24)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.latest_frame("web").is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(registry.latest_frame("web").unwrap().dims(), (32, 24));

        let stats = registry.statistics();
        assert_eq!(stats.total_sources, 2);
        assert_eq!(stats.active_sources, 1);
        assert_eq!(stats.healthy_sources, 1);
        assert_eq!(registry.source_stats("web").unwrap().frame_count, 1);

        registry.remove("web").unwrap();
        assert!(!registry.contains("web"));
        assert!(matches!(registry.remove("web"), Err(Error::UnknownSource(_))));
    }

    #[test]
    fn failing_source_is_not_kept() {
        let registry = SourceRegistry::new(config());
        let mut source = ScriptedSource::frames(0, 1, 1);
        source.fail_open = true;

        assert!(registry.add_and_start(descriptor("cam0"), Box::new(source)).is_err());
        assert!(registry.is_empty());
        assert!(matches!(registry.start("cam0"), Err(Error::UnknownSource(_))));
    }

    #[test]
    fn start_all_reports_failures() {
        let registry = SourceRegistry::new(config());
        let mut broken = ScriptedSource::frames(0, 1, 1);
        broken.fail_open = true;

        registry.add(descriptor("ok"), Box::new(ScriptedSource::frames(3, 4, 4))).unwrap();
        registry.add(descriptor("broken"), Box::new(broken)).unwrap();

        let failed = registry.start_all();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "broken");
        assert_eq!(registry.active_sources(), vec!["ok"]);

        registry.stop_all();
        assert!(registry.active_sources().is_empty());
    }
}
