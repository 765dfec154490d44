#![deny(missing_docs)]
//! Metrics for the streamer stack.
//!
//! Every stack entry pulls its counters and timers out of one shared [`StreamerMetrics`]
//! registry. Metric names are namespaced per stage, e.g. `streamer.read_splitter.sub_reads`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

// re-export exposed metric types
pub use witchcraft_metrics::{Counter, Histogram, MetricId, Timer};
use witchcraft_metrics::{Metric, MetricRegistry, Metrics, MetricsIter};

/// A cloneable metric registry shared by all stages of a streamer stack.
#[derive(Clone, Default)]
pub struct StreamerMetrics {
    registry: Arc<MetricRegistry>,
    default_tags: Arc<DefaultTags>,
}

/// Default tags applied to every metric reported from a [`StreamerMetrics`] snapshot.
#[derive(Default)]
pub struct DefaultTags(BTreeMap<Cow<'static, str>, Cow<'static, str>>);

impl<K, V> From<&[(K, V)]> for DefaultTags
where
    K: Clone + Into<Cow<'static, str>>,
    V: Clone + Into<Cow<'static, str>>,
{
    fn from(pairs: &[(K, V)]) -> Self {
        DefaultTags(
            pairs
                .iter()
                .map(|(k, v)| (k.clone().into(), v.clone().into()))
                .collect(),
        )
    }
}

impl StreamerMetrics {
    /// Create an empty registry whose snapshots carry the given default tags.
    pub fn with_tags(default_tags: impl Into<DefaultTags>) -> Self {
        Self {
            registry: Arc::default(),
            default_tags: Arc::new(default_tags.into()),
        }
    }

    /// Returns a view of this registry that prefixes every metric name with
    /// `streamer.<stage>.`.
    pub fn stage(&self, stage: &str) -> StageMetrics {
        StageMetrics {
            metrics: self.clone(),
            prefix: format!("streamer.{stage}"),
        }
    }

    /// Returns the counter with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a counter.
    pub fn counter<T>(&self, id: T) -> Arc<Counter>
    where
        T: Into<MetricId>,
    {
        self.registry.counter(id)
    }

    /// Returns the histogram with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a histogram.
    pub fn histogram<T>(&self, id: T) -> Arc<Histogram>
    where
        T: Into<MetricId>,
    {
        self.registry.histogram(id)
    }

    /// Returns the timer with the specified ID, creating a default instance if absent.
    ///
    /// # Panics
    ///
    /// Panics if a metric is registered with the ID that is not a timer.
    pub fn timer<T>(&self, id: T) -> Arc<Timer>
    where
        T: Into<MetricId>,
    {
        self.registry.timer(id)
    }

    /// Returns a snapshot of the metrics in the registry.
    ///
    /// Later modifications to the registry do not affect the returned snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot<'_> {
        MetricsSnapshot {
            snapshot: self.registry.metrics(),
            default_tags: &self.default_tags,
        }
    }
}

/// The metrics of a single stack entry, all named `streamer.<stage>.<name>`.
#[derive(Clone)]
pub struct StageMetrics {
    metrics: StreamerMetrics,
    prefix: String,
}

impl StageMetrics {
    fn id(&self, name: &str) -> MetricId {
        MetricId::new(format!("{}.{name}", self.prefix))
    }

    /// Returns the stage counter with the given name.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.metrics.counter(self.id(name))
    }

    /// Returns the stage histogram with the given name.
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        self.metrics.histogram(self.id(name))
    }

    /// Returns the stage timer with the given name.
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        self.metrics.timer(self.id(name))
    }
}

/// A snapshot of the metrics in a registry with default tags.
pub struct MetricsSnapshot<'a> {
    snapshot: Metrics,
    default_tags: &'a DefaultTags,
}

impl MetricsSnapshot<'_> {
    /// Create an iterator over the metrics snapshot.
    pub fn iter(&self) -> StreamerMetricsIter<'_> {
        StreamerMetricsIter {
            iter: self.snapshot.iter(),
            default_tags: self.default_tags,
        }
    }
}

/// Metrics iterator that applies the default tags to each metric in the inner iterator.
pub struct StreamerMetricsIter<'a> {
    iter: MetricsIter<'a>,
    default_tags: &'a DefaultTags,
}

impl<'a> Iterator for StreamerMetricsIter<'a> {
    type Item = (MetricId, &'a Metric);

    #[inline]
    fn next(&mut self) -> Option<(MetricId, &'a Metric)> {
        self.iter.next().map(|(k, v)| {
            let mut metric_id = k.clone();
            for (tag_key, tag_value) in self.default_tags.0.iter() {
                metric_id = metric_id.with_tag(tag_key.clone(), tag_value.clone())
            }

            (metric_id, v)
        })
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}
