use std::sync::Arc;

use regex::Regex;

use crate::pipeline::record::SinkRecord;

/// A single-record transformation. Returning `Ok(None)` filters the record out.
pub trait Transformation: Send + Sync {
    fn apply(&self, record: SinkRecord) -> anyhow::Result<Option<SinkRecord>>;
}

/// Ordered list of transformations; empty means identity.
#[derive(Clone, Default)]
pub struct TransformationChain {
    transformations: Vec<Arc<dyn Transformation>>,
}

impl TransformationChain {
    pub fn new(transformations: Vec<Arc<dyn Transformation>>) -> Self {
        Self { transformations }
    }

    pub fn is_empty(&self) -> bool {
        self.transformations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transformations.len()
    }

    pub fn apply(&self, record: SinkRecord) -> anyhow::Result<Option<SinkRecord>> {
        let mut current = record;
        for transformation in &self.transformations {
            match transformation.apply(current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

/// Prepends a fixed string to the record topic.
#[derive(Debug, Clone)]
pub struct TopicPrefix {
    prefix: String,
}

impl TopicPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Transformation for TopicPrefix {
    fn apply(&self, record: SinkRecord) -> anyhow::Result<Option<SinkRecord>> {
        let topic = format!("{}{}", self.prefix, record.topic);
        Ok(Some(record.with_topic(topic)))
    }
}

/// Rewrites topics matching the whole of `pattern` using `replacement`,
/// which may refer to capture groups (`$1`). Other topics pass through.
#[derive(Debug, Clone)]
pub struct RegexRouter {
    pattern: Regex,
    replacement: String,
}

impl RegexRouter {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("^(?:{pattern})$"))?,
            replacement: replacement.into(),
        })
    }
}

impl Transformation for RegexRouter {
    fn apply(&self, record: SinkRecord) -> anyhow::Result<Option<SinkRecord>> {
        if !self.pattern.is_match(&record.topic) {
            return Ok(Some(record));
        }
        let topic = self
            .pattern
            .replace(&record.topic, self.replacement.as_str())
            .into_owned();
        Ok(Some(record.with_topic(topic)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::types::TimestampType;
    use crate::pipeline::record::SchemaAndValue;

    fn record(topic: &str) -> SinkRecord {
        SinkRecord::new(
            topic,
            0,
            1,
            SchemaAndValue::null(),
            SchemaAndValue::null(),
            None,
            TimestampType::NoTimestampType,
            Vec::new(),
        )
    }

    struct DropAll;

    impl Transformation for DropAll {
        fn apply(&self, _record: SinkRecord) -> anyhow::Result<Option<SinkRecord>> {
            Ok(None)
        }
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = TransformationChain::default();
        let out = chain.apply(record("test")).unwrap().unwrap();
        assert_eq!(out, record("test"));
    }

    #[test]
    fn transformations_apply_in_order() {
        let chain = TransformationChain::new(vec![
            Arc::new(TopicPrefix::new("a_")),
            Arc::new(TopicPrefix::new("b_")),
        ]);
        let out = chain.apply(record("test")).unwrap().unwrap();
        assert_eq!(out.topic, "b_a_test");
        assert_eq!(out.original_topic(), "test");
    }

    #[test]
    fn filtered_record_stops_the_chain() {
        let chain = TransformationChain::new(vec![
            Arc::new(DropAll),
            Arc::new(TopicPrefix::new("never_")),
        ]);
        assert!(chain.apply(record("test")).unwrap().is_none());
    }

    #[test]
    fn regex_router_rewrites_whole_matches_only() {
        let router = RegexRouter::new(r"events-(\d+)", "archive-$1").unwrap();

        let routed = router.apply(record("events-7")).unwrap().unwrap();
        assert_eq!(routed.topic, "archive-7");

        let untouched = router.apply(record("my-events-7")).unwrap().unwrap();
        assert_eq!(untouched.topic, "my-events-7");
    }
}
