//! MQTT topic matching and Sparkplug topic codec

use std::fmt;
use std::str::FromStr;

use crate::error::AcqError;

/// Match a topic against a filter with `+`/`#` wildcards
///
/// `+` matches exactly one level; `#` matches the remainder (including
/// the parent level itself) and is only legal as the trailing segment.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            // "a/#" also matches "a"
            (Some("#"), None) => return true,
            _ => return false,
        }
    }
}

/// Sparkplug topic namespace prefix
pub const SPARKPLUG_NAMESPACE: &str = "spBv1.0";

/// Sparkplug message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparkplugMessageKind {
    NBirth,
    DBirth,
    NData,
    DData,
    NDeath,
    DDeath,
    NCmd,
    DCmd,
}

impl SparkplugMessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SparkplugMessageKind::NBirth => "NBIRTH",
            SparkplugMessageKind::DBirth => "DBIRTH",
            SparkplugMessageKind::NData => "NDATA",
            SparkplugMessageKind::DData => "DDATA",
            SparkplugMessageKind::NDeath => "NDEATH",
            SparkplugMessageKind::DDeath => "DDEATH",
            SparkplugMessageKind::NCmd => "NCMD",
            SparkplugMessageKind::DCmd => "DCMD",
        }
    }

    pub fn is_birth(self) -> bool {
        matches!(self, SparkplugMessageKind::NBirth | SparkplugMessageKind::DBirth)
    }

    pub fn is_data(self) -> bool {
        matches!(self, SparkplugMessageKind::NData | SparkplugMessageKind::DData)
    }

    pub fn is_death(self) -> bool {
        matches!(self, SparkplugMessageKind::NDeath | SparkplugMessageKind::DDeath)
    }
}

impl FromStr for SparkplugMessageKind {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NBIRTH" => Ok(SparkplugMessageKind::NBirth),
            "DBIRTH" => Ok(SparkplugMessageKind::DBirth),
            "NDATA" => Ok(SparkplugMessageKind::NData),
            "DDATA" => Ok(SparkplugMessageKind::DData),
            "NDEATH" => Ok(SparkplugMessageKind::NDeath),
            "DDEATH" => Ok(SparkplugMessageKind::DDeath),
            "NCMD" => Ok(SparkplugMessageKind::NCmd),
            "DCMD" => Ok(SparkplugMessageKind::DCmd),
            other => Err(AcqError::protocol(format!(
                "Unknown Sparkplug message kind '{}'",
                other
            ))),
        }
    }
}

/// A parsed Sparkplug topic: `spBv1.0/<group>/<kind>/<node>[/<device>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparkplugTopic {
    pub group_id: String,
    pub kind: SparkplugMessageKind,
    pub edge_node_id: String,
    pub device_id: Option<String>,
}

impl SparkplugTopic {
    pub fn new(
        group_id: impl Into<String>,
        kind: SparkplugMessageKind,
        edge_node_id: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            kind,
            edge_node_id: edge_node_id.into(),
            device_id,
        }
    }

    pub fn parse(topic: &str) -> Result<Self, AcqError> {
        let mut parts = topic.split('/');
        let bad = || AcqError::protocol(format!("Not a Sparkplug topic: {}", topic));
        if parts.next() != Some(SPARKPLUG_NAMESPACE) {
            return Err(bad());
        }
        let group_id = parts.next().ok_or_else(bad)?.to_string();
        let kind: SparkplugMessageKind = parts.next().ok_or_else(bad)?.parse()?;
        let edge_node_id = parts.next().ok_or_else(bad)?.to_string();
        let device_id = parts.next().map(|s| s.to_string());
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            group_id,
            kind,
            edge_node_id,
            device_id,
        })
    }
}

impl fmt::Display for SparkplugTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            SPARKPLUG_NAMESPACE,
            self.group_id,
            self.kind.as_str(),
            self.edge_node_id
        )?;
        if let Some(device) = &self.device_id {
            write!(f, "/{}", device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_match_laws() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c/d"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/+", "a/b/c"));
    }

    #[test]
    fn test_topic_match_exact_and_edge_cases() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/c"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("+/+", "a/b"));
        assert!(!topic_matches("+", "a/b"));
    }

    #[test]
    fn test_sparkplug_topic_parse() {
        let topic = SparkplugTopic::parse("spBv1.0/groupA/NBIRTH/node1").unwrap();
        assert_eq!(topic.group_id, "groupA");
        assert_eq!(topic.kind, SparkplugMessageKind::NBirth);
        assert_eq!(topic.edge_node_id, "node1");
        assert!(topic.device_id.is_none());

        let topic = SparkplugTopic::parse("spBv1.0/g/DDATA/n/dev7").unwrap();
        assert_eq!(topic.kind, SparkplugMessageKind::DData);
        assert_eq!(topic.device_id.as_deref(), Some("dev7"));
    }

    #[test]
    fn test_sparkplug_topic_rejects() {
        assert!(SparkplugTopic::parse("spAv1.0/g/NDATA/n").is_err());
        assert!(SparkplugTopic::parse("spBv1.0/g/NOPE/n").is_err());
        assert!(SparkplugTopic::parse("spBv1.0/g/NDATA").is_err());
        assert!(SparkplugTopic::parse("spBv1.0/g/NDATA/n/d/extra").is_err());
    }

    #[test]
    fn test_sparkplug_topic_format() {
        let topic = SparkplugTopic::new("groupA", SparkplugMessageKind::NData, "node1", None);
        assert_eq!(topic.to_string(), "spBv1.0/groupA/NDATA/node1");

        let topic = SparkplugTopic::new(
            "g",
            SparkplugMessageKind::DBirth,
            "n",
            Some("dev".to_string()),
        );
        assert_eq!(topic.to_string(), "spBv1.0/g/DBIRTH/n/dev");
    }

    #[test]
    fn test_parse_format_round_trip() {
        for text in [
            "spBv1.0/plant/NBIRTH/edge-1",
            "spBv1.0/plant/DDEATH/edge-1/cell-2",
            "spBv1.0/x/NCMD/y",
        ] {
            let topic = SparkplugTopic::parse(text).unwrap();
            assert_eq!(topic.to_string(), text);
        }
    }
}
