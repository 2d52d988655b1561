use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Where to start partitions that have no committed position in the consumer group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(format!("unknown offset reset policy '{other}'")),
        }
    }
}

/// Explicit offsets to assign partitions at, bypassing the group's committed positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOffsets {
    /// Every partition of the topic starts at the same offset
    AllPartitions(i64),
    /// Only the listed partitions are consumed
    Partitions(BTreeMap<i32, i64>),
}

impl StartOffsets {
    pub fn for_partition(&self, partition: i32) -> Option<i64> {
        match self {
            StartOffsets::AllPartitions(offset) => Some(*offset),
            StartOffsets::Partitions(offsets) => offsets.get(&partition).copied(),
        }
    }
}

/// Accepts `N` or a `partition:offset` list such as `0:100,1:250`.
impl FromStr for StartOffsets {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty start offsets".to_string());
        }

        if !s.contains(':') {
            return parse_offset(s).map(StartOffsets::AllPartitions);
        }

        let mut offsets = BTreeMap::new();
        for entry in s.split(',') {
            let (partition, offset) = entry
                .trim()
                .split_once(':')
                .ok_or_else(|| format!("expected partition:offset, got '{entry}'"))?;
            let partition = partition
                .trim()
                .parse::<i32>()
                .ok()
                .filter(|p| *p >= 0)
                .ok_or_else(|| format!("invalid partition '{partition}'"))?;
            if offsets.insert(partition, parse_offset(offset)?).is_some() {
                return Err(format!("partition {partition} listed twice"));
            }
        }
        Ok(StartOffsets::Partitions(offsets))
    }
}

fn parse_offset(s: &str) -> Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .ok()
        .filter(|offset| *offset >= 0)
        .ok_or_else(|| format!("invalid offset '{s}'"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// Subscribe to the topic and resume from the group's committed positions
    Subscribe(OffsetReset),
    /// Assign partitions directly at explicit offsets
    Assign(StartOffsets),
}
