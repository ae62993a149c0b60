use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Offset;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
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

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Low/high bounds of currently retained offsets in a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub low: i64,
    pub high: i64,
}

impl Watermark {
    pub fn new(low: i64, high: i64) -> Self {
        Self { low, high }
    }

    /// Clamp an absolute offset into the retained range.
    pub fn clamp(&self, offset: i64) -> i64 {
        offset.clamp(self.low, self.high)
    }
}

/// A partition paired with its resolved starting position.
///
/// `Offset::Beginning` and `Offset::End` are the two sentinel positions
/// that bypass watermark clamping; everything else is an absolute
/// `Offset::Offset(v)` already clamped into `[low, high]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOffset {
    partition: Partition,
    offset: Offset,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: Offset) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }
}
