//! Subscription and static partition assignment.
//!
//! A node either subscribes to topics through the consumer group (named
//! topics or a pattern) or explicitly owns a fixed set of partitions of the
//! named topics. Explicit ownership is declared for every cooperating host as
//! `host-a=0,1;host-b=2,3` and the same partition ids apply to each topic.
//!
//! Completeness across hosts is only checked arithmetically against the
//! partition count the cluster reports. That every host runs with the same
//! declaration is a deployment concern.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regex::Regex;
use tracing::info;

use crate::error::ConsumerError;
use crate::kafka::types::Partition;

/// What a pooled connection subscribes to. Fixed at pool construction.
#[derive(Debug, Clone)]
pub enum Subscription {
    ExplicitTopics(BTreeSet<String>),
    TopicPattern(Regex),
    ExplicitPartitions(BTreeMap<String, BTreeSet<i32>>),
}

impl Subscription {
    /// Topic names this subscription refers to by name. Empty for a pattern.
    pub fn topic_names(&self) -> Vec<String> {
        match self {
            Self::ExplicitTopics(topics) => topics.iter().cloned().collect(),
            Self::TopicPattern(_) => Vec::new(),
            Self::ExplicitPartitions(assignment) => assignment.keys().cloned().collect(),
        }
    }

    /// Every owned partition of an explicit assignment. Empty otherwise.
    pub fn owned_partitions(&self) -> Vec<Partition> {
        match self {
            Self::ExplicitPartitions(assignment) => assignment
                .iter()
                .flat_map(|(topic, partitions)| {
                    partitions.iter().map(|p| Partition::new(topic.as_str(), *p))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// An explicit assignment of just the given partitions.
    pub fn of_partitions<'a>(partitions: impl IntoIterator<Item = &'a Partition>) -> Self {
        let mut assignment: BTreeMap<String, BTreeSet<i32>> = BTreeMap::new();
        for partition in partitions {
            assignment
                .entry(partition.topic().to_owned())
                .or_default()
                .insert(partition.partition_number());
        }
        Self::ExplicitPartitions(assignment)
    }

    /// Patterns match from the start of the topic name, as the broker client
    /// applies them.
    pub fn matches(&self, topic: &str, partition: i32) -> bool {
        match self {
            Self::ExplicitTopics(topics) => topics.contains(topic),
            Self::TopicPattern(pattern) => pattern.find(topic).is_some_and(|m| m.start() == 0),
            Self::ExplicitPartitions(assignment) => assignment
                .get(topic)
                .is_some_and(|partitions| partitions.contains(&partition)),
        }
    }
}

/// How topics were configured, before any assignment is applied.
#[derive(Debug, Clone)]
pub enum TopicSelection {
    Names(BTreeSet<String>),
    Pattern(Regex),
}

impl TopicSelection {
    /// `topic_type` is `names` (comma separated list) or `pattern` (a regex).
    pub fn parse(topic_type: &str, topics: &str) -> Result<Self, ConsumerError> {
        match topic_type.trim().to_ascii_lowercase().as_str() {
            "names" => {
                let names: BTreeSet<String> = topics
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect();

                if names.is_empty() {
                    return Err(ConsumerError::configuration(
                        "at least one topic name is required",
                    ));
                }
                Ok(Self::Names(names))
            }
            "pattern" => {
                let pattern = Regex::new(&anchored(topics.trim())).map_err(|e| {
                    ConsumerError::configuration(format!("invalid topic pattern: {e}"))
                })?;
                Ok(Self::Pattern(pattern))
            }
            other => Err(ConsumerError::configuration(format!(
                "unknown topic type '{other}', expected 'names' or 'pattern'"
            ))),
        }
    }
}

/// librdkafka only treats a subscription as a regex when it starts with `^`.
pub(crate) fn anchored(pattern: &str) -> String {
    if pattern.starts_with('^') {
        pattern.to_owned()
    } else {
        format!("^{pattern}")
    }
}

/// Partition ownership declared for every cooperating host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticAssignment {
    hosts: BTreeMap<String, BTreeSet<i32>>,
}

impl StaticAssignment {
    /// Parses `host-a=0,1;host-b=2,3`. Blank input means no explicit assignment.
    pub fn parse(declaration: &str) -> Result<Option<Self>, ConsumerError> {
        let mut hosts: BTreeMap<String, BTreeSet<i32>> = BTreeMap::new();
        let mut seen: HashMap<i32, String> = HashMap::new();

        for entry in declaration.split(';').map(str::trim) {
            if entry.is_empty() {
                continue;
            }

            let (host, ids) = entry.split_once('=').ok_or_else(|| {
                ConsumerError::configuration(format!(
                    "partition assignment '{entry}' must look like host=0,1,2"
                ))
            })?;
            let host = host.trim();
            if host.is_empty() {
                return Err(ConsumerError::configuration(format!(
                    "partition assignment '{entry}' has no host name"
                )));
            }

            let owned = hosts.entry(host.to_owned()).or_default();
            for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
                let partition: i32 = id
                    .parse()
                    .ok()
                    .filter(|p: &i32| *p >= 0)
                    .ok_or_else(|| {
                        ConsumerError::configuration(format!(
                            "partition '{id}' assigned to host {host} is not a non-negative integer"
                        ))
                    })?;

                if let Some(other) = seen.insert(partition, host.to_owned()) {
                    return Err(ConsumerError::configuration(format!(
                        "partition {partition} is assigned to more than one host ({other} and {host})"
                    )));
                }
                owned.insert(partition);
            }
        }

        if hosts.is_empty() {
            return Ok(None);
        }

        let assignment = Self { hosts };
        assignment.validate_complete()?;
        Ok(Some(assignment))
    }

    // every partition from 0 up to the total must have an owner
    fn validate_complete(&self) -> Result<(), ConsumerError> {
        let total = self.total_partitions();
        let all: BTreeSet<i32> = self.hosts.values().flatten().copied().collect();
        for expected in 0..total as i32 {
            if !all.contains(&expected) {
                return Err(ConsumerError::configuration(format!(
                    "no host is assigned partition {expected}"
                )));
            }
        }
        Ok(())
    }

    pub fn total_partitions(&self) -> usize {
        self.hosts.values().map(BTreeSet::len).sum()
    }

    pub fn partitions_for_host(&self, host: &str) -> Option<&BTreeSet<i32>> {
        self.hosts.get(host)
    }
}

/// Derives the subscription this node must use and checks an explicit
/// assignment against the cluster's partition counts.
#[derive(Debug, Clone)]
pub struct PartitionAssignmentResolver {
    subscription: Subscription,
    assigned_total: Option<usize>,
}

impl PartitionAssignmentResolver {
    pub fn new(
        topics: TopicSelection,
        assignment: Option<StaticAssignment>,
        host: &str,
    ) -> Result<Self, ConsumerError> {
        let Some(assignment) = assignment else {
            let subscription = match topics {
                TopicSelection::Names(names) => Subscription::ExplicitTopics(names),
                TopicSelection::Pattern(pattern) => Subscription::TopicPattern(pattern),
            };
            return Ok(Self {
                subscription,
                assigned_total: None,
            });
        };

        let names = match topics {
            TopicSelection::Names(names) => names,
            TopicSelection::Pattern(_) => {
                return Err(ConsumerError::configuration(
                    "explicit partitions incompatible with pattern subscription",
                ))
            }
        };

        let owned = assignment.partitions_for_host(host).ok_or_else(|| {
            ConsumerError::configuration(format!(
                "explicit partition assignment does not name this host ({host})"
            ))
        })?;

        info!(
            host = host,
            partitions = ?owned,
            "Using explicit partition assignment"
        );

        let subscription = Subscription::ExplicitPartitions(
            names
                .into_iter()
                .map(|topic| (topic, owned.clone()))
                .collect(),
        );

        Ok(Self {
            subscription,
            assigned_total: Some(assignment.total_partitions()),
        })
    }

    /// The subscription implied by static configuration alone.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Whether `resolve` needs the cluster's partition counts.
    pub fn requires_partition_counts(&self) -> bool {
        self.assigned_total.is_some()
    }

    /// Topics whose partition counts `resolve` checks.
    pub fn topics_to_verify(&self) -> Vec<String> {
        if self.requires_partition_counts() {
            self.subscription.topic_names()
        } else {
            Vec::new()
        }
    }

    /// Validates the static assignment against the partition counts reported
    /// by the cluster and returns the subscription to use.
    ///
    /// A mismatch is not retried here; the caller backs off and resolves again
    /// on a later cycle.
    pub fn resolve(
        &self,
        cluster_partition_counts: &HashMap<String, usize>,
    ) -> Result<Subscription, ConsumerError> {
        let Some(assigned) = self.assigned_total else {
            return Ok(self.subscription.clone());
        };

        let mut counts = BTreeSet::new();
        for topic in self.subscription.topic_names() {
            let count = cluster_partition_counts.get(&topic).ok_or_else(|| {
                ConsumerError::configuration(format!(
                    "partition count mismatch: no partition count reported for topic {topic}"
                ))
            })?;
            counts.insert(*count);
        }

        if counts.len() > 1 {
            return Err(ConsumerError::configuration(format!(
                "partition count mismatch: topics have differing partition counts {counts:?}"
            )));
        }

        match counts.into_iter().next() {
            Some(count) if count == assigned => Ok(self.subscription.clone()),
            Some(count) => Err(ConsumerError::configuration(format!(
                "partition count mismatch: {assigned} partitions are statically assigned but the topics have {count} partitions"
            ))),
            None => Err(ConsumerError::configuration(
                "partition count mismatch: no topics to verify",
            )),
        }
    }
}
