//! Channel and aggregate bookkeeping.
//!
//! Every channel keeps its explicit subscribers plus two computed sets:
//! the subscribers it effectively delivers to (its own plus those of every
//! aggregate containing it) and the channels an update on it belongs to
//! (itself plus those aggregates). Computed sets are rebuilt in full after
//! every mutation, so they never lag the aggregate graph.

use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// One named fan-out group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    name: String,
    subscribers: BTreeSet<String>,
    computed_subscribers: BTreeSet<String>,
    computed_channels: BTreeSet<String>,
}

impl Channel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: BTreeSet::new(),
            computed_subscribers: BTreeSet::new(),
            computed_channels: BTreeSet::from([name.to_string()]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribers that joined this channel directly.
    pub fn subscribers(&self) -> &BTreeSet<String> {
        &self.subscribers
    }

    /// Subscribers receiving updates published on this channel.
    pub fn computed_subscribers(&self) -> &BTreeSet<String> {
        &self.computed_subscribers
    }

    /// This channel and every aggregate that includes it.
    pub fn computed_channels(&self) -> &BTreeSet<String> {
        &self.computed_channels
    }
}

/// Channels, aggregate definitions and the owning broker's identity.
///
/// The identity is never a computed subscriber, so a broker subscribed to
/// its own channels through a federation loop does not deliver to itself.
#[derive(Debug, Clone)]
pub struct ChannelTable {
    identity: String,
    channels: BTreeMap<String, Channel>,
    aggregates: BTreeMap<String, BTreeSet<String>>,
}

impl ChannelTable {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            channels: BTreeMap::new(),
            aggregates: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Create `name` if absent; returns whether it was created.
    pub fn add_channel(&mut self, name: &str) -> bool {
        if self.channels.contains_key(name) {
            return false;
        }
        self.channels.insert(name.to_string(), Channel::new(name));
        true
    }

    pub fn add_channels<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.add_channel(name.as_ref());
        }
    }

    /// All channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Aggregate definitions as given, not expanded.
    pub fn aggregates(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.aggregates
    }

    /// Define (or redefine) `name` as the union of `constituents`.
    ///
    /// The aggregate and its direct constituents are created as channels.
    pub fn aggregate<I, S>(&mut self, name: &str, constituents: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let members: BTreeSet<String> = constituents
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .collect();
        self.add_channel(name);
        self.add_channels(&members);
        self.aggregates.insert(name.to_string(), members);
        self.recompute();
    }

    /// Drop an aggregate definition; the channel itself stays.
    pub fn deaggregate(&mut self, name: &str) -> bool {
        let removed = self.aggregates.remove(name).is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    /// Transitive constituents of an aggregate.
    ///
    /// Each aggregate is expanded at most once, so cyclic definitions
    /// terminate; a channel on its own cycle appears in its own result.
    /// Non-aggregates have no constituents.
    pub fn constituents(&self, name: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut result = BTreeSet::new();
        self.expand(name, &mut visited, &mut result);
        result
    }

    fn expand(&self, name: &str, visited: &mut BTreeSet<String>, result: &mut BTreeSet<String>) {
        let Some(members) = self.aggregates.get(name) else {
            return;
        };
        if !visited.insert(name.to_string()) {
            return;
        }
        for member in members {
            result.insert(member.clone());
            self.expand(member, visited, result);
        }
    }

    /// Add `id` to each channel, creating channels as needed.
    pub fn subscribe<I, S>(&mut self, id: &str, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in channels {
            let name = name.as_ref();
            self.add_channel(name);
            if let Some(channel) = self.channels.get_mut(name) {
                channel.subscribers.insert(id.to_string());
            }
        }
        self.recompute();
    }

    /// Remove `id` from each channel.
    ///
    /// Channels `id` never joined, and channels that do not exist, are
    /// skipped without error.
    pub fn unsubscribe<I, S>(&mut self, id: &str, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut changed = false;
        for name in channels {
            if let Some(channel) = self.channels.get_mut(name.as_ref()) {
                changed |= channel.subscribers.remove(id);
            }
        }
        if changed {
            self.recompute();
        }
    }

    /// Remove `id` from every channel; returns whether it was subscribed anywhere.
    pub fn remove_subscriber(&mut self, id: &str) -> bool {
        let mut changed = false;
        for channel in self.channels.values_mut() {
            changed |= channel.subscribers.remove(id);
        }
        if changed {
            self.recompute();
        }
        changed
    }

    /// Channels `id` joined explicitly.
    pub fn subscriptions_of(&self, id: &str) -> Vec<String> {
        self.channels
            .values()
            .filter(|c| c.subscribers.contains(id))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Rebuild every computed set from the explicit subscriptions and the
    /// aggregate graph.
    pub fn recompute(&mut self) {
        for channel in self.channels.values_mut() {
            channel.computed_subscribers = channel.subscribers.clone();
            channel.computed_subscribers.remove(&self.identity);
            channel.computed_channels = BTreeSet::from([channel.name.clone()]);
        }

        let expansions: Vec<(String, BTreeSet<String>, BTreeSet<String>)> = self
            .aggregates
            .keys()
            .map(|agg| {
                let subscribers = self
                    .channels
                    .get(agg)
                    .map(|c| c.subscribers.clone())
                    .unwrap_or_default();
                (agg.clone(), subscribers, self.constituents(agg))
            })
            .collect();

        for (agg, subscribers, constituents) in expansions {
            for member in constituents {
                let channel = self
                    .channels
                    .entry(member.clone())
                    .or_insert_with(|| Channel::new(&member));
                channel
                    .computed_subscribers
                    .extend(subscribers.iter().filter(|s| **s != self.identity).cloned());
                channel.computed_channels.insert(agg.clone());
            }
        }
        trace!("Recomputed {} channel(s)", self.channels.len());
    }

    /// Subscribers and channel memberships for an update on `channels`.
    ///
    /// Unknown channels contribute nothing.
    pub fn resolve<I, S>(&self, channels: I) -> (BTreeSet<String>, BTreeSet<String>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut subscribers = BTreeSet::new();
        let mut memberships = BTreeSet::new();
        for name in channels {
            if let Some(channel) = self.channels.get(name.as_ref()) {
                subscribers.extend(channel.computed_subscribers.iter().cloned());
                memberships.extend(channel.computed_channels.iter().cloned());
            }
        }
        subscribers.remove(&self.identity);
        (subscribers, memberships)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cyclic_aggregates_terminate() {
        let mut table = ChannelTable::new("pubsub");
        table.aggregate("A", ["B"]);
        table.aggregate("B", ["A", "C"]);

        assert_eq!(table.constituents("A"), set(&["A", "B", "C"]));
        assert_eq!(table.constituents("B"), set(&["A", "B", "C"]));
        assert!(table.constituents("C").is_empty());

        table.subscribe("S", ["A"]);
        assert!(table.channel("C").unwrap().computed_subscribers().contains("S"));
    }

    #[test]
    fn test_aggregate_propagation() {
        let mut table = ChannelTable::new("pubsub");
        table.subscribe("S1", ["X"]);
        table.aggregate("ALL", ["X", "Y"]);
        table.subscribe("S2", ["ALL"]);

        let x = table.channel("X").unwrap();
        assert_eq!(x.computed_subscribers(), &set(&["S1", "S2"]));
        assert!(x.computed_channels().is_superset(&set(&["X", "ALL"])));

        let y = table.channel("Y").unwrap();
        assert_eq!(y.computed_subscribers(), &set(&["S2"]));

        let (subs, channels) = table.resolve(["Y"]);
        assert_eq!(subs, set(&["S2"]));
        assert_eq!(channels, set(&["Y", "ALL"]));
    }

    #[test]
    fn test_nested_aggregates() {
        let mut table = ChannelTable::new("pubsub");
        table.aggregate("TEL", ["TEL_AZ", "TEL_EL"]);
        table.aggregate("STATUS", ["TEL", "DOME"]);
        table.subscribe("monitor", ["STATUS"]);

        let el = table.channel("TEL_EL").unwrap();
        assert!(el.computed_subscribers().contains("monitor"));
        assert_eq!(el.computed_channels(), &set(&["TEL_EL", "TEL", "STATUS"]));
    }

    #[test]
    fn test_deaggregate_clears_memberships() {
        let mut table = ChannelTable::new("pubsub");
        table.aggregate("ALL", ["X"]);
        table.subscribe("S", ["ALL"]);
        assert!(table.deaggregate("ALL"));
        assert!(!table.deaggregate("ALL"));

        let x = table.channel("X").unwrap();
        assert!(x.computed_subscribers().is_empty());
        assert_eq!(x.computed_channels(), &set(&["X"]));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mut table = ChannelTable::new("pubsub");
        table.subscribe("S", ["X"]);
        let before = table.channels();

        table.unsubscribe("S", ["Y", "NOPE"]);
        table.unsubscribe("T", ["X"]);
        assert_eq!(table.channels(), before);
        assert_eq!(table.channel("X").unwrap().subscribers(), &set(&["S"]));

        table.unsubscribe("S", ["X"]);
        table.unsubscribe("S", ["X"]);
        assert!(table.channel("X").unwrap().subscribers().is_empty());
    }

    #[test]
    fn test_identity_is_never_a_computed_subscriber() {
        let mut table = ChannelTable::new("pubsub");
        table.subscribe("pubsub", ["X"]);
        table.aggregate("ALL", ["X"]);
        table.subscribe("pubsub", ["ALL"]);

        assert!(table.channel("X").unwrap().computed_subscribers().is_empty());
        assert!(table.resolve(["X", "ALL"]).0.is_empty());
    }

    #[test]
    fn test_remove_subscriber() {
        let mut table = ChannelTable::new("pubsub");
        table.subscribe("S", ["X", "Y"]);
        assert_eq!(table.subscriptions_of("S"), vec!["X", "Y"]);
        assert!(table.remove_subscriber("S"));
        assert!(!table.remove_subscriber("S"));
        assert!(table.resolve(["X", "Y"]).0.is_empty());
    }
}
