use std::collections::{BTreeMap, BTreeSet};

/// Lamport timestamp. Ties between members are broken by member ID, so any two stamps are ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LamportClock {
    pub time: u64,
    pub member: String,
}

impl LamportClock {
    pub fn new(member: impl Into<String>) -> Self {
        LamportClock {
            time: 0,
            member: member.into(),
        }
    }

    pub fn tick(&mut self) -> LamportClock {
        self.time += 1;
        self.clone()
    }

    /// Moves past a stamp observed from another member.
    pub fn observe(&mut self, other: &LamportClock) {
        self.time = self.time.max(other.time);
    }
}

/// Last-writer-wins register. `None` is a written value too, meaning "cleared".
#[derive(Debug, Clone, PartialEq)]
pub struct LwwRegister<T: Clone> {
    value: Option<T>,
    stamp: Option<LamportClock>,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new() -> Self {
        LwwRegister { value: None, stamp: None }
    }

    pub fn set(&mut self, value: Option<T>, clock: &mut LamportClock) {
        if let Some(stamp) = &self.stamp {
            clock.observe(stamp);
        }
        self.value = value;
        self.stamp = Some(clock.tick());
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn stamp(&self) -> Option<&LamportClock> {
        self.stamp.as_ref()
    }

    pub fn merge(&mut self, other: &LwwRegister<T>) {
        if other.stamp > self.stamp {
            self.value = other.value.clone();
            self.stamp = other.stamp.clone();
        }
    }
}

impl<T: Clone> Default for LwwRegister<T> {
    fn default() -> Self {
        LwwRegister::new()
    }
}

/// Unique tag of one add: the adding member and its add counter.
type Dot = (String, u64);

/// Observed-remove set. A remove only cancels the adds it has seen, so a concurrent add wins.
#[derive(Debug, Clone, PartialEq)]
pub struct OrSet<T: Ord + Clone> {
    elements: BTreeMap<T, BTreeSet<Dot>>,
    tombstones: BTreeSet<Dot>,
    counters: BTreeMap<String, u64>,
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        OrSet {
            elements: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            counters: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, member: &str, value: T) {
        let counter = self.counters.entry(member.to_string()).or_insert(0);
        *counter += 1;
        let dot = (member.to_string(), *counter);
        self.elements.entry(value).or_insert_with(BTreeSet::new).insert(dot);
    }

    /// Returns false if the value wasn't present.
    pub fn remove(&mut self, value: &T) -> bool {
        match self.elements.remove(value) {
            Some(dots) => {
                self.tombstones.extend(dots);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.elements.contains_key(value)
    }

    /// Elements in ascending order.
    pub fn elements(&self) -> impl Iterator<Item = &T> {
        self.elements.keys()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn merge(&mut self, other: &OrSet<T>) {
        self.tombstones.extend(other.tombstones.iter().cloned());
        for (value, dots) in other.elements.iter() {
            self.elements
                .entry(value.clone())
                .or_insert_with(BTreeSet::new)
                .extend(dots.iter().cloned());
        }

        let tombstones = &self.tombstones;
        self.elements.retain(|_, dots| {
            dots.retain(|dot| !tombstones.contains(dot));
            !dots.is_empty()
        });

        for (member, counter) in other.counters.iter() {
            let ours = self.counters.entry(member.clone()).or_insert(0);
            *ours = (*ours).max(*counter);
        }
    }
}

impl<T: Ord + Clone> Default for OrSet<T> {
    fn default() -> Self {
        OrSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_write_wins_regardless_of_merge_order() {
        let mut clock_a = LamportClock::new("a");
        let mut clock_b = LamportClock::new("b");

        let mut on_a = LwwRegister::new();
        on_a.set(Some("first"), &mut clock_a);

        let mut on_b = on_a.clone();
        on_b.set(Some("second"), &mut clock_b);

        let mut left = on_a.clone();
        left.merge(&on_b);
        let mut right = on_b.clone();
        right.merge(&on_a);

        assert_eq!(left.get(), Some(&"second"));
        assert_eq!(left, right);
    }

    #[test]
    fn concurrent_writes_are_broken_by_member() {
        let mut on_a = LwwRegister::new();
        on_a.set(Some(1), &mut LamportClock::new("a"));
        let mut on_b = LwwRegister::new();
        on_b.set(Some(2), &mut LamportClock::new("b"));

        on_a.merge(&on_b);
        assert_eq!(on_a.get(), Some(&2));
    }

    #[test]
    fn cleared_register_stays_cleared() {
        let mut clock = LamportClock::new("a");
        let mut register = LwwRegister::new();
        register.set(Some("owner"), &mut clock);
        let stale = register.clone();

        register.set(None, &mut clock);
        register.merge(&stale);
        assert_eq!(register.get(), None);
    }

    #[test]
    fn concurrent_add_survives_remove() {
        let mut on_a = OrSet::new();
        on_a.add("a", "member-1");
        let mut on_b = on_a.clone();

        on_a.remove(&"member-1");
        on_b.add("b", "member-1");

        on_a.merge(&on_b);
        on_b.merge(&on_a);
        assert!(on_a.contains(&"member-1"));
        assert_eq!(on_a, on_b);
    }

    #[test]
    fn observed_remove_propagates() {
        let mut on_a = OrSet::new();
        on_a.add("a", 7);
        on_a.add("a", 8);
        let mut on_b = on_a.clone();

        assert!(on_b.remove(&7));
        assert!(!on_b.remove(&9));
        on_a.merge(&on_b);

        assert_eq!(on_a.elements().copied().collect::<Vec<_>>(), vec![8]);
    }
}
