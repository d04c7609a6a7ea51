use crate::codec::NodePath;
use crate::ownership::crdt::{LamportClock, LwwRegister, OrSet};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// An entity members can compete to own, e.g. a device they all can talk to.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity {
    pub entity_type: String,
    pub id: NodePath,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: NodePath) -> Self {
        Entity {
            entity_type: entity_type.into(),
            id,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipChange {
    pub entity: Entity,
    pub previous_owner: Option<String>,
    pub new_owner: Option<String>,
}

/// EntityOwnershipMap is one member's replica of the candidate registry and the owner table.
/// Replicas converge by exchanging whole states through `merge`, in any order.
///
/// Any member may register or unregister itself as a candidate. Owners are only written by the
/// member running the `OwnerSupervisor`.
#[derive(Debug, Clone)]
pub struct EntityOwnershipMap {
    member: String,
    clock: LamportClock,
    candidates: BTreeMap<Entity, OrSet<String>>,
    owners: BTreeMap<Entity, LwwRegister<String>>,
}

impl EntityOwnershipMap {
    pub fn new(member: impl Into<String>) -> Self {
        let member = member.into();
        EntityOwnershipMap {
            clock: LamportClock::new(member.clone()),
            member,
            candidates: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn register_candidate(&mut self, entity: Entity) {
        let member = self.member.clone();
        self.candidates
            .entry(entity)
            .or_insert_with(OrSet::new)
            .add(&member, member.clone());
    }

    pub fn unregister_candidate(&mut self, entity: &Entity) -> bool {
        let member = self.member.clone();
        self.candidates
            .get_mut(entity)
            .map(|candidates| candidates.remove(&member))
            .unwrap_or(false)
    }

    pub fn candidates(&self, entity: &Entity) -> Vec<&str> {
        self.candidates
            .get(entity)
            .map(|c| c.elements().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.candidates.keys()
    }

    pub fn owner(&self, entity: &Entity) -> Option<&str> {
        self.owners
            .get(entity)
            .and_then(|register| register.get())
            .map(String::as_str)
    }

    pub fn is_owner(&self, entity: &Entity) -> bool {
        self.owner(entity) == Some(self.member.as_str())
    }

    pub fn merge(&mut self, other: &EntityOwnershipMap) {
        for (entity, candidates) in other.candidates.iter() {
            self.candidates
                .entry(entity.clone())
                .or_insert_with(OrSet::new)
                .merge(candidates);
        }
        for (entity, register) in other.owners.iter() {
            let ours = self.owners.entry(entity.clone()).or_insert_with(LwwRegister::new);
            ours.merge(register);
            if let Some(stamp) = ours.stamp() {
                self.clock.observe(stamp);
            }
        }
    }

    fn write_owner(&mut self, entity: &Entity, owner: Option<String>) {
        self.owners
            .entry(entity.clone())
            .or_insert_with(LwwRegister::new)
            .set(owner, &mut self.clock);
    }
}

/// OwnerSupervisor picks owners among the reachable candidates. Exactly one member should run it,
/// e.g. the shard leader.
pub struct OwnerSupervisor {
    logger: slog::Logger,
    active_members: BTreeSet<String>,
}

impl OwnerSupervisor {
    pub fn new(logger: slog::Logger, active_members: impl IntoIterator<Item = String>) -> Self {
        OwnerSupervisor {
            logger,
            active_members: active_members.into_iter().collect(),
        }
    }

    pub fn member_up(&mut self, member: impl Into<String>) {
        self.active_members.insert(member.into());
    }

    pub fn member_down(&mut self, member: &str) {
        self.active_members.remove(member);
    }

    /// Keeps current owners that are still reachable candidates and reassigns everything else.
    /// An unreachable owner that is the only candidate keeps the entity.
    pub fn reassign(&self, map: &mut EntityOwnershipMap) -> Vec<OwnershipChange> {
        let entities: BTreeSet<Entity> = map.candidates.keys().chain(map.owners.keys()).cloned().collect();

        let mut changes = Vec::new();
        for entity in entities {
            let candidates = map.candidates(&entity);
            let current = map.owner(&entity).map(str::to_string);

            let new_owner = match &current {
                Some(owner) if candidates.contains(&owner.as_str()) && self.active_members.contains(owner) => {
                    continue;
                }
                Some(owner) if candidates == [owner.as_str()] => {
                    slog::debug!(
                        self.logger,
                        "{} is the only candidate for {:?}. Skipping reassignment.",
                        owner,
                        entity
                    );
                    continue;
                }
                _ => candidates
                    .iter()
                    .find(|c| self.active_members.contains(**c))
                    .map(|c| c.to_string()),
            };

            if new_owner == current {
                continue;
            }
            slog::debug!(self.logger, "Entity {:?} new owner: {:?}", entity, new_owner);
            map.write_owner(&entity, new_owner.clone());
            changes.push(OwnershipChange {
                entity,
                previous_owner: current,
                new_owner,
            });
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PathArgument, QName};

    fn entity(name: &str) -> Entity {
        Entity::new(
            "device",
            NodePath::root().child(PathArgument::Node(QName::new("urn:test", name))),
        )
    }

    fn supervisor(active: &[&str]) -> OwnerSupervisor {
        OwnerSupervisor::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            active.iter().map(|m| m.to_string()),
        )
    }

    fn replicas() -> (EntityOwnershipMap, EntityOwnershipMap) {
        let mut m1 = EntityOwnershipMap::new("m1");
        let mut m2 = EntityOwnershipMap::new("m2");
        m1.register_candidate(entity("switch"));
        m2.register_candidate(entity("switch"));
        m1.merge(&m2);
        m2.merge(&m1);
        (m1, m2)
    }

    #[test]
    fn first_reachable_candidate_becomes_owner() {
        let (mut m1, mut m2) = replicas();

        let changes = supervisor(&["m1", "m2"]).reassign(&mut m1);
        assert_eq!(
            changes,
            vec![OwnershipChange {
                entity: entity("switch"),
                previous_owner: None,
                new_owner: Some("m1".into()),
            }]
        );

        m2.merge(&m1);
        assert_eq!(m2.owner(&entity("switch")), Some("m1"));
        assert!(m1.is_owner(&entity("switch")));
        assert!(!m2.is_owner(&entity("switch")));
    }

    #[test]
    fn stable_owner_is_kept() {
        let (mut m1, _) = replicas();
        let supervisor = supervisor(&["m1", "m2"]);

        supervisor.reassign(&mut m1);
        assert!(supervisor.reassign(&mut m1).is_empty());
    }

    #[test]
    fn unreachable_owner_is_replaced() {
        let (mut m1, _) = replicas();
        let mut supervisor = supervisor(&["m1", "m2"]);
        supervisor.reassign(&mut m1);

        supervisor.member_down("m1");
        let changes = supervisor.reassign(&mut m1);
        assert_eq!(changes.len(), 1);
        assert_eq!(m1.owner(&entity("switch")), Some("m2"));
    }

    #[test]
    fn sole_candidate_keeps_ownership_while_unreachable() {
        let mut m1 = EntityOwnershipMap::new("m1");
        m1.register_candidate(entity("router"));
        let mut supervisor = supervisor(&["m1"]);
        supervisor.reassign(&mut m1);

        supervisor.member_down("m1");
        assert!(supervisor.reassign(&mut m1).is_empty());
        assert_eq!(m1.owner(&entity("router")), Some("m1"));
    }

    #[test]
    fn last_candidate_leaving_clears_owner() {
        let (mut m1, mut m2) = replicas();
        let supervisor = supervisor(&["m1", "m2"]);
        supervisor.reassign(&mut m1);

        assert!(m1.unregister_candidate(&entity("switch")));
        assert!(m2.unregister_candidate(&entity("switch")));
        m1.merge(&m2);
        supervisor.reassign(&mut m1);

        assert!(m1.candidates(&entity("switch")).is_empty());
        assert_eq!(m1.owner(&entity("switch")), None);
    }
}
