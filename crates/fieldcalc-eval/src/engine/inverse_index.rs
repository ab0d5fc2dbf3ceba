//! Inverse reference index: who links to a record.
//!
//! For every target record, the set of (table, record, relation field)
//! triples whose relation value currently contains it. A value change on a
//! target record uses this to find the rollups and lookups to recompute
//! without scanning the linking table.

use std::collections::BTreeSet;

use fieldcalc_common::{FieldId, RecordId, RecordKey, TableId};
use rustc_hash::{FxHashMap, FxHashSet};

/// One incoming link: `record` of `table` targets the indexed record
/// through `relation`.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Referrer {
    pub table: TableId,
    pub record: RecordId,
    pub relation: FieldId,
}

impl Referrer {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table, self.record)
    }
}

#[derive(Debug, Clone)]
struct Links {
    target_table: TableId,
    targets: Vec<RecordId>,
}

#[derive(Debug, Default)]
pub struct InverseIndex {
    inverse: FxHashMap<RecordKey, FxHashSet<Referrer>>,
    // (source record, relation) -> what it currently links to
    forward: FxHashMap<(RecordKey, FieldId), Links>,
}

impl InverseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of (source, relation, target) links indexed.
    pub fn len(&self) -> usize {
        self.inverse.values().map(FxHashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inverse.is_empty()
    }

    /// Apply one relation edit: ids in `new - old` gain an entry, ids in
    /// `old - new` lose theirs.
    ///
    /// `old` is what the caller believes the relation held. The diff is
    /// taken against the links already indexed for this relation value, so
    /// a stale `old` cannot leave inverse entries behind.
    pub fn on_relation_changed(
        &mut self,
        source_table: TableId,
        source_record: RecordId,
        relation: FieldId,
        target_table: TableId,
        old: &[RecordId],
        new: &[RecordId],
    ) {
        let source = RecordKey::new(source_table, source_record);
        let referrer = Referrer {
            table: source_table,
            record: source_record,
            relation,
        };
        let previous = self.forward.remove(&(source, relation));
        let indexed: FxHashSet<RecordId> = previous
            .iter()
            .filter(|links| links.target_table == target_table)
            .flat_map(|links| links.targets.iter().copied())
            .collect();
        let claimed: FxHashSet<RecordId> = old.iter().copied().collect();
        if claimed != indexed {
            tracing::debug!(
                %source,
                %relation,
                "relation edit disagrees with the index; diffing against indexed links"
            );
        }
        let new_set: FxHashSet<RecordId> = new.iter().copied().collect();

        if let Some(links) = &previous {
            for removed in links.targets.iter().filter(|id| {
                links.target_table != target_table || !new_set.contains(*id)
            }) {
                self.unlink(RecordKey::new(links.target_table, *removed), &referrer);
            }
        }
        for added in new_set.difference(&indexed) {
            self.inverse
                .entry(RecordKey::new(target_table, *added))
                .or_default()
                .insert(referrer);
        }

        if !new.is_empty() {
            self.forward.insert(
                (source, relation),
                Links {
                    target_table,
                    targets: new.to_vec(),
                },
            );
        }
    }

    /// Replace whatever the index knows about one relation value and
    /// return the targets it replaced.
    pub fn set_links(
        &mut self,
        source: RecordKey,
        relation: FieldId,
        target_table: TableId,
        new: &[RecordId],
    ) -> Vec<RecordId> {
        let old = self.targets_of(source, relation).to_vec();
        self.on_relation_changed(source.table, source.record, relation, target_table, &old, new);
        old
    }

    /// Referrers of `target`, ordered by (table, record, relation).
    pub fn references_to(&self, target_table: TableId, target_record: RecordId) -> BTreeSet<Referrer> {
        self.inverse
            .get(&RecordKey::new(target_table, target_record))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Targets the index has recorded for `source` through `relation`.
    pub fn targets_of(&self, source: RecordKey, relation: FieldId) -> &[RecordId] {
        self.forward
            .get(&(source, relation))
            .map_or(&[], |links| links.targets.as_slice())
    }

    /// Forget a deleted record both as a link source and as a link target.
    ///
    /// Returns the referrers that pointed at it; their rollups and lookups
    /// need recomputing.
    pub fn remove_record(&mut self, key: RecordKey) -> BTreeSet<Referrer> {
        let relations: Vec<FieldId> = self
            .forward
            .keys()
            .filter(|(source, _)| *source == key)
            .map(|(_, relation)| *relation)
            .collect();
        for relation in relations {
            self.drop_forward(key, relation);
        }

        let referrers: BTreeSet<Referrer> = self
            .inverse
            .remove(&key)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for referrer in &referrers {
            if let Some(links) = self.forward.get_mut(&(referrer.key(), referrer.relation)) {
                links.targets.retain(|id| *id != key.record);
            }
        }
        referrers
    }

    /// Forget every link made through `relation` (the field was deleted or
    /// now points at another table).
    pub fn remove_relation_field(&mut self, relation: FieldId) {
        let sources: Vec<RecordKey> = self
            .forward
            .keys()
            .filter(|(_, r)| *r == relation)
            .map(|(source, _)| *source)
            .collect();
        for source in sources {
            self.drop_forward(source, relation);
        }
    }

    fn drop_forward(&mut self, source: RecordKey, relation: FieldId) -> Vec<RecordId> {
        let Some(links) = self.forward.remove(&(source, relation)) else {
            return Vec::new();
        };
        let referrer = Referrer {
            table: source.table,
            record: source.record,
            relation,
        };
        for target in &links.targets {
            self.unlink(RecordKey::new(links.target_table, *target), &referrer);
        }
        links.targets
    }

    fn unlink(&mut self, target: RecordKey, referrer: &Referrer) {
        if let Some(set) = self.inverse.get_mut(&target) {
            set.remove(referrer);
            if set.is_empty() {
                self.inverse.remove(&target);
            }
        }
    }
}
