//! Tags DAG: human names for changesets.

use serde::{Deserialize, Serialize};

use crate::changeset::ChangesetId;
use crate::error::{VeldError, VeldResult};
use crate::records::{Audit, Record, RecordDelta, RecordSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagRecord {
    pub name: String,
    pub csid: ChangesetId,
    pub audit: Audit,
}

pub struct TagRegistry<'a> {
    records: &'a RecordSet,
}

impl<'a> TagRegistry<'a> {
    pub fn new(records: &'a RecordSet) -> Self {
        Self { records }
    }

    fn named(&self, name: &str) -> Vec<&'a TagRecord> {
        let mut tags: Vec<&TagRecord> = self
            .records
            .iter()
            .filter_map(|(_, r)| match r {
                Record::Tag(t) if t.name == name => Some(t),
                _ => None,
            })
            .collect();
        tags.sort_by(|a, b| a.audit.when.cmp(&b.audit.when).then_with(|| a.csid.cmp(&b.csid)));
        tags
    }

    /// The changeset a tag names. Replicas that tagged the same name
    /// independently converge on the earliest tag.
    pub fn resolve(&self, name: &str) -> Option<&'a ChangesetId> {
        self.named(name).first().map(|t| &t.csid)
    }

    /// All tags, sorted by name.
    pub fn list(&self) -> Vec<TagRecord> {
        let mut tags: Vec<TagRecord> = self
            .records
            .iter()
            .filter_map(|(_, r)| match r {
                Record::Tag(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.audit.when.cmp(&b.audit.when)));
        tags
    }

    pub fn add_delta(&self, name: &str, csid: &ChangesetId, audit: Audit) -> VeldResult<RecordDelta> {
        let mut delta = RecordDelta::default();
        match self.resolve(name) {
            Some(existing) if existing == csid => {}
            Some(_) => return Err(VeldError::TagExists(name.to_string())),
            None => delta.add(Record::Tag(TagRecord {
                name: name.to_string(),
                csid: csid.clone(),
                audit,
            })),
        }
        Ok(delta)
    }

    pub fn remove_delta(&self, name: &str) -> VeldResult<RecordDelta> {
        let mut delta = RecordDelta::default();
        for (id, r) in self.records.iter() {
            if matches!(r, Record::Tag(t) if t.name == name) {
                delta.remove(id.clone());
            }
        }
        if delta.is_empty() {
            return Err(VeldError::UnknownRevision(format!("tag {name}")));
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::users::UserId;

    fn id(name: &str) -> ChangesetId {
        ChangesetId::from_hash(hash_bytes(name.as_bytes()))
    }

    #[test]
    fn test_tag_lifecycle() {
        let user = UserId::from_raw("u1");
        let mut set = RecordSet::default();

        let delta = TagRegistry::new(&set).add_delta("v1", &id("a"), Audit::now(&user)).unwrap();
        set.apply(&delta);
        assert_eq!(TagRegistry::new(&set).resolve("v1"), Some(&id("a")));

        let again = TagRegistry::new(&set).add_delta("v1", &id("a"), Audit::now(&user)).unwrap();
        assert!(again.is_empty());

        let clash = TagRegistry::new(&set).add_delta("v1", &id("b"), Audit::now(&user));
        assert!(matches!(clash, Err(VeldError::TagExists(_))));

        let delta = TagRegistry::new(&set).remove_delta("v1").unwrap();
        set.apply(&delta);
        assert!(TagRegistry::new(&set).resolve("v1").is_none());
        assert!(TagRegistry::new(&set).remove_delta("v1").is_err());
    }
}
