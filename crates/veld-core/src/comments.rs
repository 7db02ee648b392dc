//! Comments DAG: notes attached to changesets after the fact.

use serde::{Deserialize, Serialize};

use crate::changeset::ChangesetId;
use crate::records::{Audit, Record, RecordDelta, RecordSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommentRecord {
    pub csid: ChangesetId,
    pub text: String,
    pub audit: Audit,
}

/// Comments on `csid`, oldest first.
pub fn comments_on(records: &RecordSet, csid: &ChangesetId) -> Vec<CommentRecord> {
    let mut out: Vec<CommentRecord> = records
        .iter()
        .filter_map(|(_, r)| match r {
            Record::Comment(c) if &c.csid == csid => Some(c.clone()),
            _ => None,
        })
        .collect();
    out.sort_by(|a, b| a.audit.when.cmp(&b.audit.when));
    out
}

pub fn comment_delta(csid: &ChangesetId, text: &str, audit: Audit) -> RecordDelta {
    let mut delta = RecordDelta::default();
    delta.add(Record::Comment(CommentRecord {
        csid: csid.clone(),
        text: text.to_string(),
        audit,
    }));
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::users::UserId;
    use chrono::{Duration, Utc};

    fn id(name: &str) -> ChangesetId {
        ChangesetId::from_hash(hash_bytes(name.as_bytes()))
    }

    #[test]
    fn test_comments_oldest_first() {
        let user = UserId::from_raw("u1");
        let now = Utc::now();
        let later = Audit {
            user: user.clone(),
            when: now + Duration::seconds(5),
        };
        let earlier = Audit { user, when: now };

        let mut set = RecordSet::default();
        set.apply(&comment_delta(&id("a"), "second", later.clone()));
        set.apply(&comment_delta(&id("a"), "first", earlier));
        set.apply(&comment_delta(&id("b"), "elsewhere", later));

        let texts: Vec<String> = comments_on(&set, &id("a")).into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(comments_on(&set, &id("b")).len(), 1);
        assert!(comments_on(&set, &id("c")).is_empty());
    }
}
