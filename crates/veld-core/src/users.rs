//! Users DAG: the identities that commits and records refer to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::records::{Record, RecordDelta, RecordSet};

/// Stable user identity (a uuid; names are display attributes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn generate() -> Self {
        UserId(Uuid::new_v4().simple().to_string())
    }

    pub(crate) fn from_raw(raw: &str) -> Self {
        UserId(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Read view over the users DAG.
pub struct UserDirectory<'a> {
    records: &'a RecordSet,
}

impl<'a> UserDirectory<'a> {
    pub fn new(records: &'a RecordSet) -> Self {
        Self { records }
    }

    fn all_records(&self) -> impl Iterator<Item = &'a UserRecord> {
        self.records.iter().filter_map(|(_, r)| match r {
            Record::User(u) => Some(u),
            _ => None,
        })
    }

    pub fn get(&self, id: &UserId) -> Option<&'a UserRecord> {
        self.all_records().find(|u| &u.id == id)
    }

    pub fn contains(&self, id: &UserId) -> bool {
        self.get(id).is_some()
    }

    /// Look a user up by name. Two replicas may each create the same name;
    /// the earliest creation wins.
    pub fn by_name(&self, name: &str) -> Option<&'a UserRecord> {
        self.all_records()
            .filter(|u| u.name == name)
            .min_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)))
    }

    /// Display name, falling back to the raw id.
    pub fn display(&self, id: &UserId) -> String {
        self.get(id)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// All users sorted by name.
    pub fn list(&self) -> Vec<UserRecord> {
        let mut users: Vec<UserRecord> = self.all_records().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        users
    }
}

/// Delta creating a new user.
pub fn create_user_delta(name: &str) -> (UserId, RecordDelta) {
    let id = UserId::generate();
    let mut delta = RecordDelta::default();
    delta.add(Record::User(UserRecord {
        id: id.clone(),
        name: name.to_string(),
        created: Utc::now(),
    }));
    (id, delta)
}
