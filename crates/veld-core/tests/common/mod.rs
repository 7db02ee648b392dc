#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io;

use veld_core::sync::{ApplySummary, Dagfrag, FragSink, OfferReply, SessionId};
use veld_core::{ChangesetId, CommitRequest, PushOptions, Repository, RevSpec, Tree, UserId, VeldError, VeldResult};

/// A fresh replica with one user and a root commit holding `a.txt` and
/// `b.txt` on master.
pub fn seeded(name: &str) -> (Repository, UserId, ChangesetId) {
    let repo = Repository::in_memory(name);
    let user = repo.create_user("alice").unwrap();
    let mut tree = Tree::new();
    tree.add_file("a.txt", b"a").unwrap();
    tree.add_file("b.txt", b"b").unwrap();
    let root = repo
        .commit(CommitRequest::new(&user, "root", tree).on_branch("master"))
        .unwrap();
    (repo, user, root)
}

/// Commit on `branch` on top of `parent`, editing the parent's tree.
pub fn commit_on(
    repo: &Repository,
    user: &UserId,
    branch: &str,
    parent: &ChangesetId,
    edit: impl FnOnce(&mut Tree),
) -> ChangesetId {
    let mut tree = repo.tree(&RevSpec::Id(parent.to_string())).unwrap();
    edit(&mut tree);
    repo.commit(
        CommitRequest::new(user, "change", tree)
            .parent(parent)
            .on_branch(branch),
    )
    .unwrap()
}

/// Commit on master with a one-file content change.
pub fn touch(repo: &Repository, user: &UserId, parent: &ChangesetId, path: &str, content: &str) -> ChangesetId {
    commit_on(repo, user, "master", parent, |t| t.modify(path, content.as_bytes()).unwrap())
}

pub fn master_heads(repo: &Repository) -> Vec<ChangesetId> {
    repo.branch("master").unwrap().heads
}

pub fn unforced() -> PushOptions {
    PushOptions::default()
}

/// A sink that loses its connection after a number of offers.
pub struct FlakySink<'a> {
    pub inner: &'a Repository,
    pub offers_left: Cell<u32>,
    /// Ids of every changeset that got through.
    pub offered: RefCell<Vec<ChangesetId>>,
}

impl<'a> FlakySink<'a> {
    pub fn new(inner: &'a Repository, offers: u32) -> Self {
        Self {
            inner,
            offers_left: Cell::new(offers),
            offered: RefCell::new(Vec::new()),
        }
    }
}

impl FragSink for FlakySink<'_> {
    fn peer_name(&self) -> String {
        self.inner.name().to_string()
    }

    fn begin(&self) -> VeldResult<SessionId> {
        FragSink::begin(self.inner)
    }

    fn offer(&self, session: &SessionId, frag: &Dagfrag) -> VeldResult<OfferReply> {
        let left = self.offers_left.get();
        if left == 0 {
            return Err(VeldError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        self.offers_left.set(left - 1);
        let reply = FragSink::offer(self.inner, session, frag)?;
        self.offered.borrow_mut().extend(frag.ids().cloned());
        Ok(reply)
    }

    fn commit(&self, session: &SessionId, options: &PushOptions) -> VeldResult<ApplySummary> {
        FragSink::commit(self.inner, session, options)
    }

    fn abort(&self, session: &SessionId) -> VeldResult<()> {
        FragSink::abort(self.inner, session)
    }
}
