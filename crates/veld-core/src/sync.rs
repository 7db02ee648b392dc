//! Push/pull reconciliation.
//!
//! A sync moves changesets from a [`FragSource`] to a [`FragSink`] one DAG
//! at a time, in dependency order, and then asks the sink to apply
//! everything at once. Each DAG is negotiated in round trips:
//!
//! 1. The source guesses what the sink already has (its memory of the
//!    sink's leaves, possibly stale) and sends every changeset the guess
//!    does not cover, together with the boundary ids it assumes present.
//! 2. The sink stages the fragment and answers with the boundary ids it
//!    does not have, plus its real leaves.
//! 3. The source extends the fragment from those ids and sends again,
//!    never resending what was already acknowledged.
//!
//! Nothing touches the sink's history until `commit`, which validates
//! branch ambiguity on the complete staged result and either applies all
//! of it or none of it. The negotiation state is a plain serializable
//! value ([`SyncSession`]), so a caller can persist it between round
//! trips and resume.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::changeset::{Changeset, ChangesetId, DagId};
use crate::dag::DagIndex;
use crate::error::{VeldError, VeldResult};
use crate::remote::SyncSettings;

/// Identifies one staging area at a sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit of transfer: changesets of one DAG in dependency order, plus
/// the ids outside the fragment the sender assumes the receiver has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dagfrag {
    pub dag: DagId,
    pub changesets: Vec<Changeset>,
    pub boundary: BTreeSet<ChangesetId>,
}

impl Dagfrag {
    /// Everything in `index` reachable from `from` that the receiver is
    /// not assumed to have. The receiver is assumed to have every id in
    /// `sent` and every ancestor of (or id equal to) an id in `guess`.
    pub fn build(
        dag: DagId,
        index: &DagIndex,
        lookup: impl Fn(&ChangesetId) -> Option<Changeset>,
        from: &[ChangesetId],
        guess: &BTreeSet<ChangesetId>,
        sent: &BTreeSet<ChangesetId>,
    ) -> VeldResult<Self> {
        let unknown = index.collect_unknown(from, |id| {
            sent.contains(id) || guess.contains(id) || index.is_ancestor_of_any(id, guess.iter())
        });
        let members: BTreeSet<&ChangesetId> = unknown.iter().collect();

        let mut boundary = BTreeSet::new();
        let mut changesets = Vec::with_capacity(unknown.len());
        for id in &unknown {
            let cs = lookup(id).ok_or_else(|| VeldError::ChangesetNotFound(id.to_string()))?;
            for parent in &cs.parents {
                if !members.contains(parent) {
                    boundary.insert(parent.clone());
                }
            }
            changesets.push(cs);
        }
        for id in from {
            if index.contains(id) && !members.contains(id) {
                boundary.insert(id.clone());
            }
        }

        Ok(Self {
            dag,
            changesets,
            boundary,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.changesets.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChangesetId> {
        self.changesets.iter().map(|cs| &cs.id)
    }
}

/// A sink's answer to an offered fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferReply {
    /// Boundary ids the sink has neither stored nor staged.
    pub missing: Vec<ChangesetId>,
    /// The sink's current leaves of the offered DAG.
    pub leaves: Vec<ChangesetId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOptions {
    /// Restrict version-control history and ambiguity checks to one branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Apply even if branches become ambiguous.
    #[serde(default)]
    pub forced: bool,
}

impl PushOptions {
    pub fn forced() -> Self {
        Self {
            forced: true,
            ..Self::default()
        }
    }

    pub fn branch(name: &str) -> Self {
        Self {
            branch: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// What a sink applied on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub applied: Vec<ChangesetId>,
    /// Branches a forced commit left ambiguous.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguous: Vec<String>,
    /// The sink's leaves of every DAG after the commit.
    pub leaves: BTreeMap<DagId, Vec<ChangesetId>>,
}

/// The sending side of a sync.
pub trait FragSource {
    fn peer_name(&self) -> String;
    fn leaves(&self, dag: DagId) -> VeldResult<Vec<ChangesetId>>;
    /// Available heads of `branch`; empty if the branch does not exist.
    fn branch_heads(&self, branch: &str) -> VeldResult<Vec<ChangesetId>>;
    /// See [`Dagfrag::build`].
    fn build_frag(
        &self,
        dag: DagId,
        from: &[ChangesetId],
        guess: &BTreeSet<ChangesetId>,
        sent: &BTreeSet<ChangesetId>,
    ) -> VeldResult<Dagfrag>;
}

/// The receiving side of a sync.
pub trait FragSink {
    fn peer_name(&self) -> String;
    fn begin(&self) -> VeldResult<SessionId>;
    /// Stage a fragment. Re-offering staged changesets is a no-op.
    fn offer(&self, session: &SessionId, frag: &Dagfrag) -> VeldResult<OfferReply>;
    /// Validate and apply everything staged, atomically.
    fn commit(&self, session: &SessionId, options: &PushOptions) -> VeldResult<ApplySummary>;
    /// Drop the staging area. Unknown sessions are ignored.
    fn abort(&self, session: &SessionId) -> VeldResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Planning,
    RoundTripping,
    Validating,
    Applying,
    Committed,
    Rejected,
    Aborted,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncPhase::Committed | SyncPhase::Rejected | SyncPhase::Aborted
        )
    }
}

/// Serializable state of one sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SessionId,
    pub source: String,
    pub destination: String,
    pub options: PushOptions,
    pub phase: SyncPhase,
    /// What the source currently believes the sink has, per DAG.
    pub guesses: BTreeMap<DagId, BTreeSet<ChangesetId>>,
    /// Ids the sink has staged, per DAG.
    pub acknowledged: BTreeMap<DagId, BTreeSet<ChangesetId>>,
    /// Source leaves at planning time.
    pub source_leaves: BTreeMap<DagId, Vec<ChangesetId>>,
    /// DAGs whose negotiation finished.
    pub negotiated: BTreeSet<DagId>,
    pub round_trips: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ApplySummary>,
}

impl SyncSession {
    pub fn new(
        id: SessionId,
        source: String,
        destination: String,
        options: PushOptions,
        seed: BTreeMap<DagId, Vec<ChangesetId>>,
    ) -> Self {
        let guesses = seed
            .into_iter()
            .map(|(dag, ids)| (dag, ids.into_iter().collect()))
            .collect();
        Self {
            id,
            source,
            destination,
            options,
            phase: SyncPhase::Planning,
            guesses,
            acknowledged: BTreeMap::new(),
            source_leaves: BTreeMap::new(),
            negotiated: BTreeSet::new(),
            round_trips: 0,
            summary: None,
        }
    }

    fn enter(&mut self, phase: SyncPhase) {
        debug!(session = %self.id, from = ?self.phase, to = ?phase, "sync phase");
        self.phase = phase;
    }

    fn guess(&self, dag: DagId) -> BTreeSet<ChangesetId> {
        self.guesses.get(&dag).cloned().unwrap_or_default()
    }

    fn sent(&self, dag: DagId) -> BTreeSet<ChangesetId> {
        self.acknowledged.get(&dag).cloned().unwrap_or_default()
    }
}

/// Drives a [`SyncSession`] between a source and a sink.
#[derive(Debug, Clone)]
pub struct Reconciler {
    max_round_trips: u32,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(&SyncSettings::default())
    }
}

impl Reconciler {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            max_round_trips: settings.max_round_trips.max(1),
        }
    }

    /// Open a staging area at the sink and return a session in `Planning`.
    ///
    /// `seed` is the best guess of the sink's leaves per DAG.
    pub fn start(
        &self,
        source: &dyn FragSource,
        sink: &dyn FragSink,
        options: &PushOptions,
        seed: BTreeMap<DagId, Vec<ChangesetId>>,
    ) -> VeldResult<SyncSession> {
        let id = sink.begin().map_err(|e| incomplete(sink, e))?;
        Ok(SyncSession::new(
            id,
            source.peer_name(),
            sink.peer_name(),
            options.clone(),
            seed,
        ))
    }

    /// Start a sync and run it to a terminal phase. A session that stops
    /// short of one is aborted at the sink.
    pub fn run(
        &self,
        source: &dyn FragSource,
        sink: &dyn FragSink,
        options: &PushOptions,
        seed: BTreeMap<DagId, Vec<ChangesetId>>,
    ) -> VeldResult<SyncSession> {
        let mut session = self.start(source, sink, options, seed)?;
        if let Err(e) = self.resume(&mut session, source, sink) {
            self.abort(&mut session, sink);
            return Err(e);
        }
        Ok(session)
    }

    /// Continue a session from whatever phase it is in.
    ///
    /// A transport failure leaves the session where it stopped, so calling
    /// this again only sends what the sink has not acknowledged. If the
    /// sink has meanwhile dropped its staging area, a new one is opened and
    /// negotiation starts over. Committed sessions are a no-op; rejected
    /// or aborted ones fail with `SessionClosed`.
    pub fn resume(
        &self,
        session: &mut SyncSession,
        source: &dyn FragSource,
        sink: &dyn FragSink,
    ) -> VeldResult<()> {
        let span = info_span!(
            "sync",
            session = %session.id,
            source = %session.source,
            destination = %session.destination,
        );
        let _guard = span.enter();

        match session.phase {
            SyncPhase::Committed => return Ok(()),
            SyncPhase::Rejected | SyncPhase::Aborted => {
                return Err(VeldError::SessionClosed {
                    session: session.id.to_string(),
                    phase: format!("{:?}", session.phase).to_lowercase(),
                })
            }
            _ => {}
        }

        if let Err(e) = self.negotiate(session, source, sink) {
            let e = match e {
                VeldError::SyncIncomplete(_) => e,
                other => incomplete(sink, other),
            };
            warn!(error = %e, round_trips = session.round_trips, "sync interrupted");
            return Err(e);
        }

        session.enter(SyncPhase::Validating);
        match sink.commit(&session.id, &session.options) {
            Ok(summary) => {
                session.enter(SyncPhase::Applying);
                info!(
                    applied = summary.applied.len(),
                    round_trips = session.round_trips,
                    forced = session.options.forced,
                    "sync committed"
                );
                session.summary = Some(summary);
                session.enter(SyncPhase::Committed);
                Ok(())
            }
            Err(VeldError::SessionNotFound(_)) => {
                self.restage(session, sink)?;
                let e = VeldError::SyncIncomplete(format!(
                    "{}: staging lost before commit",
                    session.destination
                ));
                warn!(error = %e, "sync interrupted");
                Err(e)
            }
            Err(e) => {
                let _ = sink.abort(&session.id);
                warn!(error = %e, "sync rejected");
                session.enter(SyncPhase::Rejected);
                Err(e)
            }
        }
    }

    /// Drop the session's staging at the sink and mark it aborted.
    pub fn abort(&self, session: &mut SyncSession, sink: &dyn FragSink) {
        if session.phase.is_terminal() {
            return;
        }
        if let Err(e) = sink.abort(&session.id) {
            debug!(session = %session.id, error = %e, "abort not delivered");
        }
        session.enter(SyncPhase::Aborted);
    }

    /// Replace a staging area the sink no longer has. Whatever it had
    /// acknowledged went with it and is sent again.
    fn restage(&self, session: &mut SyncSession, sink: &dyn FragSink) -> VeldResult<()> {
        let id = sink.begin().map_err(|e| incomplete(sink, e))?;
        warn!(old = %session.id, new = %id, "sink lost its staging, negotiating again");
        session.id = id;
        session.acknowledged.clear();
        session.negotiated.clear();
        session.enter(SyncPhase::RoundTripping);
        Ok(())
    }

    fn negotiate(
        &self,
        session: &mut SyncSession,
        source: &dyn FragSource,
        sink: &dyn FragSink,
    ) -> VeldResult<()> {
        if session.phase == SyncPhase::Planning {
            for dag in DagId::ALL {
                session.source_leaves.insert(dag, source.leaves(dag)?);
            }
            session.enter(SyncPhase::RoundTripping);
        }

        let mut restaged = false;
        'dags: loop {
            for dag in DagId::ALL {
                if session.negotiated.contains(&dag) {
                    continue;
                }
                let mut want = match (&session.options.branch, dag) {
                    (Some(branch), DagId::VersionControl) => source.branch_heads(branch)?,
                    _ => session.source_leaves.get(&dag).cloned().unwrap_or_default(),
                };

                let mut rounds = 0;
                loop {
                    rounds += 1;
                    if rounds > self.max_round_trips {
                        return Err(VeldError::SyncIncomplete(format!(
                            "{dag}: no agreement after {} round trips",
                            self.max_round_trips
                        )));
                    }
                    let frag =
                        source.build_frag(dag, &want, &session.guess(dag), &session.sent(dag))?;
                    let reply = match sink.offer(&session.id, &frag) {
                        Ok(reply) => reply,
                        Err(VeldError::SessionNotFound(_)) if !restaged => {
                            restaged = true;
                            self.restage(session, sink)?;
                            continue 'dags;
                        }
                        Err(e) => return Err(e),
                    };
                    session.round_trips += 1;
                    debug!(
                        %dag,
                        round = rounds,
                        sent = frag.changesets.len(),
                        boundary = frag.boundary.len(),
                        missing = reply.missing.len(),
                        "round trip"
                    );

                    session
                        .acknowledged
                        .entry(dag)
                        .or_default()
                        .extend(frag.ids().cloned());
                    if reply.missing.is_empty() {
                        break;
                    }
                    // The guess was stale: trust the sink's real leaves from now on.
                    session
                        .guesses
                        .insert(dag, reply.leaves.into_iter().collect());
                    want = reply.missing;
                }
                session.negotiated.insert(dag);
            }
            return Ok(());
        }
    }
}

fn incomplete(sink: &dyn FragSink, e: VeldError) -> VeldError {
    VeldError::SyncIncomplete(format!("{}: {e}", sink.peer_name()))
}

/// Order changesets so that parents inside the set come first.
pub(crate) fn topo_order(changesets: Vec<Changeset>) -> Vec<Changeset> {
    let index: HashMap<ChangesetId, usize> = changesets
        .iter()
        .enumerate()
        .map(|(i, cs)| (cs.id.clone(), i))
        .collect();
    let mut visited = vec![false; changesets.len()];
    let mut order = Vec::with_capacity(changesets.len());

    for start in 0..changesets.len() {
        if visited[start] {
            continue;
        }
        // (node, next parent to visit)
        let mut stack = vec![(start, 0usize)];
        visited[start] = true;
        while let Some((node, next)) = stack.pop() {
            let parents = &changesets[node].parents;
            if next < parents.len() {
                stack.push((node, next + 1));
                if let Some(&p) = index.get(&parents[next]) {
                    if !visited[p] {
                        visited[p] = true;
                        stack.push((p, 0));
                    }
                }
            } else {
                order.push(node);
            }
        }
    }

    let mut slots: Vec<Option<Changeset>> = changesets.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}
