mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use common::*;
use tempfile::tempdir;
use veld_core::sync::{FragSink, Reconciler, SyncPhase, SyncSession};
use veld_core::{CommitRequest, DagId, PushOptions, Repository, VeldError};

#[test]
fn test_fast_forward_push_needs_no_force() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();

    let next = touch(&src, &user, &root, "a.txt", "a2");
    let report = src.push(&dest, &unforced()).unwrap();

    assert!(!report.is_noop());
    assert!(report.applied.contains(&next));
    assert_eq!(master_heads(&dest), vec![next]);
    assert!(dest.compare(&src));
}

#[test]
fn test_fast_forward_through_merge() {
    let (src, user, root) = seeded("src");
    let b = touch(&src, &user, &root, "a.txt", "b");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();

    let c = touch(&src, &user, &root, "b.txt", "c");
    let mut tree = src.tree(&veld_core::RevSpec::Id(b.to_string())).unwrap();
    tree.modify("b.txt", b"c").unwrap();
    let merge = src
        .commit(
            CommitRequest::new(&user, "merge", tree)
                .parent(&b)
                .parent(&c)
                .on_branch("master"),
        )
        .unwrap();

    src.push(&dest, &unforced()).unwrap();
    assert_eq!(master_heads(&dest), vec![merge.clone()]);
    assert_eq!(dest.leaves(DagId::VersionControl), vec![merge]);
}

#[test]
fn test_new_unrelated_head_requires_force() {
    // Both start at A. The source commits B, the destination is cloned
    // with {A, B}, then the source commits C from A.
    let (src, user, a) = seeded("src");
    let b = touch(&src, &user, &a, "a.txt", "b");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    let c = touch(&src, &user, &a, "b.txt", "c");

    let err = src.push(&dest, &unforced()).unwrap_err();
    match &err {
        VeldError::AmbiguousHeads { branches } => assert_eq!(branches, &vec!["master".to_string()]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.code().number(), 2301);
    assert_eq!(err.code().as_str(), "AMBIGUOUS_BRANCH_HEADS");
    // rejected pushes apply nothing
    assert_eq!(dest.leaves(DagId::VersionControl), vec![b.clone()]);
    assert!(!dest.contains(&c));

    let report = src.push(&dest, &PushOptions::forced()).unwrap();
    assert_eq!(report.ambiguous, vec!["master".to_string()]);
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(dest.leaves(DagId::VersionControl), expected);
    assert!(dest.compare(&src));
}

#[test]
fn test_fast_forward_of_one_head_keeps_existing_ambiguity() {
    let (src, user, a) = seeded("src");
    let b = touch(&src, &user, &a, "a.txt", "b");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    let c = touch(&src, &user, &a, "b.txt", "c");
    src.push(&dest, &PushOptions::forced()).unwrap();
    let mut both = vec![b.clone(), c.clone()];
    both.sort();
    assert_eq!(master_heads(&dest), both);

    // D only moves B forward; master gains no head it lacked before
    let d = touch(&src, &user, &b, "a.txt", "d");
    let report = src.push(&dest, &unforced()).unwrap();
    assert!(report.ambiguous.is_empty());
    let mut expected = vec![c, d];
    expected.sort();
    assert_eq!(master_heads(&dest), expected);
    assert!(dest.compare(&src));
}

#[test]
fn test_noop_push_after_destination_merged() {
    let (src, user, root) = seeded("src");
    let b = touch(&src, &user, &root, "a.txt", "b");
    let c = touch(&src, &user, &root, "b.txt", "c");
    assert_eq!(master_heads(&src).len(), 2);

    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    let mut tree = dest.tree(&veld_core::RevSpec::Id(b.to_string())).unwrap();
    tree.modify("b.txt", b"c").unwrap();
    let merge = dest
        .commit(
            CommitRequest::new(&user, "merge", tree)
                .parent(&b)
                .parent(&c)
                .on_branch("master"),
        )
        .unwrap();

    let report = src.push(&dest, &unforced()).unwrap();
    assert!(report.is_noop());
    assert!(report.ambiguous.is_empty());
    assert_eq!(dest.leaves(DagId::VersionControl), vec![merge.clone()]);
    assert_eq!(master_heads(&dest), vec![merge]);
}

#[test]
fn test_deep_history_against_independent_commit() {
    let src = Repository::in_memory("src");
    let alice = src.create_user("alice").unwrap();
    let mut tree = veld_core::Tree::new();
    tree.add_file("a.txt", b"0").unwrap();
    let mut head = src
        .commit(CommitRequest::new(&alice, "root", tree).on_branch("master"))
        .unwrap();
    for i in 1..=40 {
        head = touch(&src, &alice, &head, "a.txt", &i.to_string());
    }

    let dest = Repository::in_memory("dest");
    let bob = dest.create_user("bob").unwrap();
    let theirs = dest
        .commit(CommitRequest::new(&bob, "theirs", veld_core::Tree::new()).on_branch("master"))
        .unwrap();

    let err = src.push(&dest, &unforced()).unwrap_err();
    assert!(matches!(err, VeldError::AmbiguousHeads { .. }));
    assert_eq!(dest.leaves(DagId::VersionControl), vec![theirs.clone()]);
    assert_eq!(dest.users().len(), 1);

    src.push(&dest, &PushOptions::forced()).unwrap();
    let heads = master_heads(&dest);
    assert_eq!(heads.len(), 2);
    assert!(heads.contains(&head) && heads.contains(&theirs));
    assert_eq!(dest.users().len(), 2);
}

#[test]
fn test_stale_guess_is_corrected_on_second_round_trip() {
    let dir = tempdir().unwrap();
    let src_dir = dir.path().join("src");
    let remote_dir = dir.path().join("remote");
    fs::create_dir_all(&src_dir).unwrap();
    fs::create_dir_all(&remote_dir).unwrap();

    let src = Repository::init(&src_dir).unwrap();
    let alice = src.create_user("alice").unwrap();
    let mut tree = veld_core::Tree::new();
    tree.add_file("a.txt", b"0").unwrap();
    let mut head = src
        .commit(CommitRequest::new(&alice, "root", tree).on_branch("master"))
        .unwrap();
    Repository::init(&remote_dir).unwrap();
    src.remote_add("origin", remote_dir.to_str().unwrap()).unwrap();
    src.push_remote("origin", &unforced()).unwrap();

    // The remote is recreated with unrelated history; our memory of it
    // is now wrong.
    fs::remove_dir_all(&remote_dir).unwrap();
    fs::create_dir_all(&remote_dir).unwrap();
    {
        let remote = Repository::init(&remote_dir).unwrap();
        let bob = remote.create_user("bob").unwrap();
        remote
            .commit(CommitRequest::new(&bob, "theirs", veld_core::Tree::new()).on_branch("master"))
            .unwrap();
    }
    for i in 1..=10 {
        head = touch(&src, &alice, &head, "a.txt", &i.to_string());
    }

    let err = src.push_remote("origin", &unforced()).unwrap_err();
    assert!(matches!(err, VeldError::AmbiguousHeads { .. }));
    assert_eq!(
        Repository::open(&remote_dir).unwrap().leaves(DagId::VersionControl).len(),
        1
    );

    let report = src.push_remote("origin", &PushOptions::forced()).unwrap();
    assert!(report.round_trips > DagId::ALL.len() as u32);
    assert_eq!(report.ambiguous, vec!["master".to_string()]);

    let remote = Repository::open(&remote_dir).unwrap();
    assert!(remote.contains(&head));
    assert_eq!(remote.branch("master").unwrap().heads.len(), 2);
    assert_eq!(remote.leaves(DagId::VersionControl).len(), 2);
}

#[test]
fn test_branch_filter_ignores_other_branches() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();

    commit_on(&dest, &user, "dev", &root, |t| t.modify("b.txt", b"dest").unwrap());
    let s = commit_on(&src, &user, "dev", &root, |t| t.modify("b.txt", b"src").unwrap());
    let m = commit_on(&src, &user, "master", &s, |t| t.modify("a.txt", b"m").unwrap());

    let err = src.push(&dest, &unforced()).unwrap_err();
    match err {
        VeldError::AmbiguousHeads { branches } => assert_eq!(branches, vec!["dev".to_string()]),
        other => panic!("unexpected error: {other}"),
    }

    src.push(&dest, &PushOptions::branch("master")).unwrap();
    assert_eq!(master_heads(&dest), vec![m]);
    assert!(dest.branch("dev").unwrap().needs_merge);
}

#[test]
fn test_unavailable_heads_are_tolerated() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();

    let feature = commit_on(&src, &user, "feature", &root, |t| t.modify("b.txt", b"f").unwrap());
    let m = touch(&src, &user, &root, "a.txt", "m");

    src.push(&dest, &PushOptions::branch("master")).unwrap();
    assert!(!dest.contains(&feature));
    let report = dest.heads_report();
    let status = report.iter().find(|h| h.branch == "feature").unwrap();
    assert_eq!(status.csid, feature);
    assert!(!status.available);
    assert_eq!(dest.branch("feature").unwrap().heads, vec![feature.clone()]);

    // work continues on top of the partial state
    let next = touch(&dest, &user, &m, "a.txt", "n");
    src.pull(&dest, &unforced()).unwrap();
    assert_eq!(master_heads(&src), vec![next]);

    src.push(&dest, &unforced()).unwrap();
    let report = dest.heads_report();
    assert!(report.iter().all(|h| h.available));
    assert!(dest.compare(&src));
}

#[test]
fn test_push_round_trip_identity() {
    let (src, user, root) = seeded("src");
    let b = touch(&src, &user, &root, "a.txt", "b");
    let dev = commit_on(&src, &user, "dev", &b, |t| {
        t.add_file("docs/readme.md", b"hi").unwrap();
    });
    src.add_tag("v1", &b, &user).unwrap();
    src.add_comment(&dev, "first dev change", &user).unwrap();
    src.close_branch("dev", &user).unwrap();
    src.lock("b.txt", &user, "master").unwrap();

    let dest = Repository::in_memory("dest");
    let report = src.push(&dest, &unforced()).unwrap();
    assert!(!report.is_noop());
    assert!(dest.compare(&src));
    assert!(dest.compare_report(&src).identical());
    assert!(dest.branch("dev").unwrap().closed);
    assert_eq!(dest.comments(&dev).len(), 1);
    assert_eq!(dest.locks().len(), 1);

    // a second push sends nothing
    assert!(src.push(&dest, &unforced()).unwrap().is_noop());
}

#[test]
fn test_pull_is_symmetric() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    let next = touch(&src, &user, &root, "a.txt", "pulled");

    let report = dest.pull(&src, &unforced()).unwrap();
    assert!(report.applied.contains(&next));
    assert!(dest.compare(&src));
    assert!(dest.pull(&src, &unforced()).unwrap().is_noop());
}

#[test]
fn test_transport_failure_is_incomplete_and_retryable() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    touch(&src, &user, &root, "a.txt", "lost");

    let flaky = FlakySink::new(&dest, 2);
    let err = src.push(&flaky, &unforced()).unwrap_err();
    assert!(matches!(err, VeldError::SyncIncomplete(_)));
    assert!(err.code().is_retryable());
    assert_eq!(dest.leaves(DagId::VersionControl), vec![root]);
    assert!(!dest.compare(&src));

    src.push(&dest, &unforced()).unwrap();
    assert!(dest.compare(&src));
}

#[test]
fn test_compare_report_lists_differences() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    let next = touch(&src, &user, &root, "a.txt", "x");

    let report = src.compare_report(&dest);
    assert!(!report.identical());
    assert!(report.only_here[&DagId::VersionControl].contains(&next));
    assert!(report.only_there.is_empty());
}

#[test]
fn test_interrupted_session_resumes_without_resending() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    let next = touch(&src, &user, &root, "a.txt", "resumed");
    src.lock("b.txt", &user, "master").unwrap();

    let flaky = FlakySink::new(&dest, 2);
    let reconciler = Reconciler::default();
    let mut session = reconciler
        .start(&src, &flaky, &unforced(), BTreeMap::new())
        .unwrap();
    let err = reconciler.resume(&mut session, &src, &flaky).unwrap_err();
    assert!(matches!(err, VeldError::SyncIncomplete(_)));
    assert_eq!(session.phase, SyncPhase::RoundTripping);
    assert_eq!(session.negotiated.len(), 2);
    assert!(!dest.contains(&next));

    // the session survives being persisted between attempts
    let json = serde_json::to_string(&session).unwrap();
    let mut session: SyncSession = serde_json::from_str(&json).unwrap();
    flaky.offers_left.set(u32::MAX);
    reconciler.resume(&mut session, &src, &flaky).unwrap();
    assert_eq!(session.phase, SyncPhase::Committed);
    assert!(dest.contains(&next));
    assert!(dest.compare(&src));

    let offered = flaky.offered.borrow();
    let unique: BTreeSet<_> = offered.iter().collect();
    assert_eq!(unique.len(), offered.len());
}

#[test]
fn test_resume_reopens_staging_dropped_by_sink() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    touch(&src, &user, &root, "a.txt", "again");

    let flaky = FlakySink::new(&dest, 3);
    let reconciler = Reconciler::default();
    let mut session = reconciler
        .start(&src, &flaky, &unforced(), BTreeMap::new())
        .unwrap();
    reconciler.resume(&mut session, &src, &flaky).unwrap_err();

    let old = session.id.clone();
    FragSink::abort(&dest, &old).unwrap();
    flaky.offers_left.set(u32::MAX);
    reconciler.resume(&mut session, &src, &flaky).unwrap();
    assert_ne!(session.id, old);
    assert_eq!(session.phase, SyncPhase::Committed);
    assert!(dest.compare(&src));
}

#[test]
fn test_finished_sessions_do_not_resume() {
    let (src, user, root) = seeded("src");
    let dest = Repository::in_memory("dest");
    src.clone_into(&dest).unwrap();
    touch(&src, &user, &root, "a.txt", "x");

    let reconciler = Reconciler::default();
    let mut session = reconciler
        .start(&src, &dest, &unforced(), BTreeMap::new())
        .unwrap();
    reconciler.abort(&mut session, &dest);
    assert_eq!(session.phase, SyncPhase::Aborted);
    let err = reconciler.resume(&mut session, &src, &dest).unwrap_err();
    assert_eq!(err.code().as_str(), "SESSION_CLOSED");
    assert!(!err.code().is_retryable());

    let mut done = reconciler
        .run(&src, &dest, &unforced(), BTreeMap::new())
        .unwrap();
    assert_eq!(done.phase, SyncPhase::Committed);
    reconciler.resume(&mut done, &src, &dest).unwrap();
    assert!(dest.compare(&src));
}
