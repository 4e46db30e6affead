//! End-to-end push and fetch scenarios over the in-memory depot and a
//! scratch Git repository.

use fusion::core::assign::{Assigner, PreReceiveTuple};
use fusion::core::g2p::G2P;
use fusion::core::p2g::P2G;
use fusion::git::{MaybeZeroSha1, Sha1};
use fusion::testing::{test_context_with_git, InMemoryDepot, ScratchGitRepo};

fn tuple(old: Option<Sha1>, new: Sha1, ref_name: &str) -> PreReceiveTuple {
    PreReceiveTuple {
        old_sha1: old.into(),
        new_sha1: MaybeZeroSha1::from(new),
        ref_name: ref_name.to_string(),
    }
}

fn push(
    ctx: &fusion::core::context::Context,
    tuples: Vec<PreReceiveTuple>,
) -> fusion::core::g2p::G2PSummary {
    let assignments = Assigner::new(ctx, tuples.clone()).assign().unwrap();
    let mut g2p = G2P::new(ctx, assignments);
    g2p.copy(&tuples).unwrap()
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[test]
fn test_initial_linear_push() {
    let scratch = ScratchGitRepo::new();
    let a = scratch.commit(&[], &[("f", "x")]);
    let b = scratch.commit(&[a], &[("f", "y")]);
    let c = scratch.commit(&[b], &[("f", "y"), ("g", "z")]);
    scratch.set_ref("refs/heads/master", c);

    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);
    let summary = push(&ctx, vec![tuple(None, c, "refs/heads/master")]);

    // Three changelists, in commit order, strictly ascending.
    assert_eq!(summary.submitted.len(), 3);
    let shas: Vec<Sha1> = summary.submitted.iter().map(|(sha1, _, _)| *sha1).collect();
    assert_eq!(shas, vec![a, b, c]);
    let changes: Vec<u64> = summary
        .submitted
        .iter()
        .map(|(_, _, change_num)| *change_num)
        .collect();
    assert!(changes.windows(2).all(|pair| pair[0] < pair[1]));

    // Each description names its commit.
    for (sha1, _, change_num) in &summary.submitted {
        let description = depot.change_description(*change_num).unwrap();
        assert!(description.contains(&sha1.to_string()));
    }

    // File actions per changelist.
    assert_eq!(
        depot.change_files(changes[0]),
        vec![("//depot/main/f".to_string(), "add".to_string())]
    );
    assert_eq!(
        depot.change_files(changes[1]),
        vec![("//depot/main/f".to_string(), "edit".to_string())]
    );
    assert_eq!(
        depot.change_files(changes[2]),
        vec![("//depot/main/g".to_string(), "add".to_string())]
    );
    assert_eq!(depot.head_content("//depot/main/f"), Some(b"y".to_vec()));
    assert_eq!(depot.head_content("//depot/main/g"), Some(b"z".to_vec()));

    // The mirror holds a record for every commit, all on master.
    let mirror = ctx.object_mirror();
    for (sha1, _, change_num) in &summary.submitted {
        assert_eq!(
            mirror
                .change_num_for_commit(ctx.mirror_conn(), *sha1, "master")
                .unwrap(),
            Some(*change_num)
        );
    }
}

#[test]
fn test_push_is_idempotent() {
    let scratch = ScratchGitRepo::new();
    let a = scratch.commit(&[], &[("f", "x")]);
    scratch.set_ref("refs/heads/master", a);

    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);
    let first = push(&ctx, vec![tuple(None, a, "refs/heads/master")]);
    assert_eq!(first.submitted.len(), 1);

    // Re-pushing the same commit submits nothing new.
    let second = push(&ctx, vec![tuple(None, a, "refs/heads/master")]);
    assert!(second.submitted.is_empty());
}

#[test]
fn test_parallel_branch_push_emits_ghost() {
    let scratch = ScratchGitRepo::new();
    let a = scratch.commit(&[], &[("f", "base")]);
    scratch.set_ref("refs/heads/master", a);

    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);
    push(&ctx, vec![tuple(None, a, "refs/heads/master")]);
    let master_head = depot.head_content("//depot/main/f");

    // Two commits on a new feature ref branching from master's head.
    let f1 = scratch.commit(&[a], &[("f", "base"), ("g", "one")]);
    let f2 = scratch.commit(&[f1], &[("f", "base"), ("g", "two")]);
    scratch.set_ref("refs/heads/feature", f2);
    let summary = push(&ctx, vec![tuple(None, f2, "refs/heads/feature")]);

    // A ghost changelist branched `f` onto the feature region, then two
    // commit changelists followed.
    assert_eq!(summary.ghost_changes.len(), 1);
    assert_eq!(summary.submitted.len(), 2);
    let feature_branch = ctx.branch_for_git_name("feature").unwrap();
    assert!(feature_branch.is_lightweight);
    assert!(feature_branch.depot_branch_id.is_some());

    let ghost_files = depot.change_files(summary.ghost_changes[0]);
    assert_eq!(ghost_files.len(), 1);
    assert!(ghost_files[0].0.ends_with("/f"));
    assert_eq!(ghost_files[0].1, "branch");
    let ghost_desc = depot
        .change_description(summary.ghost_changes[0])
        .unwrap();
    let parsed = fusion::core::changedesc::ChangeDesc::parse(&ghost_desc);
    assert_eq!(parsed.ghost.precedes_sha1, Some(f1));

    // Master itself is untouched.
    assert_eq!(depot.head_content("//depot/main/f"), master_head);
    assert_eq!(depot.head_content("//depot/main/g"), None);
}

#[test]
fn test_ghost_double_changelist_for_delete_from_basis() {
    let scratch = ScratchGitRepo::new();
    let a = scratch.commit(&[], &[("a", "1")]);
    scratch.set_ref("refs/heads/master", a);

    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);
    push(&ctx, vec![tuple(None, a, "refs/heads/master")]);

    // The feature commit deletes `a` (never stored on the feature
    // region) and adds `b`.
    let f = scratch.commit(&[a], &[("b", "2")]);
    scratch.set_ref("refs/heads/feature", f);
    let summary = push(&ctx, vec![tuple(None, f, "refs/heads/feature")]);

    // First ghost branches `a` in from the basis; the second deletes it;
    // the real changelist adds only `b`.
    assert_eq!(summary.ghost_changes.len(), 2);
    let ghost_one = depot.change_files(summary.ghost_changes[0]);
    assert_eq!(ghost_one.len(), 1);
    assert!(ghost_one[0].0.ends_with("/a"));
    assert_eq!(ghost_one[0].1, "branch");
    let ghost_two = depot.change_files(summary.ghost_changes[1]);
    assert_eq!(ghost_two.len(), 1);
    assert!(ghost_two[0].0.ends_with("/a"));
    assert_eq!(ghost_two[0].1, "delete");

    assert_eq!(summary.submitted.len(), 1);
    let (_, _, real_change) = summary.submitted[0];
    let real_files = depot.change_files(real_change);
    assert_eq!(real_files.len(), 1);
    assert!(real_files[0].0.ends_with("/b"));
    assert_eq!(real_files[0].1, "add");
}

#[test]
fn test_merge_commit_integrates_from_both_sources() {
    let scratch = ScratchGitRepo::new();
    let a = scratch.commit(&[], &[("f", "1")]);
    scratch.set_ref("refs/heads/master", a);

    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);
    push(&ctx, vec![tuple(None, a, "refs/heads/master")]);

    let side = scratch.commit(&[a], &[("f", "1"), ("s", "side")]);
    let main2 = scratch.commit(&[a], &[("f", "2")]);
    let merge = scratch.commit(&[main2, side], &[("f", "2"), ("s", "side")]);
    scratch.set_ref("refs/heads/master", merge);
    let summary = push(&ctx, vec![tuple(Some(a), merge, "refs/heads/master")]);

    // The side commit landed on an anonymous lightweight branch; the
    // merge landed on master as one changelist whose `s` arrived by
    // integration from the side branch's region.
    let (_, merge_branch, merge_change) = summary
        .submitted
        .iter()
        .find(|(sha1, _, _)| *sha1 == merge)
        .cloned()
        .unwrap();
    assert_eq!(merge_branch, "master");
    let merge_files = depot.change_files(merge_change);
    assert_eq!(merge_files.len(), 1);
    assert_eq!(merge_files[0].0, "//depot/main/s");
    assert_eq!(merge_files[0].1, "branch");

    let description = depot.change_description(merge_change).unwrap();
    let parsed = fusion::core::changedesc::ChangeDesc::parse(&description);
    assert_eq!(parsed.parents, vec![main2, side]);

    let (_, side_branch, _) = summary
        .submitted
        .iter()
        .find(|(sha1, _, _)| *sha1 == side)
        .cloned()
        .unwrap();
    assert!(side_branch.starts_with("anon-"));
}

#[test]
fn test_depot_to_git_copy_and_restart() {
    if !git_available() {
        eprintln!("git not found on PATH; skipping");
        return;
    }
    let scratch = ScratchGitRepo::new();
    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);

    let change1 = depot.submit_change("alice", &[("//depot/main/f", b"x".to_vec())], "add f");
    let change2 = depot.submit_change("alice", &[("//depot/main/f", b"y".to_vec())], "edit f");

    let summary = P2G::new(&ctx).copy(None).unwrap();
    assert_eq!(summary.copied_changes, vec![change1, change2]);
    let master_sha = summary.ref_updates.get("refs/heads/master").copied().unwrap();
    let git_repo = ctx.git_repo().unwrap();
    assert_eq!(git_repo.resolve_ref("refs/heads/master").unwrap(), Some(master_sha));
    let head = git_repo.find_commit(master_sha).unwrap().unwrap();
    assert_eq!(head.parents.len(), 1);
    assert_eq!(ctx.read_last_copied_change().unwrap(), Some(change2));

    // Restart with no new changes: nothing to do, refs untouched.
    let summary = P2G::new(&ctx).copy(None).unwrap();
    assert!(summary.copied_changes.is_empty());

    // A third change continues from the recorded high-water mark.
    let change3 = depot.submit_change("alice", &[("//depot/main/g", b"z".to_vec())], "add g");
    let summary = P2G::new(&ctx).copy(None).unwrap();
    assert_eq!(summary.copied_changes, vec![change3]);
    assert_eq!(ctx.read_last_copied_change().unwrap(), Some(change3));
    let new_head = summary.ref_updates.get("refs/heads/master").copied().unwrap();
    let new_commit = git_repo.find_commit(new_head).unwrap().unwrap();
    assert_eq!(new_commit.parents, vec![master_sha]);
}

#[test]
fn test_round_trip_fusion_changelist_is_noop() {
    if !git_available() {
        eprintln!("git not found on PATH; skipping");
        return;
    }
    let scratch = ScratchGitRepo::new();
    let a = scratch.commit(&[], &[("f", "x")]);
    scratch.set_ref("refs/heads/master", a);

    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);
    push(&ctx, vec![tuple(None, a, "refs/heads/master")]);

    // Fetching right after a push discovers nothing new: the pushed
    // changelist is already mirrored.
    let summary = P2G::new(&ctx).copy(None).unwrap();
    assert!(summary.copied_changes.is_empty());
    assert!(summary.ref_updates.is_empty());
}

#[test]
fn test_empty_commit_uses_placeholder_or_rejects() {
    let scratch = ScratchGitRepo::new();
    let a = scratch.commit(&[], &[("f", "x")]);
    // An empty commit: same tree as its parent.
    let empty = scratch.commit(&[a], &[("f", "x")]);
    scratch.set_ref("refs/heads/master", empty);

    let depot = InMemoryDepot::new();
    let ctx = test_context_with_git(&depot, "repoA", &scratch);
    let tuples = vec![tuple(None, empty, "refs/heads/master")];
    let assignments = Assigner::new(&ctx, tuples.clone()).assign().unwrap();
    let mut g2p = G2P::new(&ctx, assignments);
    let summary = g2p.copy(&tuples).unwrap();

    // The branch view maps the placeholder path, so the empty commit
    // opens it instead of failing.
    assert_eq!(summary.submitted.len(), 2);
    let (_, _, empty_change) = summary.submitted[1];
    let files = depot.change_files(empty_change);
    assert_eq!(files.len(), 1);
    assert!(files[0]
        .0
        .ends_with(fusion::core::g2p::EMPTY_CHANGELIST_PLACEHOLDER));
}
