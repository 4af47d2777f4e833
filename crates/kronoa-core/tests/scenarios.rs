//! The six literal end-to-end scenarios from `spec.md` §8.

use std::sync::Arc;

use bytes::Bytes;
use kronoa_backend::MemoryBackend;
use kronoa_core::Repository;
use kronoa_error::{KronoaError, PointerSource};
use kronoa_path::{BackendKey, ContentPath};
use kronoa_session::ReadonlyOpen;

fn repo() -> Repository {
    Repository::new(Arc::new(MemoryBackend::new()))
}

#[tokio::test]
async fn scenario_1_simple_publish() {
    let repo = repo();
    repo.init_genesis().await.unwrap();

    let mut session = repo.checkout("alice", PointerSource::Staging).await.unwrap();
    assert_eq!(session.edition(), 10001);
    let path = ContentPath::try_from("articles/my-post.md").unwrap();
    session.write(path.clone(), Bytes::from("A")).await.unwrap();
    session.submit("add post".into()).await.unwrap();

    repo.stage(10001).await.unwrap();
    repo.deploy().await.unwrap();

    let production = repo.open_readonly(ReadonlyOpen::Production).await.unwrap();
    assert_eq!(production.read(&path).await.unwrap(), Bytes::from("A"));
    let dir = BackendKey::try_from("articles/").unwrap();
    assert_eq!(production.list(&dir).await.unwrap(), vec!["my-post.md".to_string()]);
}

#[tokio::test]
async fn scenario_2_atomic_multi_write() {
    let repo = repo();
    repo.init_genesis().await.unwrap();

    // Produce edition 10001 with config.json/version.txt at v1.
    let config = ContentPath::try_from("config.json").unwrap();
    let version = ContentPath::try_from("version.txt").unwrap();
    let mut seed = repo.checkout("seed", PointerSource::Staging).await.unwrap();
    seed.write(config.clone(), Bytes::from("config v1")).await.unwrap();
    seed.write(version.clone(), Bytes::from("version 1.0.0")).await.unwrap();
    seed.submit("seed v1".into()).await.unwrap();
    repo.stage(10001).await.unwrap();
    repo.deploy().await.unwrap();

    // Capture a production session before bob's changes go live.
    let before = repo.open_readonly(ReadonlyOpen::Production).await.unwrap();

    let mut bob = repo.checkout("bob", PointerSource::Staging).await.unwrap();
    bob.begin().unwrap();
    bob.write(config.clone(), Bytes::from(r#"{"version":"2.0"}"#)).await.unwrap();
    bob.write(version.clone(), Bytes::from("2.0.0")).await.unwrap();
    bob.commit().await.unwrap();
    let edition = bob.edition();
    bob.submit("bump to v2".into()).await.unwrap();

    repo.stage(edition).await.unwrap();
    // Staged but not yet deployed: the earlier production session (and a
    // fresh one, since production hasn't moved) still observes v1.
    assert_eq!(before.read(&config).await.unwrap(), Bytes::from("config v1"));
    let still_v1 = repo.open_readonly(ReadonlyOpen::Production).await.unwrap();
    assert_eq!(still_v1.read(&version).await.unwrap(), Bytes::from("version 1.0.0"));

    repo.deploy().await.unwrap();
    let after = repo.open_readonly(ReadonlyOpen::Production).await.unwrap();
    assert_eq!(after.read(&config).await.unwrap(), Bytes::from(r#"{"version":"2.0"}"#));
    assert_eq!(after.read(&version).await.unwrap(), Bytes::from("2.0.0"));
}

#[tokio::test]
async fn scenario_3_conflict_on_stage() {
    let repo = repo();
    repo.init_genesis().await.unwrap();

    let mut seed = repo.checkout("seed", PointerSource::Staging).await.unwrap();
    seed.write(ContentPath::try_from("seed.txt").unwrap(), Bytes::from("s")).await.unwrap();
    seed.submit("seed".into()).await.unwrap();
    repo.stage(10001).await.unwrap();
    repo.deploy().await.unwrap();

    let mut first = repo.checkout("first", PointerSource::Staging).await.unwrap();
    first.write(ContentPath::try_from("a.txt").unwrap(), Bytes::from("a")).await.unwrap();
    first.submit("a".into()).await.unwrap();
    let mut second = repo.checkout("second", PointerSource::Staging).await.unwrap();
    second.write(ContentPath::try_from("b.txt").unwrap(), Bytes::from("b")).await.unwrap();
    second.submit("b".into()).await.unwrap();

    assert_eq!((first.edition(), second.edition()), (10002, 10003));

    repo.stage(10002).await.unwrap();
    let err = repo.stage(10003).await.unwrap_err();
    assert!(matches!(
        err,
        KronoaError::ConflictDetected { base: 10001, current: 10002, source: PointerSource::Staging }
    ));
    assert!(repo.list_pending().await.unwrap().contains(&10003));
}

#[tokio::test]
async fn scenario_4_hotfix_and_orphaned_edition() {
    let repo = repo();
    repo.init_genesis().await.unwrap();

    let mut seed = repo.checkout("seed", PointerSource::Staging).await.unwrap();
    seed.write(ContentPath::try_from("seed.txt").unwrap(), Bytes::from("s")).await.unwrap();
    seed.submit("seed".into()).await.unwrap();
    repo.stage(10001).await.unwrap();
    repo.deploy().await.unwrap();

    let mut draft = repo.checkout("draft", PointerSource::Staging).await.unwrap();
    draft.write(ContentPath::try_from("draft.txt").unwrap(), Bytes::from("d")).await.unwrap();
    draft.submit("draft".into()).await.unwrap();
    let mut hotfix = repo.checkout("hotfix", PointerSource::Production).await.unwrap();
    hotfix.write(ContentPath::try_from("hotfix.txt").unwrap(), Bytes::from("h")).await.unwrap();
    hotfix.submit("hotfix".into()).await.unwrap();

    assert_eq!((draft.edition(), hotfix.edition()), (10002, 10003));

    repo.stage(10003).await.unwrap();
    repo.deploy().await.unwrap();

    let err = repo.stage(10002).await.unwrap_err();
    assert!(matches!(
        err,
        KronoaError::ConflictDetected { base: 10001, current: 10003, source: PointerSource::Staging }
    ));
}

#[tokio::test]
async fn scenario_5_discard_restores_ancestor() {
    let repo = repo();
    let hex = repo.objects().put(Bytes::from("original")).await.unwrap();
    let key = BackendKey::try_from("editions/10000/data.txt").unwrap();
    repo.backend().write(&key, Bytes::from(format!("sha256:{hex}"))).await.unwrap();
    repo.init_genesis().await.unwrap();

    let mut dave = repo.checkout("dave", PointerSource::Staging).await.unwrap();
    let path = ContentPath::try_from("data.txt").unwrap();
    dave.write(path.clone(), Bytes::from("wrong")).await.unwrap();
    assert_eq!(dave.read(&path).await.unwrap(), Bytes::from("wrong"));

    dave.discard(&path).await.unwrap();
    assert_eq!(dave.read(&path).await.unwrap(), Bytes::from("original"));
}

#[tokio::test]
async fn scenario_6_rollback() {
    let repo = repo();
    repo.init_genesis().await.unwrap();

    let welcome = ContentPath::try_from("welcome.txt").unwrap();
    let mut first = repo.checkout("first", PointerSource::Staging).await.unwrap();
    first.write(welcome.clone(), Bytes::from("Welcome")).await.unwrap();
    first.submit("welcome".into()).await.unwrap();
    repo.stage(10001).await.unwrap();
    repo.deploy().await.unwrap();

    let mut second = repo.checkout("second", PointerSource::Staging).await.unwrap();
    second.write(welcome.clone(), Bytes::from("BROKEN")).await.unwrap();
    second.submit("broken".into()).await.unwrap();
    repo.stage(10002).await.unwrap();
    repo.deploy().await.unwrap();

    repo.set_staging_pointer(10001).await.unwrap();
    repo.deploy().await.unwrap();

    let production = repo.open_readonly(ReadonlyOpen::Production).await.unwrap();
    assert_eq!(production.read(&welcome).await.unwrap(), Bytes::from("Welcome"));
}
