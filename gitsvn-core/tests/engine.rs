//! End-to-end commit and read scenarios against in-memory and on-disk
//! repositories

use gitsvn_core::{
    Branch, CommitBuilder, Error, FileMode, LfsConfig, MemoryLfsStorage, MemoryLockStorage,
    MemoryObjectStore, ObjectKind, Pointer, Properties, Repository, RepositoryConfig, User,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn alice() -> User {
    User::new("alice", "Alice", "alice@example.com")
}

fn lfs_config() -> RepositoryConfig {
    RepositoryConfig {
        lfs: Some(LfsConfig::default()),
        ..Default::default()
    }
}

async fn builder(branch: &Arc<Branch>) -> CommitBuilder {
    branch
        .create_commit_builder(alice(), BTreeMap::new())
        .await
        .unwrap()
}

/// Add a file with the properties the current rules expect
async fn add_file(builder: &mut CommitBuilder, name: &str, content: &[u8]) {
    let mut update = builder.create_file(name).unwrap();
    let props = update.derive_properties(FileMode::Regular, content);
    update.set_properties(props);
    update.write_content(content).unwrap();
    builder.save_file(update, false).await.unwrap();
}

async fn modify_file(builder: &mut CommitBuilder, name: &str, content: &[u8]) {
    let mut update = builder.modify_file(name).unwrap();
    let props = update.derive_properties(FileMode::Regular, content);
    update.set_properties(props);
    update.write_content(content).unwrap();
    builder.save_file(update, true).await.unwrap();
}

/// Non-NUL content of `len` bytes
fn big_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

#[tokio::test]
async fn test_commit_and_read_file() {
    let repo = Repository::in_memory(RepositoryConfig::default());
    let branch = repo.default_branch().await.unwrap();

    let mut b = builder(&branch).await;
    add_file(&mut b, "a.txt", b"hello").await;
    let revision = b.commit(&alice(), "add a").await.unwrap();
    assert_eq!(revision.id, 1);
    assert_eq!(revision.message, "add a");

    let file = branch.file(1, "/a.txt").await.unwrap().unwrap();
    assert_eq!(file.read_all().await.unwrap(), b"hello");
    assert_eq!(file.size().await.unwrap(), 5);
    assert_eq!(
        file.content_digest().await.unwrap(),
        format!("{:x}", md5::compute(b"hello"))
    );
    assert_eq!(file.last_change().await.unwrap().id, 1);
    assert!(branch.file(0, "/a.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_lfs_content_in_later_commit() {
    let repo = Repository::in_memory(lfs_config());
    let branch = repo.default_branch().await.unwrap();

    let mut b = builder(&branch).await;
    add_file(&mut b, ".gitattributes", b"*.bin filter=lfs\n").await;
    b.commit(&alice(), "track bin files").await.unwrap();

    let content = big_content(10 * 1024 * 1024);
    let mut b = builder(&branch).await;
    add_file(&mut b, "big.bin", &content).await;
    b.commit(&alice(), "add big.bin").await.unwrap();

    let file = branch.file(2, "/big.bin").await.unwrap().unwrap();
    let stored = repo
        .context()
        .store
        .open_kind(file.id(), ObjectKind::Blob)
        .await
        .unwrap();
    let pointer = Pointer::parse(&stored).unwrap();
    assert_eq!(pointer.size(), 10_485_760);
    assert_eq!(file.size().await.unwrap(), 10_485_760);
    assert!(file.read_all().await.unwrap() == content);
}

#[tokio::test]
async fn test_lfs_content_with_rule_in_same_commit() {
    let repo = Repository::in_memory(lfs_config());
    let branch = repo.default_branch().await.unwrap();

    let content = big_content(10 * 1024 * 1024);
    let mut b = builder(&branch).await;
    add_file(&mut b, ".gitattributes", b"*.bin filter=lfs\n").await;
    b.add_dir("data").await.unwrap();
    add_file(&mut b, "big.bin", &content).await;
    b.close_dir().await.unwrap();
    b.commit(&alice(), "track and add").await.unwrap();

    let file = branch.file(1, "/data/big.bin").await.unwrap().unwrap();
    let stored = repo
        .context()
        .store
        .open_kind(file.id(), ObjectKind::Blob)
        .await
        .unwrap();
    assert_eq!(Pointer::parse(&stored).unwrap().size(), 10_485_760);
    assert!(file.read_all().await.unwrap() == content);
}

#[tokio::test]
async fn test_lfs_object_missing_from_storage() {
    let lfs = MemoryLfsStorage::new();
    let repo = Repository::new(
        Arc::new(MemoryObjectStore::new()),
        Some(Arc::new(lfs.clone())),
        Arc::new(MemoryLockStorage::new()),
        lfs_config(),
        "test-uuid".to_string(),
    );
    let branch = repo.default_branch().await.unwrap();

    let mut b = builder(&branch).await;
    add_file(&mut b, ".gitattributes", b"*.bin filter=lfs\n").await;
    add_file(&mut b, "a.bin", b"payload").await;
    b.commit(&alice(), "add").await.unwrap();

    let file = branch.file(1, "/a.bin").await.unwrap().unwrap();
    let stored = repo
        .context()
        .store
        .open_kind(file.id(), ObjectKind::Blob)
        .await
        .unwrap();
    let pointer = Pointer::parse(&stored).unwrap();
    lfs.remove(pointer.oid());
    assert!(matches!(file.open_read().await, Err(Error::ForbiddenContent(_))));
}

#[tokio::test]
async fn test_stale_base_is_out_of_date() {
    let repo = Repository::in_memory(RepositoryConfig::default());
    let branch = repo.default_branch().await.unwrap();
    let mut b = builder(&branch).await;
    add_file(&mut b, "a.txt", b"one").await;
    b.commit(&alice(), "r1").await.unwrap();

    let mut b = builder(&branch).await;
    modify_file(&mut b, "a.txt", b"two").await;
    b.commit(&alice(), "r2").await.unwrap();

    // a client still at r1 edits a.txt
    let b = builder(&branch).await;
    assert!(matches!(
        b.check_up_to_date("/a.txt", 1, false).await,
        Err(Error::OutOfDate(_))
    ));
    b.check_up_to_date("/a.txt", 2, false).await.unwrap();
    assert!(matches!(
        b.check_up_to_date("/missing", 2, false).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_push_is_rejected() {
    let repo = Repository::in_memory(RepositoryConfig::default());
    let branch = repo.default_branch().await.unwrap();

    let mut first = builder(&branch).await;
    let mut second = builder(&branch).await;
    add_file(&mut first, "a.txt", b"a").await;
    add_file(&mut second, "b.txt", b"b").await;

    first.commit(&alice(), "a").await.unwrap();
    let err = second.commit(&alice(), "b").await.unwrap_err();
    assert!(matches!(err, Error::OutOfDate(_)));
    assert!(err.is_retryable());
    assert_eq!(branch.latest_revision().await.id, 1);
}

#[tokio::test]
async fn test_new_builder_sees_commit_from_other_handle() {
    let store = Arc::new(MemoryObjectStore::new());
    let open = || {
        Repository::new(
            store.clone(),
            None,
            Arc::new(MemoryLockStorage::new()),
            RepositoryConfig::default(),
            "shared".to_string(),
        )
    };
    let (first, second) = (open(), open());
    let first_branch = first.default_branch().await.unwrap();
    let second_branch = second.default_branch().await.unwrap();

    let mut b = builder(&first_branch).await;
    add_file(&mut b, "a.txt", b"a").await;
    b.commit(&alice(), "from first").await.unwrap();

    let mut b = builder(&second_branch).await;
    assert_eq!(b.base_revision().id, 1);
    add_file(&mut b, "b.txt", b"b").await;
    let revision = b.commit(&alice(), "from second").await.unwrap();
    assert_eq!(revision.id, 2);
    assert!(second_branch.file(2, "/a.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_commits_converge_with_retry() {
    let repo = Repository::in_memory(RepositoryConfig::default());
    let branch = repo.default_branch().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let branch = branch.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("file{}.txt", i);
            loop {
                let mut b = branch
                    .create_commit_builder(alice(), BTreeMap::new())
                    .await
                    .unwrap();
                add_file(&mut b, &name, name.as_bytes()).await;
                match b.commit(&alice(), &name).await {
                    Ok(revision) => return revision.id,
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => panic!("commit failed: {}", e),
                }
            }
        }));
    }
    let mut ids: Vec<u64> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    ids.sort();
    assert_eq!(ids, (1..=8).collect::<Vec<u64>>());

    let root = branch.root(8).await.unwrap();
    assert_eq!(root.entries().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_keep_file_lifecycle() {
    let repo = Repository::in_memory(RepositoryConfig::default());
    let branch = repo.default_branch().await.unwrap();

    let mut b = builder(&branch).await;
    b.add_dir("docs").await.unwrap();
    b.close_dir().await.unwrap();
    b.commit(&alice(), "mkdir").await.unwrap();

    let mut b = builder(&branch).await;
    b.open_dir("docs").await.unwrap();
    add_file(&mut b, "readme.txt", b"docs").await;
    b.close_dir().await.unwrap();
    b.commit(&alice(), "add readme").await.unwrap();

    let docs = branch.file(2, "/docs").await.unwrap().unwrap();
    let names: Vec<&str> = docs.entries().await.unwrap().iter().map(|n| n.name()).collect();
    assert_eq!(names, vec!["readme.txt"]);

    let mut b = builder(&branch).await;
    b.open_dir("docs").await.unwrap();
    b.delete("readme.txt").await.unwrap();
    b.close_dir().await.unwrap();
    b.commit(&alice(), "empty docs").await.unwrap();

    let docs = branch.file(3, "/docs").await.unwrap().unwrap();
    let names: Vec<&str> = docs.entries().await.unwrap().iter().map(|n| n.name()).collect();
    assert_eq!(names, vec![".keep"]);

    let mut b = builder(&branch).await;
    b.open_dir("docs").await.unwrap();
    add_file(&mut b, "guide.txt", b"guide").await;
    b.close_dir().await.unwrap();
    b.commit(&alice(), "add guide").await.unwrap();

    let docs = branch.file(4, "/docs").await.unwrap().unwrap();
    let names: Vec<&str> = docs.entries().await.unwrap().iter().map(|n| n.name()).collect();
    assert_eq!(names, vec!["guide.txt"]);
}

#[tokio::test]
async fn test_property_mismatch_leaves_head() {
    let repo = Repository::in_memory(RepositoryConfig::default());
    let branch = repo.default_branch().await.unwrap();
    let mut b = builder(&branch).await;
    add_file(&mut b, ".gitattributes", b"*.txt eol=native\n*.png binary\n").await;
    b.commit(&alice(), "rules").await.unwrap();
    let head = branch.latest_revision().await;

    let mut b = builder(&branch).await;
    for name in ["a.txt", "b.txt", "c.png"] {
        let mut update = b.create_file(name).unwrap();
        update.write_content(b"data").unwrap();
        b.save_file(update, false).await.unwrap();
    }
    let Err(Error::PropertyMismatch(report)) = b.commit(&alice(), "no props").await else {
        panic!("expected property mismatch");
    };
    assert_eq!(report.paths(), vec!["/a.txt", "/b.txt", "/c.png"]);
    assert!(report.to_string().contains(".gitattributes"));
    assert_eq!(branch.latest_revision().await, head);
}

#[tokio::test]
async fn test_lock_tokens_are_checked_and_released() {
    let locks = Arc::new(MemoryLockStorage::new());
    let repo = Repository::new(
        Arc::new(MemoryObjectStore::new()),
        None,
        locks.clone(),
        RepositoryConfig::default(),
        "test-uuid".to_string(),
    );
    let branch = repo.default_branch().await.unwrap();
    let mut b = builder(&branch).await;
    add_file(&mut b, "a.txt", b"one").await;
    b.commit(&alice(), "r1").await.unwrap();

    let lock = locks
        .lock(&alice(), Some("master"), "/a.txt", None, false)
        .await
        .unwrap();

    let b = builder(&branch).await;
    assert!(matches!(
        b.check_up_to_date("/a.txt", 1, true).await,
        Err(Error::BadLockToken(_))
    ));
    // the lock is below the root
    assert!(matches!(
        b.check_up_to_date("/", 1, true).await,
        Err(Error::BadLockToken(_))
    ));

    let mut presented = BTreeMap::new();
    presented.insert(lock.path.clone(), lock.token.clone());
    let mut b = branch
        .create_commit_builder(alice(), presented.clone())
        .await
        .unwrap();
    b.check_up_to_date("/a.txt", 1, true).await.unwrap();
    modify_file(&mut b, "a.txt", b"two").await;
    b.commit(&alice(), "r2").await.unwrap();
    assert!(locks.is_empty().await);

    // keep_locks leaves the lock in place
    let lock = locks
        .lock(&alice(), None, "/a.txt", None, false)
        .await
        .unwrap();
    let mut presented = BTreeMap::new();
    presented.insert(lock.path.clone(), lock.token);
    let mut b = branch.create_commit_builder(alice(), presented).await.unwrap();
    b.keep_locks(true);
    modify_file(&mut b, "a.txt", b"three").await;
    b.commit(&alice(), "r3").await.unwrap();
    assert_eq!(locks.len().await, 1);
}

#[tokio::test]
async fn test_directory_auto_props() {
    let repo = Repository::in_memory(RepositoryConfig::default());
    let branch = repo.default_branch().await.unwrap();
    let mut b = builder(&branch).await;
    b.add_dir("src").await.unwrap();
    add_file(&mut b, ".gitattributes", b"*.rs eol=lf\n/build/** binary\n").await;
    b.close_dir().await.unwrap();
    b.commit(&alice(), "rules").await.unwrap();

    let src = branch.file(1, "/src").await.unwrap().unwrap();
    let mut expected = Properties::new();
    expected.insert(
        "svn:auto-props".to_string(),
        "*.rs = svn:eol-style=LF\n".to_string(),
    );
    assert_eq!(src.properties().await.unwrap(), &expected);
    assert!(branch.root(1).await.unwrap().properties().await.unwrap().is_empty());

    let mut b = builder(&branch).await;
    b.open_dir("src").await.unwrap();
    add_file(&mut b, "main.rs", b"fn main() {}\n").await;
    b.close_dir().await.unwrap();
    b.commit(&alice(), "main").await.unwrap();
    let main = branch.file(2, "/src/main.rs").await.unwrap().unwrap();
    assert_eq!(main.properties().await.unwrap()["svn:eol-style"], "LF");
}

#[tokio::test]
async fn test_disk_repository_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let repo = Repository::init(temp_dir.path(), &lfs_config()).unwrap();
        let branch = repo.default_branch().await.unwrap();
        let mut b = builder(&branch).await;
        add_file(&mut b, ".gitattributes", b"*.bin filter=lfs\n").await;
        add_file(&mut b, "a.txt", b"hello").await;
        add_file(&mut b, "blob.bin", b"stored outside git").await;
        b.commit(&alice(), "initial").await.unwrap();
    }

    let repo = Repository::open(temp_dir.path()).unwrap();
    let branch = repo.default_branch().await.unwrap();
    let latest = branch.latest_revision().await;
    assert_eq!(latest.id, 1);
    assert_eq!(latest.author, "Alice");
    let file = branch.file(1, "/a.txt").await.unwrap().unwrap();
    assert_eq!(file.read_all().await.unwrap(), b"hello");
    let blob = branch.file(1, "/blob.bin").await.unwrap().unwrap();
    assert_eq!(blob.read_all().await.unwrap(), b"stored outside git");
}
