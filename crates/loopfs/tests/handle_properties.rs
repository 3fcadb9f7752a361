//! Behavior every execution strategy must share.
//!
//! Each test runs once per backend against real files in a temp dir.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::{join_all, try_join};
use loopfs::{
    DelegatedDriver, DriverKind, Error, FileHandle, Filesystem, FsConfig, HandleStatus,
    InlineDriver, NativeDriver, OpenMode, Whence, WatcherState,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Inline,
    Native,
    Delegated,
}

const BACKENDS: [Backend; 3] = [Backend::Inline, Backend::Native, Backend::Delegated];

fn filesystem(backend: Backend) -> Filesystem {
    match backend {
        Backend::Inline => Filesystem::new(InlineDriver::new()),
        Backend::Native => {
            let (driver, _watcher) = NativeDriver::current().unwrap();
            Filesystem::new(driver)
        }
        Backend::Delegated => Filesystem::new(DelegatedDriver::threads(2, 4)),
    }
}

async fn open(fs: &Filesystem, dir: &TempDir, name: &str, mode: OpenMode) -> FileHandle {
    fs.open_file(dir.path().join(name), mode).await.unwrap()
}

#[tokio::test]
async fn writes_land_in_call_order() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::Write).await;

        let first = handle.write("foo");
        let second = handle.write("bar");
        assert_eq!(handle.tell(), 6, "{backend:?}");
        try_join(first, second).await.unwrap();
        handle.close().await;

        let contents = std::fs::read(dir.path().join("f")).unwrap();
        assert_eq!(contents, b"foobar", "{backend:?}");
    }
}

#[tokio::test]
async fn many_queued_writes_stay_ordered() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::Write).await;

        let writes: Vec<_> = (0..64).map(|i| handle.write(format!("{i},"))).collect();
        for result in join_all(writes).await {
            result.unwrap();
        }
        handle.close().await;

        let expected: String = (0..64).map(|i| format!("{i},")).collect();
        let contents = std::fs::read_to_string(dir.path().join("f")).unwrap();
        assert_eq!(contents, expected, "{backend:?}");
    }
}

#[tokio::test]
async fn one_read_at_a_time() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"abcdefgh").unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::Read).await;

        let first = handle.read(4, None);
        assert_eq!(handle.status(), HandleStatus::ReadActive, "{backend:?}");
        let second = handle.read(4, None).await.unwrap_err();
        assert!(second.is_pending_operation(), "{backend:?}: {second}");
        assert!(handle.seek(0, Whence::Start).unwrap_err().is_pending_operation());

        assert_eq!(first.await.unwrap().as_deref(), Some(&b"abcd"[..]));
        let next = handle.read(4, None).await.unwrap();
        assert_eq!(next.as_deref(), Some(&b"efgh"[..]), "{backend:?}");
        assert_eq!(handle.read(4, None).await.unwrap(), None, "{backend:?}");
        assert!(handle.eof());
        handle.close().await;
    }
}

#[tokio::test]
async fn reads_wait_for_no_queued_writes() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::WriteRead).await;

        let write = handle.write("hello");
        assert_eq!(handle.status(), HandleStatus::WritesPending);
        let err = handle.read(5, None).await.unwrap_err();
        assert!(err.is_pending_operation(), "{backend:?}: {err}");
        write.await.unwrap();

        handle.seek(0, Whence::Start).unwrap();
        let data = handle.read(5, None).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"hello"[..]), "{backend:?}");
        handle.close().await;
    }
}

#[tokio::test]
async fn append_starts_at_end_and_reads_after_seek() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"12345678").unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::AppendRead).await;

        assert_eq!(handle.tell(), 8, "{backend:?}");
        assert_eq!(handle.read(16, None).await.unwrap(), None, "{backend:?}");

        handle.seek(0, Whence::Start).unwrap();
        let data = handle.read(16, None).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"12345678"[..]), "{backend:?}");

        // Appends ignore the position.
        handle.seek(2, Whence::Start).unwrap();
        handle.write("9").await.unwrap();
        assert_eq!(handle.tell(), 9);
        handle.close().await;

        let contents = std::fs::read(dir.path().join("f")).unwrap();
        assert_eq!(contents, b"123456789", "{backend:?}");
    }
}

#[tokio::test]
async fn truncate_grows_with_zeros() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::WriteRead).await;

        let write = handle.write("foo");
        let truncate = handle.truncate(6);
        assert_eq!(handle.size(), 6, "{backend:?}");
        try_join(write, truncate).await.unwrap();
        assert_eq!(handle.tell(), 3);

        handle.seek(0, Whence::Start).unwrap();
        let data = handle.read(16, None).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"foo\0\0\0"[..]), "{backend:?}");

        handle.truncate(2).await.unwrap();
        handle.close().await;
        let contents = std::fs::read(dir.path().join("f")).unwrap();
        assert_eq!(contents, b"fo", "{backend:?}");
    }
}

#[tokio::test]
async fn close_is_idempotent_and_notifies_once() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::Write).await;

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        handle.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let pending = handle.write("queued before close");
        futures_util::join!(handle.close(), handle.close());
        handle.close().await;

        pending.await.unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1, "{backend:?}");
        assert!(handle.is_closed());
        assert_eq!(handle.status(), HandleStatus::Closed);
        assert_eq!(handle.path(), dir.path().join("f"));
        assert_eq!(handle.mode(), OpenMode::Write);

        let contents = std::fs::read(dir.path().join("f")).unwrap();
        assert_eq!(contents, b"queued before close", "{backend:?}");
    }
}

#[tokio::test]
async fn nothing_is_admitted_after_close_or_end() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let fs = filesystem(backend);

        let closed = open(&fs, &dir, "a", OpenMode::WriteRead).await;
        closed.close().await;
        assert!(matches!(closed.write("x").await, Err(Error::Closed)));
        assert!(matches!(closed.truncate(0).await, Err(Error::Closed)));
        assert!(matches!(closed.read(1, None).await, Err(Error::Closed)));
        assert!(closed.seek(0, Whence::Start).unwrap_err().is_closed());

        let ended = open(&fs, &dir, "b", OpenMode::Write).await;
        ended.write("last").await.unwrap();
        ended.end().await;
        let err = ended.write("late").await.unwrap_err();
        assert!(err.is_closed(), "{backend:?}: {err}");

        let contents = std::fs::read(dir.path().join("b")).unwrap();
        assert_eq!(contents, b"last", "{backend:?}");
    }
}

#[tokio::test]
async fn poll_guard_settles_after_native_requests() {
    let dir = TempDir::new().unwrap();
    let (driver, watcher) = NativeDriver::current().unwrap();
    let driver = Arc::new(driver);
    let fs = Filesystem::from_driver(driver.clone());
    assert_eq!(watcher.state(), WatcherState::Disabled);

    let handle = fs
        .open_file(dir.path().join("f"), OpenMode::WriteRead)
        .await
        .unwrap();
    let writes: Vec<_> = (0..16).map(|_| handle.write("0123456789")).collect();
    for result in join_all(writes).await {
        result.unwrap();
    }
    handle.seek(0, Whence::Start).unwrap();
    handle.read(1024, None).await.unwrap();

    // Cancelled reads still balance the guard once their callback fires.
    let token = loopfs::CancellationToken::new();
    handle.seek(0, Whence::Start).unwrap();
    let read = handle.read(4, Some(token.clone()));
    token.cancel();
    let _ = read.await;

    handle.close().await;
    tokio::time::timeout(Duration::from_secs(5), watcher.wait_idle())
        .await
        .unwrap();
    assert_eq!(driver.outstanding_requests(), 0);
    assert_eq!(watcher.state(), WatcherState::Disabled);
}

#[tokio::test]
async fn delegated_opens_stay_within_worker_limit() {
    let dir = TempDir::new().unwrap();
    let driver = Arc::new(DelegatedDriver::threads(2, 8));
    let fs = Filesystem::from_driver(driver.clone());

    let mut handles = Vec::new();
    for i in 0..4 {
        let handle = fs
            .open_file(dir.path().join(format!("f{i}")), OpenMode::Write)
            .await
            .unwrap();
        handle.write(format!("file {i}")).await.unwrap();
        handles.push(handle);
    }
    assert_eq!(driver.scheduler().tracked_workers(), 2);
    let in_use: usize = driver.scheduler().load().iter().map(|(_, n)| n).sum();
    assert_eq!(in_use, 4);

    for handle in &handles {
        handle.close().await;
    }
    assert_eq!(driver.scheduler().tracked_workers(), 0);

    for i in 0..4 {
        let contents = std::fs::read_to_string(dir.path().join(format!("f{i}"))).unwrap();
        assert_eq!(contents, format!("file {i}"));
    }
}

#[tokio::test]
async fn cached_status_follows_handle_writes() {
    let dir = TempDir::new().unwrap();
    let config = FsConfig::new()
        .driver(DriverKind::Inline)
        .status_cache_ttl(Some(Duration::from_secs(60)));
    let fs = Filesystem::from_config(&config).unwrap();
    let path = dir.path().join("f");

    fs.write(&path, "abc").await.unwrap();
    assert_eq!(fs.size(&path).await.unwrap(), 3);

    let handle = fs.open_file(&path, OpenMode::Append).await.unwrap();
    handle.write("defg").await.unwrap();
    assert_eq!(fs.size(&path).await.unwrap(), 7);
    handle.close().await;
}

#[tokio::test]
async fn huge_read_length_returns_what_exists() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::ReadWrite).await;

        let data = handle.read(usize::MAX, None).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"abc"[..]), "{backend:?}");
        assert_eq!(handle.read(1 << 40, None).await.unwrap(), None, "{backend:?}");
        assert_eq!(handle.status(), HandleStatus::Idle);

        handle.seek(0, Whence::Start).unwrap();
        handle.write("x").await.unwrap();
        let rest = handle.read(usize::MAX, None).await.unwrap();
        assert_eq!(rest.as_deref(), Some(&b"bc"[..]), "{backend:?}");
        handle.close().await;
    }
}

#[tokio::test]
async fn cancelled_delegated_read_leaves_worker_usable() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("f"), b"abcdef").unwrap();
    let driver = Arc::new(DelegatedDriver::threads(1, 1));
    let fs = Filesystem::from_driver(driver.clone());
    let handle = open(&fs, &dir, "f", OpenMode::Read).await;

    let token = loopfs::CancellationToken::new();
    let read = handle.read(3, Some(token.clone()));
    token.cancel();
    assert!(matches!(read.await, Err(Error::Cancelled)));
    assert_eq!(handle.status(), HandleStatus::Idle);
    assert_eq!(handle.tell(), 0);

    let data = handle.read(3, None).await.unwrap();
    assert_eq!(data.as_deref(), Some(&b"abc"[..]));
    let other = open(&fs, &dir, "f", OpenMode::Read).await;
    assert_eq!(driver.scheduler().tracked_workers(), 1);
    let data = other.read(6, None).await.unwrap();
    assert_eq!(data.as_deref(), Some(&b"abcdef"[..]));

    handle.close().await;
    other.close().await;
}

fn write_chunks(backend: Backend, chunks: &[Vec<u8>]) -> Vec<u8> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let dir = TempDir::new().unwrap();
    runtime.block_on(async {
        let fs = filesystem(backend);
        let handle = open(&fs, &dir, "f", OpenMode::Write).await;
        let writes: Vec<_> = chunks.iter().map(|c| handle.write(c.clone())).collect();
        for result in join_all(writes).await {
            result.unwrap();
        }
        handle.close().await;
        std::fs::read(dir.path().join("f")).unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn queued_writes_concatenate(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..16),
    ) {
        for backend in BACKENDS {
            let contents = write_chunks(backend, &chunks);
            prop_assert_eq!(contents, chunks.concat(), "{:?}", backend);
        }
    }
}
