use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resfs::{
    Config, Error, ExistsRetry, File, LockRegistry, ReadEvent, Result, RetryStrategy, StreamRetry,
};

#[tokio::test]
async fn test_write_then_read() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = File::new(dir.path().join("write.txt")).expect("file");

    file.write("Test write content").await.expect("write");

    let contents = tokio::fs::read_to_string(file.path()).await.expect("read");
    assert_eq!(contents, "Test write content");

    let contents = file.read_to_end().await.expect("read_to_end");
    assert_eq!(&contents[..], b"Test write content");
}

#[tokio::test]
async fn test_binary_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = File::new(dir.path().join("data.bin")).expect("file");

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    file.write(payload.clone()).await.expect("write");

    let contents = file.read_to_end().await.expect("read_to_end");
    assert_eq!(&contents[..], &payload[..]);
}

#[tokio::test]
async fn test_write_replaces_contents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = File::new(dir.path().join("replace.txt")).expect("file");

    file.write("a much longer first payload").await.expect("first");
    file.write("short").await.expect("second");

    let contents = tokio::fs::read_to_string(file.path()).await.expect("read");
    assert_eq!(contents, "short");
}

#[tokio::test]
async fn test_write_creates_parent_dirs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("a").join("b").join("c").join("nested.txt");
    let file = File::new(&path).expect("file");

    file.write("nested").await.expect("write");

    assert_eq!(std::fs::read_to_string(&path).expect("read"), "nested");
}

#[tokio::test]
async fn test_concurrent_writes_finish_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = File::new(dir.path().join("ordered.txt"))
        .expect("file")
        .with_registry(Arc::new(LockRegistry::new()));

    let finished = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..10)
        .map(|i| (i, file.write(format!("Write {}", i))))
        .collect();

    let mut observers = Vec::new();
    for (i, handle) in handles {
        let finished = finished.clone();
        observers.push(tokio::spawn(async move {
            handle.await.expect("write");
            finished.lock().unwrap().push(i);
        }));
    }

    for observer in observers {
        observer.await.expect("observer");
    }

    assert_eq!(*finished.lock().unwrap(), (0..10).collect::<Vec<_>>());

    let contents = tokio::fs::read_to_string(file.path()).await.expect("read");
    assert_eq!(contents, "Write 9");
}

#[tokio::test]
async fn test_three_writes_leave_the_last() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = File::new(dir.path().join("three.txt")).expect("file");

    let first = file.write("Write 1");
    let second = file.write("Write 2");
    let third = file.write("Write 3");

    let (first, second, third) = futures::join!(first, second, third);
    first.expect("first");
    second.expect("second");
    third.expect("third");

    let contents = file.read_to_end().await.expect("read");
    assert_eq!(&contents[..], b"Write 3");
}

#[tokio::test]
async fn test_stream_retries_exhausted_release_lock() {
    let dir = tempfile::tempdir().expect("tempdir");

    // a directory can't be opened for writing
    let path = dir.path().join("occupied");
    std::fs::create_dir(&path).expect("mkdir");

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    let strategy = move |error: &Error, attempt: usize, path: &Path| -> Result<Duration> {
        seen.lock().unwrap().push(attempt);
        StreamRetry::new(Duration::from_millis(1), 3).retry(error, attempt, path)
    };

    let registry = Arc::new(LockRegistry::new());
    let config = Config::default().write_retry(strategy);
    let file = File::with_config(&path, config)
        .expect("file")
        .with_registry(registry.clone());

    let cause = file.write("never").await.expect_err("directory");
    assert!(matches!(cause, Error::RetryExhausted { attempts: 3, .. }));
    assert!(cause.to_string().contains("retries"));
    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
    assert!(!registry.is_locked(&path));

    // the failed write doesn't block the next one
    std::fs::remove_dir(&path).expect("rmdir");
    file.write("finally").await.expect("write");
    assert_eq!(std::fs::read_to_string(&path).expect("read"), "finally");
}

#[tokio::test]
async fn test_missing_device_exhausts_exists_retries() {
    let strategy = ExistsRetry::default().with_device_base(Duration::from_millis(1), 3);
    let config = Config::default().write_exists_retry(strategy);

    let registry = Arc::new(LockRegistry::new());
    let path = Path::new("/dev/resfs-test-missing-device");
    let file = File::with_config(path, config)
        .expect("file")
        .with_registry(registry.clone());

    let cause = file.write("nobody home").await.expect_err("missing device");
    assert!(matches!(cause, Error::RetryExhausted { attempts: 3, .. }));
    assert!(cause.is_not_found());
    assert!(!registry.is_locked(path));
}

#[tokio::test]
async fn test_write_to_char_device() {
    File::new("/dev/null")
        .expect("file")
        .write("discarded")
        .await
        .expect("write");
}

#[tokio::test]
async fn test_non_retryable_exists_error_is_immediate() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let strategy = move |error: &Error, _: usize, _: &Path| -> Result<Duration> {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(error.clone())
    };

    let path = Path::new("/dev/resfs-test-fatal");
    let config = Config::default().write_exists_retry(strategy);
    let file = File::with_config(path, config).expect("file");

    let cause = file.write("x").await.expect_err("fatal");
    assert!(matches!(cause, Error::NotAccessible { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_write_to_fifo_reaches_reader() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pipe");
    nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRWXU).expect("mkfifo");

    let file = File::new(&path).expect("file");
    let (reader, mut events) = file.read_events();

    file.write("ping").await.expect("write");

    let mut received = Vec::new();
    while received.len() < 4 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event")
            .expect("open channel");

        match event {
            ReadEvent::Data { chunk, .. } => received.extend_from_slice(&chunk),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    assert_eq!(received, b"ping");

    reader.finish();
    reader.join().await.expect("join");
}

#[test]
fn test_empty_path_is_rejected() {
    assert!(matches!(File::new(""), Err(Error::Config(_))));
}
