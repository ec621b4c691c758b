//! Real client against the real server over loopback UDP

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kestrel_tftp::audit::AuditLogger;
use kestrel_tftp::config::WriteConfig;
use kestrel_tftp::lock::{FileLock, FlockLock, LockMode};
use kestrel_tftp::{
    Destination, ErrorCode, OptionSet, ServerHandle, ServerPolicy, Source, TftpClient, TftpError,
    TftpServer, TransferMode, TransferSettings,
};

const TIMEOUT: Duration = Duration::from_millis(500);

async fn start_server(root: &Path, configure: impl FnOnce(TftpServer) -> TftpServer) -> ServerHandle {
    let server = TftpServer::new(root)
        .with_timeout(TIMEOUT)
        .with_retries(3)
        .with_audit(AuditLogger::new(false));
    configure(server)
        .bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

fn client_for(handle: &ServerHandle) -> TftpClient {
    TftpClient::new(handle.local_addr())
        .with_timeout(TIMEOUT)
        .with_retries(3)
}

fn uploads_allowed(pattern: &str, allow_overwrite: bool) -> WriteConfig {
    WriteConfig {
        enabled: true,
        allow_overwrite,
        allowed_patterns: vec![pattern.to_string()],
    }
}

/// Records (block, payload length) of every DATA block moved
fn block_log() -> (Arc<Mutex<Vec<(u16, usize)>>>, TransferSettings) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let settings = TransferSettings::default().on_block(move |block, payload| {
        sink.lock().unwrap().push((block, payload.len()));
    });
    (log, settings)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn assert_peer_error(err: &TftpError, expected: ErrorCode) {
    match err {
        TftpError::Peer { code, .. } => assert_eq!(*code, expected, "{err}"),
        other => panic!("expected peer error {expected:?}, got {other:?}"),
    }
}

#[tokio::test]
async fn download_of_1000_bytes_takes_two_blocks() {
    let root = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let content = patterned(1000);
    std::fs::write(root.path().join("boot.img"), &content).unwrap();

    let handle = start_server(root.path(), |s| s).await;
    let (log, settings) = block_log();
    let target = local.path().join("boot.img");

    let metrics = client_for(&handle)
        .download("boot.img", Destination::Path(target.clone()), settings)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), content);
    assert_eq!(*log.lock().unwrap(), vec![(1, 512), (2, 488)]);
    assert_eq!(metrics.bytes_transferred, 1000);
    assert_eq!(metrics.blocks, 2);
    assert_eq!(metrics.resent_bytes, 0);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn zero_byte_file_is_one_empty_block() {
    let root = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("empty"), b"").unwrap();

    let handle = start_server(root.path(), |s| s).await;
    let (log, settings) = block_log();
    let target = local.path().join("empty");

    client_for(&handle)
        .download("empty", Destination::Path(target.clone()), settings)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"");
    assert_eq!(*log.lock().unwrap(), vec![(1, 0)]);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn exact_multiple_of_blksize_ends_with_empty_block() {
    let root = tempfile::tempdir().unwrap();
    let content = patterned(1024);
    std::fs::write(root.path().join("two.bin"), &content).unwrap();

    let handle = start_server(root.path(), |s| s).await;
    let (log, settings) = block_log();
    let sink: Arc<Mutex<Vec<u8>>> = Arc::default();

    let (writer, reader) = tokio::io::duplex(4096);
    let collect = {
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut reader = reader;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            *sink.lock().unwrap() = buf;
        })
    };

    client_for(&handle)
        .download("two.bin", Destination::Writer(Box::new(writer)), settings)
        .await
        .unwrap();
    collect.await.unwrap();

    assert_eq!(*sink.lock().unwrap(), content);
    assert_eq!(*log.lock().unwrap(), vec![(1, 512), (2, 512), (3, 0)]);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn blksize_is_clamped_to_server_maximum() {
    let root = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let content = patterned(3000);
    std::fs::write(root.path().join("big.bin"), &content).unwrap();

    let handle = start_server(root.path(), |s| {
        s.with_policy(ServerPolicy {
            max_blksize: 1024,
            ..ServerPolicy::default()
        })
    })
    .await;
    let (log, settings) = block_log();
    let target = local.path().join("big.bin");

    client_for(&handle)
        .with_options(OptionSet::new().with_blksize(4096).with_transfer_size(0))
        .download("big.bin", Destination::Path(target.clone()), settings)
        .await
        .map(|metrics| assert_eq!(metrics.expected_size, Some(3000)))
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), content);
    assert_eq!(*log.lock().unwrap(), vec![(1, 1024), (2, 1024), (3, 952)]);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn declined_options_fall_back_to_defaults() {
    let root = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("plain.bin"), patterned(700)).unwrap();

    let handle = start_server(root.path(), |s| s.with_allowed_options(Vec::new())).await;
    let (log, settings) = block_log();

    client_for(&handle)
        .with_options(OptionSet::new().with_blksize(1400))
        .download(
            "plain.bin",
            Destination::Path(local.path().join("plain.bin")),
            settings,
        )
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec![(1, 512), (2, 188)]);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn undersized_blksize_is_rejected_before_sending() {
    let root = tempfile::tempdir().unwrap();
    let handle = start_server(root.path(), |s| s).await;
    let (log, settings) = block_log();

    let err = client_for(&handle)
        .with_options(OptionSet::new().with_blksize(4))
        .download("anything", Destination::Writer(Box::new(tokio::io::sink())), settings)
        .await
        .unwrap_err();

    assert!(matches!(err, TftpError::InvalidOption(_)), "{err:?}");
    assert!(log.lock().unwrap().is_empty());

    handle.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn missing_file_reports_not_found() {
    let root = tempfile::tempdir().unwrap();
    let handle = start_server(root.path(), |s| s).await;

    let err = client_for(&handle)
        .download(
            "nope.bin",
            Destination::Writer(Box::new(tokio::io::sink())),
            TransferSettings::default(),
        )
        .await
        .unwrap_err();

    assert_peer_error(&err, ErrorCode::FileNotFound);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn path_escape_is_an_access_violation() {
    let root = tempfile::tempdir().unwrap();
    let handle = start_server(root.path(), |s| s).await;

    let err = client_for(&handle)
        .download(
            "../etc/passwd",
            Destination::Writer(Box::new(tokio::io::sink())),
            TransferSettings::default(),
        )
        .await
        .unwrap_err();

    assert_peer_error(&err, ErrorCode::AccessViolation);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn netascii_converts_line_endings_on_the_wire() {
    let root = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let text = b"line one\nline two\n";
    std::fs::write(root.path().join("motd.txt"), text).unwrap();

    let handle = start_server(root.path(), |s| s).await;
    let (log, settings) = block_log();
    let target = local.path().join("motd.txt");

    client_for(&handle)
        .with_mode(TransferMode::Netascii)
        .download("motd.txt", Destination::Path(target.clone()), settings)
        .await
        .unwrap();

    // Each LF travels as CR LF.
    assert_eq!(*log.lock().unwrap(), vec![(1, text.len() + 2)]);
    assert_eq!(std::fs::read(&target).unwrap(), text);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn upload_round_trip_with_options() {
    let root = tempfile::tempdir().unwrap();
    let content = patterned(5000);

    let handle = start_server(root.path(), |s| {
        s.with_write_config(uploads_allowed("*.bin", false))
    })
    .await;
    let (log, settings) = block_log();

    let metrics = client_for(&handle)
        .with_options(OptionSet::new().with_blksize(1024).with_transfer_size(0))
        .upload(
            "firmware.bin",
            Source::Reader(Box::new(std::io::Cursor::new(content.clone()))),
            settings,
        )
        .await
        .unwrap();

    assert_eq!(metrics.bytes_transferred, 5000);
    assert_eq!(log.lock().unwrap().len(), 5);

    handle.shutdown(true).await.unwrap();
    assert_eq!(std::fs::read(root.path().join("firmware.bin")).unwrap(), content);
}

#[tokio::test]
async fn uploads_are_refused_by_default() {
    let root = tempfile::tempdir().unwrap();
    let handle = start_server(root.path(), |s| s).await;

    let err = client_for(&handle)
        .upload(
            "firmware.bin",
            Source::Reader(Box::new(std::io::Cursor::new(vec![1u8; 10]))),
            TransferSettings::default(),
        )
        .await
        .unwrap_err();

    assert_peer_error(&err, ErrorCode::AccessViolation);
    assert!(!root.path().join("firmware.bin").exists());

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn existing_file_is_kept_without_overwrite() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("keep.bin"), b"original").unwrap();
    let handle = start_server(root.path(), |s| {
        s.with_write_config(uploads_allowed("*.bin", false))
    })
    .await;

    let err = client_for(&handle)
        .upload(
            "keep.bin",
            Source::Reader(Box::new(std::io::Cursor::new(vec![0u8; 10]))),
            TransferSettings::default(),
        )
        .await
        .unwrap_err();

    assert_peer_error(&err, ErrorCode::FileAlreadyExists);
    assert_eq!(std::fs::read(root.path().join("keep.bin")).unwrap(), b"original");

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn announced_size_over_limit_is_disk_full() {
    let root = tempfile::tempdir().unwrap();
    let handle = start_server(root.path(), |s| {
        s.with_write_config(uploads_allowed("*.bin", true))
            .with_max_file_size(Some(100))
    })
    .await;

    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("large.bin");
    std::fs::write(&path, patterned(1000)).unwrap();

    let err = client_for(&handle)
        .with_options(OptionSet::new().with_transfer_size(0))
        .upload("large.bin", Source::Path(path), TransferSettings::default())
        .await
        .unwrap_err();

    assert_peer_error(&err, ErrorCode::DiskFull);

    handle.shutdown(true).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn locked_destination_is_refused_without_blocking() {
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("shared.bin");
    std::fs::write(&target, b"in progress").unwrap();

    let holder = std::fs::OpenOptions::new().write(true).open(&target).unwrap();
    FlockLock.lock(&holder, LockMode::Exclusive, false).unwrap();

    let handle = start_server(root.path(), |s| {
        s.with_write_config(uploads_allowed("*.bin", true))
    })
    .await;

    let err = client_for(&handle)
        .upload(
            "shared.bin",
            Source::Reader(Box::new(std::io::Cursor::new(vec![7u8; 600]))),
            TransferSettings::default(),
        )
        .await
        .unwrap_err();

    assert_peer_error(&err, ErrorCode::AccessViolation);
    assert!(err.to_string().contains("locked"), "{err}");
    // The holder's content was not truncated.
    assert_eq!(std::fs::read(&target).unwrap(), b"in progress");

    drop(holder);
    handle.shutdown(true).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn blocking_lock_waits_for_the_holder() {
    let root = tempfile::tempdir().unwrap();
    let target = root.path().join("shared.bin");
    std::fs::write(&target, b"in progress").unwrap();

    let holder = std::fs::OpenOptions::new().write(true).open(&target).unwrap();
    FlockLock.lock(&holder, LockMode::Exclusive, false).unwrap();

    let handle = start_server(root.path(), |s| {
        s.with_write_config(uploads_allowed("*.bin", true))
            .with_lock_blocking(true)
    })
    .await;

    let content = patterned(600);
    let client = client_for(&handle);
    let upload = {
        let content = content.clone();
        tokio::spawn(async move {
            client
                .upload(
                    "shared.bin",
                    Source::Reader(Box::new(std::io::Cursor::new(content))),
                    TransferSettings::default(),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!upload.is_finished());

    drop(holder);
    upload.await.unwrap().unwrap();

    handle.shutdown(true).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), content);
}

#[tokio::test]
async fn concurrent_downloads_are_independent() {
    let root = tempfile::tempdir().unwrap();
    let first = patterned(3000);
    let second: Vec<u8> = patterned(2000).into_iter().rev().collect();
    std::fs::write(root.path().join("a.bin"), &first).unwrap();
    std::fs::write(root.path().join("b.bin"), &second).unwrap();

    let handle = start_server(root.path(), |s| s).await;
    let local = tempfile::tempdir().unwrap();
    let client = client_for(&handle);

    let (a, b) = tokio::join!(
        client.download(
            "a.bin",
            Destination::Path(local.path().join("a.bin")),
            TransferSettings::default()
        ),
        client.download(
            "b.bin",
            Destination::Path(local.path().join("b.bin")),
            TransferSettings::default()
        ),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(std::fs::read(local.path().join("a.bin")).unwrap(), first);
    assert_eq!(std::fs::read(local.path().join("b.bin")).unwrap(), second);

    handle.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn raw_request_for_huge_blksize_gets_clamped_oack() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("huge.bin"), patterned(100)).unwrap();
    let handle = start_server(root.path(), |s| s).await;

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = kestrel_tftp::Packet::Rrq(kestrel_tftp::packet::Request {
        filename: "huge.bin".to_string(),
        mode: TransferMode::Octet,
        options: vec![kestrel_tftp::packet::RawOption::new("blksize", "100000")],
    });
    socket
        .send_to(&request.encode(), handle.local_addr())
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, session) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(session, handle.local_addr());
    match kestrel_tftp::Packet::decode(&buf[..len]).unwrap() {
        kestrel_tftp::Packet::Oack { options } => {
            assert_eq!(
                options,
                vec![kestrel_tftp::packet::RawOption::new("blksize", "65464")]
            );
        }
        other => panic!("expected OACK, got {other}"),
    }

    // Refuse politely so the session ends at once.
    let refusal = kestrel_tftp::Packet::error(ErrorCode::FailedNegotiation);
    socket.send_to(&refusal.encode(), session).await.unwrap();

    handle.shutdown(true).await.unwrap();
}
