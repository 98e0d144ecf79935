// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg(unix)]

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use archiveserver::nursery::Nursery;
use archiveserver::router;
use archiveserver::server::Server;
use archiveserver::state::ArchiveState;
use archiveserver::Config;

struct Fixture {
    dir: tempfile::TempDir,
    nursery: Nursery,
    state: Arc<ArchiveState>,
}

impl Fixture {
    /// Photos in `abc123`, and an archiver script with the given body.
    fn new(archiver_script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let photos_dir = dir.path().join("photos");
        std::fs::create_dir_all(photos_dir.join("abc123")).unwrap();
        std::fs::write(photos_dir.join("abc123/1.jpg"), b"first photo\n").unwrap();
        std::fs::write(photos_dir.join("abc123/2.jpg"), b"second photo\n").unwrap();
        let index_page = dir.path().join("index.html");
        std::fs::write(&index_page, "<a href=\"/archive/abc123/\">Download</a>").unwrap();

        let archiver = dir.path().join("archiver");
        write_executable(&archiver, archiver_script);
        Self::with_archiver(dir, photos_dir, index_page, archiver.display().to_string())
    }

    fn with_archiver(
        dir: tempfile::TempDir,
        photos_dir: PathBuf,
        index_page: PathBuf,
        archiver: String,
    ) -> Self {
        let nursery = Nursery::new();
        let config = Config {
            log: false,
            delay: 0.0,
            photos_dir,
            chunk_kb_size: NonZeroUsize::new(1).unwrap(),
            port: 0,
            max_connections: 8,
            index_page,
            archiver,
        };
        let state = Arc::new(ArchiveState {
            config,
            sessions: nursery.handle(),
        });
        Self {
            dir,
            nursery,
            state,
        }
    }

    fn pid_file(&self) -> PathBuf {
        self.dir.path().join("archiver.pid")
    }
}

/// Writes an executable script from a separate process, so no writable descriptor of ours can
/// leak into a concurrently spawned child and make exec fail with ETXTBSY.
fn write_executable(path: &Path, script: &str) {
    let contents = format!("#!/bin/sh\n{script}\n");
    let status = std::process::Command::new("sh")
        .args(["-c", "printf '%s' \"$1\" > \"$0\" && chmod 755 \"$0\""])
        .arg(path)
        .arg(contents)
        .status()
        .unwrap();
    assert!(status.success());
}

fn installed(tool: &str) -> bool {
    std::process::Command::new(tool)
        .arg("-v")
        .stdout(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Incompressible bytes, so a ZIP of them spans as many chunks as the data itself.
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (seed >> 56) as u8
        })
        .collect()
}

fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

async fn read_pid(pid_file: &Path) -> u32 {
    for _ in 0..100 {
        if let Ok(pid) = tokio::fs::read_to_string(pid_file).await {
            if let Ok(pid) = pid.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("archiver never wrote its pid");
}

async fn connect(
    connections: &mpsc::Sender<std::io::Result<(DuplexStream, SocketAddr)>>,
    request: &str,
) -> DuplexStream {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let address = SocketAddr::from(([127, 0, 0, 1], 50000));
    connections.send(Ok((server, address))).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    client
}

/// The server closes the connection after answering, so `read_to_end` sees the whole response.
fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: photos\r\nConnection: close\r\n\r\n")
}

async fn read_until(
    client: &mut DuplexStream,
    buf: &mut Vec<u8>,
    done: impl Fn(&[u8]) -> bool,
) {
    while !done(buf) {
        let read = client.read_buf(buf).await.unwrap();
        assert!(read > 0, "connection closed early");
    }
}

fn split_head(response: &[u8]) -> Option<(String, &[u8])> {
    let end = response.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&response[..end]).to_lowercase();
    Some((head, &response[end + 4..]))
}

/// Splits a complete chunked body into its chunks, or returns `None` if it was cut short.
fn chunks(mut body: &[u8]) -> Option<Vec<&[u8]>> {
    let mut chunks = vec![];
    loop {
        let line_end = body.windows(2).position(|w| w == b"\r\n")?;
        let size = std::str::from_utf8(&body[..line_end]).ok()?;
        let size = usize::from_str_radix(size.trim(), 16).ok()?;
        body = &body[line_end + 2..];
        if size == 0 {
            return (body == b"\r\n").then_some(chunks);
        }
        if body.len() < size + 2 {
            return None;
        }
        chunks.push(&body[..size]);
        body = &body[size + 2..];
    }
}

fn dechunk(body: &[u8]) -> Option<Vec<u8>> {
    chunks(body).map(|chunks| chunks.concat())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn index_and_archive_are_served() {
    let fixture = Fixture::new(r#"[ "$*" = "-r - ." ] || exit 3; cat ./*"#);
    let (connections_tx, mut connections_rx) = mpsc::channel(4);
    let connections = futures::stream::poll_fn(move |cx| connections_rx.poll_recv(cx));

    let server = Server::new(4);
    let state = fixture.state.clone();
    let run = server.serve(connections, move |request, _| {
        router::respond(state.clone(), request)
    });

    let tests = async {
        let mut client = connect(&connections_tx, &get("/")).await;
        let mut response = vec![];
        client.read_to_end(&mut response).await.unwrap();
        let (head, body) = split_head(&response).unwrap();
        assert!(head.starts_with("http/1.1 200 "), "{head}");
        assert!(head.contains("content-type: text/html"), "{head}");
        assert_eq!(body, b"<a href=\"/archive/abc123/\">Download</a>");

        let mut client = connect(&connections_tx, &get("/archive/abc123/")).await;
        let mut response = vec![];
        client.read_to_end(&mut response).await.unwrap();
        let (head, body) = split_head(&response).unwrap();
        assert!(head.starts_with("http/1.1 200 "), "{head}");
        assert!(head.contains("content-type: application/zip"), "{head}");
        assert!(
            head.contains("content-disposition: attachment; filename=\"photos.zip\""),
            "{head}"
        );
        assert!(head.contains("transfer-encoding: chunked"), "{head}");
        assert_eq!(dechunk(body).unwrap(), b"first photo\nsecond photo\n");

        for (path, status) in [
            ("/archive/nope/", "404"),
            ("/archive/abc123", "404"),
            ("/archive/..%2F/", "400"),
        ] {
            let mut client = connect(&connections_tx, &get(path)).await;
            let mut response = vec![];
            client.read_to_end(&mut response).await.unwrap();
            let (head, _) = split_head(&response).unwrap();
            assert!(head.starts_with(&format!("http/1.1 {status} ")), "{path}: {head}");
        }
    };

    tokio::select! {
        _ = run => {}
        _ = tests => {}
    }
    fixture.nursery.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zip_downloads_extract_to_the_original_photos() {
    if !installed("zip") || !installed("unzip") {
        eprintln!("zip or unzip not installed; skipping");
        return;
    }
    let photos = [("1.jpg", noise(6000, 1)), ("2.jpg", noise(2500, 2))];
    let dir = tempfile::tempdir().unwrap();
    let photos_dir = dir.path().join("photos");
    std::fs::create_dir_all(photos_dir.join("abc123")).unwrap();
    for (name, contents) in &photos {
        std::fs::write(photos_dir.join("abc123").join(name), contents).unwrap();
    }
    let zip_path = dir.path().join("photos.zip");
    let fixture = Fixture::with_archiver(
        dir,
        photos_dir,
        PathBuf::from("index.html"),
        "zip".into(),
    );

    let (connections_tx, mut connections_rx) = mpsc::channel(4);
    let connections = futures::stream::poll_fn(move |cx| connections_rx.poll_recv(cx));
    let server = Server::new(4);
    let state = fixture.state.clone();
    let run = server.serve(connections, move |request, _| {
        router::respond(state.clone(), request)
    });

    let tests = async {
        let mut client = connect(&connections_tx, &get("/archive/abc123/")).await;
        let mut response = vec![];
        client.read_to_end(&mut response).await.unwrap();
        let (head, body) = split_head(&response).unwrap();
        assert!(head.starts_with("http/1.1 200 "), "{head}");
        let chunks = chunks(body).unwrap();
        assert!(chunks.len() > 8, "{} chunks", chunks.len());
        let (last, full) = chunks.split_last().unwrap();
        assert!(full.iter().all(|chunk| chunk.len() == 1024));
        assert!(!last.is_empty() && last.len() <= 1024);
        std::fs::write(&zip_path, chunks.concat()).unwrap();
    };

    tokio::select! {
        _ = run => {}
        _ = tests => {}
    }
    fixture.nursery.finish().await;

    for (name, contents) in &photos {
        let extracted = std::process::Command::new("unzip")
            .arg("-p")
            .arg(&zip_path)
            .arg(name)
            .output()
            .unwrap();
        assert!(extracted.status.success(), "{extracted:?}");
        assert!(extracted.stdout == *contents, "{name} differs after extraction");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnected_clients_stop_their_archiver() {
    // Stalls after one chunk, so only the hang-up itself can end the download.
    let fixture =
        Fixture::new("echo $$ > ../../archiver.pid; head -c 1024 /dev/zero; exec sleep 60");
    let (connections_tx, mut connections_rx) = mpsc::channel(4);
    let connections = futures::stream::poll_fn(move |cx| connections_rx.poll_recv(cx));

    let server = Server::new(4);
    let state = fixture.state.clone();
    let run = server.serve(connections, move |request, _| {
        router::respond(state.clone(), request)
    });

    let tests = async {
        let mut client = connect(&connections_tx, &get("/archive/abc123/")).await;
        let mut response = vec![];
        read_until(&mut client, &mut response, |r| {
            split_head(r).is_some_and(|(_, body)| body.len() >= 1024)
        })
        .await;
        let pid = read_pid(&fixture.pid_file()).await;
        assert!(process_exists(pid));

        drop(client);
        for _ in 0..250 {
            if !process_exists(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("archiver {pid} outlived its client");
    };

    tokio::select! {
        _ = run => {}
        _ = tests => {}
    }
    fixture.nursery.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_truncates_downloads_and_reaps_archivers() {
    let fixture =
        Fixture::new("echo $$ > ../../archiver.pid; head -c 1024 /dev/zero; exec sleep 60");
    let pid_file = fixture.pid_file();
    let Fixture {
        dir: _dir,
        nursery,
        state,
    } = fixture;
    let (connections_tx, mut connections_rx) = mpsc::channel(4);
    let connections = futures::stream::poll_fn(move |cx| connections_rx.poll_recv(cx));

    let server = Server::new(4);
    let run = server.serve(connections, move |request, _| {
        router::respond(state.clone(), request)
    });

    let tests = async {
        let mut client = connect(&connections_tx, &get("/archive/abc123/")).await;
        let mut response = vec![];
        read_until(&mut client, &mut response, |r| {
            split_head(r).is_some_and(|(_, body)| body.len() >= 1024)
        })
        .await;
        let pid = read_pid(&pid_file).await;

        nursery.cancel().await;
        assert!(!process_exists(pid));

        client.read_to_end(&mut response).await.unwrap();
        let (head, body) = split_head(&response).unwrap();
        assert!(head.starts_with("http/1.1 200 "), "{head}");
        assert_eq!(dechunk(body), None, "download should be cut short");

        server.graceful_shutdown().await;
    };

    tokio::join!(run, tests);
}
