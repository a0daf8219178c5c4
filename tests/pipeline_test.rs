//! Integration tests for the full tunnel pipeline
//!
//! Spins up in-process loopback topologies (echo server, exit, middles,
//! entry) on ephemeral ports and drives them through the client-facing TCP
//! surface, plus path-level scenarios for loss adaptation and malformed
//! frame isolation.

use bytes::{Bytes, BytesMut};
use mirage_tunnel::config::Config;
use mirage_tunnel::path::{PathHandle, PathTuning};
use mirage_tunnel::relay::{EntryNode, ExitNode, LinkEmulation, MiddleNode};
use mirage_tunnel::runlog::RunContext;
use mirage_tunnel::strategy::{PathObservation, StrategyEngine};
use mirage_tunnel::tunnel::{read_frame, write_frame, Frame};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn temp_out_dir() -> PathBuf {
    std::env::temp_dir().join(format!("mirage-e2e-{:08x}", rand::random::<u32>()))
}

async fn echo_server(listener: TcpListener) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Start server + exit + middles + entry in-process; returns the effective
/// config (entry port included) once everything is listening.
async fn start_topology(path_count: usize, redundancy: usize, per_path_loss: &[f64]) -> Config {
    let server_port = free_port().await;
    let exit_port = free_port().await;
    let entry_port = free_port().await;
    let mut middle_ports = Vec::new();
    for _ in 0..path_count {
        middle_ports.push(free_port().await);
    }

    let config = Config {
        entry_port,
        middle_ports: middle_ports.clone(),
        exit_port,
        server_port,
        redundancy,
        jitter_ms: 2,
        window_size_sec: 60,
        seed: Some(1234),
        run_id: Some("e2e".to_string()),
        out_dir: Some(temp_out_dir()),
        ..Config::default()
    };

    let server_listener = TcpListener::bind(("127.0.0.1", server_port)).await.unwrap();
    tokio::spawn(echo_server(server_listener));

    let exit_ctx = RunContext::init(&config).unwrap();
    let exit_config = config.clone();
    tokio::spawn(async move {
        let _ = ExitNode::new(exit_config, exit_ctx).run(exit_port).await;
    });
    sleep(Duration::from_millis(50)).await;

    for (path_id, &port) in middle_ports.iter().enumerate() {
        let emulation = LinkEmulation {
            base_delay: Duration::from_millis(1),
            jitter: Duration::from_millis(1),
            loss_rate: per_path_loss.get(path_id).copied().unwrap_or(0.0),
        };
        let middle_ctx = RunContext::init(&config).unwrap();
        let middle_config = config.clone();
        tokio::spawn(async move {
            let _ = MiddleNode::new(middle_config, middle_ctx, path_id as u8, emulation)
                .run(port, exit_port)
                .await;
        });
    }
    sleep(Duration::from_millis(50)).await;

    let entry_ctx = RunContext::init(&config).unwrap();
    let entry_config = config.clone();
    tokio::spawn(async move {
        let _ = EntryNode::new(entry_config, entry_ctx).run(entry_port).await;
    });
    sleep(Duration::from_millis(100)).await;

    config
}

#[tokio::test]
async fn single_message_single_path() {
    let config = start_topology(1, 1, &[0.0]).await;
    let mut client = TcpStream::connect(("127.0.0.1", config.entry_port))
        .await
        .unwrap();

    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    timeout(Duration::from_secs(10), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"hello");
}

#[tokio::test]
async fn dual_path_redundant_messages_delivered_once() {
    let config = start_topology(2, 2, &[0.0, 0.0]).await;
    let mut client = TcpStream::connect(("127.0.0.1", config.entry_port))
        .await
        .unwrap();

    let mut rng = StdRng::seed_from_u64(77);
    for _ in 0..25 {
        let mut message = vec![0u8; 1024];
        rng.fill_bytes(&mut message);
        client.write_all(&message).await.unwrap();

        let mut echoed = vec![0u8; 1024];
        timeout(Duration::from_secs(10), client.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        // Redundant copies on both paths must collapse into exactly one
        // delivery, byte-identical to the input
        assert_eq!(echoed, message);
    }
}

#[tokio::test]
async fn oversize_message_fragments_and_reassembles() {
    let config = start_topology(2, 1, &[0.0, 0.0]).await;
    let mut client = TcpStream::connect(("127.0.0.1", config.entry_port))
        .await
        .unwrap();

    // Larger than the entry's read chunk and the largest size bin
    let message: Vec<u8> = (0..60_000u32).map(|i| (i % 249) as u8).collect();
    client.write_all(&message).await.unwrap();

    let mut echoed = vec![0u8; message.len()];
    timeout(Duration::from_secs(20), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, message);
}

/// Responder side of one duplex path: ACKs data frames, dropping a seeded
/// fraction first.
async fn lossy_responder(stream: tokio::io::DuplexStream, drop_rate: f64, seed: u64) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = BytesMut::new();
    while let Ok(Some(frame)) = read_frame(&mut reader, &mut buf).await {
        if frame.is_ack() {
            continue;
        }
        if rng.gen::<f64>() < drop_rate {
            continue;
        }
        if write_frame(&mut writer, &Frame::ack(frame.seq, frame.seq))
            .await
            .is_err()
        {
            return;
        }
    }
}

#[tokio::test]
async fn loss_shifts_weights_after_windows() {
    let tuning = PathTuning {
        ack_timeout_floor: Duration::from_millis(100),
        ..PathTuning::default()
    };
    let (inbound_tx, mut inbound_rx) = mpsc::channel(1024);

    let (local0, remote0) = tokio::io::duplex(64 * 1024);
    let (local1, remote1) = tokio::io::duplex(64 * 1024);
    tokio::spawn(lossy_responder(remote0, 0.35, 42));
    tokio::spawn(lossy_responder(remote1, 0.0, 43));

    let handles = vec![
        PathHandle::spawn(0, local0, tuning.clone(), inbound_tx.clone()),
        PathHandle::spawn(1, local1, tuning, inbound_tx),
    ];

    // ACK pump: any copy clears the seq everywhere, credit to arrival path
    let pump_handles = handles.clone();
    tokio::spawn(async move {
        while let Some((path_id, frame)) = inbound_rx.recv().await {
            if let Some(acked) = frame.acked_seq() {
                for handle in &pump_handles {
                    handle.on_ack(acked, handle.path_id == path_id);
                }
            }
        }
    });

    // Alternate 300 frames across the two paths, reaping as we go
    for seq in 0u32..300 {
        let frame = Frame::data(seq, seq, 0, 1, Bytes::from_static(&[7u8; 32]), 32);
        let _ = handles[(seq % 2) as usize].send(frame, Duration::ZERO);
        if seq % 25 == 24 {
            sleep(Duration::from_millis(30)).await;
            for handle in &handles {
                handle.reap(Instant::now());
            }
        }
    }
    // Let the stragglers either ACK or time out
    for _ in 0..8 {
        sleep(Duration::from_millis(60)).await;
        for handle in &handles {
            handle.reap(Instant::now());
        }
    }

    let mut config = Config::default();
    config.middle_ports = vec![1, 2];
    let mut engine = StrategyEngine::new(&config);
    let observations: Vec<PathObservation> = handles
        .iter()
        .map(|handle| {
            let stats = handle.stats();
            PathObservation {
                rtt_ms: stats.rtt_ms,
                loss: stats.loss,
                mean_frame_len: stats.mean_frame_len,
            }
        })
        .collect();

    let mut snapshot = engine.tick(&observations);
    for _ in 0..2 {
        snapshot = engine.tick(&observations);
    }
    assert!(
        snapshot.weights[0] < snapshot.weights[1] / 2.0,
        "weights after loss: {:?} (loss {:.2} vs {:.2})",
        snapshot.weights,
        observations[0].loss,
        observations[1].loss,
    );
}

#[tokio::test]
async fn malformed_frame_isolated_connection_survives() {
    // Server + exit only; this test speaks the wire format directly
    let server_port = free_port().await;
    let exit_port = free_port().await;
    let config = Config {
        middle_ports: vec![free_port().await],
        exit_port,
        server_port,
        jitter_ms: 1,
        window_size_sec: 60,
        seed: Some(5),
        run_id: Some("malformed".to_string()),
        out_dir: Some(temp_out_dir()),
        ..Config::default()
    };

    let server_listener = TcpListener::bind(("127.0.0.1", server_port)).await.unwrap();
    tokio::spawn(echo_server(server_listener));
    let ctx = RunContext::init(&config).unwrap();
    let exit_config = config.clone();
    tokio::spawn(async move {
        let _ = ExitNode::new(exit_config, ctx).run(exit_port).await;
    });
    sleep(Duration::from_millis(100)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", exit_port)).await.unwrap();

    // A corrupted frame first, then an intact one on the same connection
    let mut corrupted = Frame::data(0, 8, 0, 1, Bytes::from_static(b"junk"), 4)
        .encode()
        .unwrap();
    corrupted[0] ^= 0xFF;
    conn.write_all(&corrupted).await.unwrap();
    conn.write_all(&Frame::data(1, 9, 0, 1, Bytes::from_static(b"ping"), 4).encode().unwrap())
        .await
        .unwrap();

    // The intact frame must still be processed: expect an ACK for it and
    // the echoed payload under the same group id
    let mut buf = BytesMut::new();
    let mut saw_ack = false;
    let mut echoed = None;
    let deadline = Instant::now() + Duration::from_secs(10);
    while echoed.is_none() && Instant::now() < deadline {
        let frame = timeout(Duration::from_secs(5), read_frame(&mut conn, &mut buf))
            .await
            .expect("exit went silent")
            .unwrap()
            .expect("exit closed the connection");
        if frame.acked_seq() == Some(1) {
            saw_ack = true;
        } else if !frame.is_ack() && !frame.is_decoy() {
            echoed = Some(frame);
        }
    }
    let echoed = echoed.expect("no echo received");
    assert!(saw_ack);
    assert_eq!(echoed.group_id, 9);
    assert_eq!(echoed.real_payload(), b"ping");
}
