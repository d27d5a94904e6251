use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{Local, TimeZone};
use etherparse::PacketBuilder;
use pcap_file::pcap::{PcapPacket, PcapWriter};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use flowtally::agent::Agent;
use flowtally::config::Config;
use flowtally::export::health::HealthMetrics;
use flowtally::sink::cache::{Direction, FlowKey};
use flowtally::sink::record::HEADER;
use flowtally::sink::{FlowEvent, FlowSink, SinkSettings};

const LOCAL: [u8; 4] = [192, 168, 1, 10];

fn local_time(h: u32, m: u32, s: u32) -> SystemTime {
    Local
        .with_ymd_and_hms(2024, 5, 1, h, m, s)
        .single()
        .expect("valid local time")
        .into()
}

fn settings(dir: &Path, flush_interval: Duration) -> SinkSettings {
    SinkSettings {
        output_dir: dir.to_path_buf(),
        file_prefix: "results".to_string(),
        flush_interval,
        write_retries: 2,
        summary_interval: Duration::from_secs(3600),
        top_peers: 5,
        channel_capacity: 1024,
    }
}

fn flow(ip: [u8; 4], port: u16, direction: Direction, size: u64, at: SystemTime) -> FlowEvent {
    FlowEvent {
        key: FlowKey {
            direction,
            peer_ip: Some(IpAddr::V4(Ipv4Addr::from(ip))),
            peer_port: Some(port),
        },
        size,
        timestamp: at,
    }
}

fn read_rows(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("read bucket file")
        .lines()
        .map(str::to_string)
        .collect()
}

fn header_line() -> String {
    HEADER.join(",")
}

#[tokio::test]
async fn test_periodic_flush_then_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let mut sink = FlowSink::new(
        settings(dir.path(), Duration::from_millis(50)),
        Arc::clone(&health),
    );
    let ctx = CancellationToken::new();
    sink.start(ctx.clone()).expect("start");

    let sender = sink.sender();
    let now = SystemTime::now();
    sender
        .send(flow([1, 1, 1, 1], 443, Direction::Upload, 100, now))
        .await
        .expect("send");
    sender
        .send(flow([1, 1, 1, 1], 443, Direction::Upload, 50, now))
        .await
        .expect("send");
    sender
        .send(flow([2, 2, 2, 2], 80, Direction::Download, 20, now))
        .await
        .expect("send");

    // Wait for at least one periodic flush.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while health.flushes.get() < 1.0 || !sink.cache().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no periodic flush");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A later event for the same flow is appended as a new row.
    sender
        .send(flow([1, 1, 1, 1], 443, Direction::Upload, 7, now))
        .await
        .expect("send");

    ctx.cancel();
    let report = sink
        .wait_for_shutdown()
        .await
        .expect("shutdown")
        .expect("report");

    let path = report.closed_path.clone().expect("bucket path");
    let rows = read_rows(&path);
    assert_eq!(rows[0], header_line());
    assert_eq!(rows.iter().filter(|r| **r == header_line()).count(), 1);
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().any(|r| r.ends_with(",Upload,150,1.1.1.1,443")));
    assert!(rows.iter().any(|r| r.ends_with(",Download,20,2.2.2.2,80")));
    assert!(rows[3].ends_with(",Upload,7,1.1.1.1,443"));

    let summary = report.summary.expect("summary");
    assert_eq!(summary.uploaded, 157);
    assert_eq!(summary.downloaded, 20);
    assert_eq!(summary.peer_visits["1.1.1.1"], 2);
    assert_eq!(health.rows_written.get() as u64, 3);
}

#[tokio::test]
async fn test_bucket_boundary_opens_second_file() {
    let dir = TempDir::new().expect("tempdir");
    let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
    let mut sink = FlowSink::new(
        settings(dir.path(), Duration::from_secs(3600)),
        Arc::clone(&health),
    );
    let ctx = CancellationToken::new();

    let sender = sink.sender();
    sender
        .send(flow(
            [3, 3, 3, 3],
            22,
            Direction::Upload,
            10,
            local_time(14, 59, 59),
        ))
        .await
        .expect("send");
    sender
        .send(flow(
            [3, 3, 3, 3],
            22,
            Direction::Upload,
            5,
            local_time(15, 0, 1),
        ))
        .await
        .expect("send");

    ctx.cancel();
    sink.start(ctx).expect("start");
    let report = sink
        .wait_for_shutdown()
        .await
        .expect("shutdown")
        .expect("report");

    let first = dir.path().join("results-2024-05-01-14.csv");
    let second = dir.path().join("results-2024-05-01-15.csv");
    assert_eq!(report.closed_path, Some(second.clone()));
    assert_eq!(health.bucket_rotations.get() as u64, 2);

    // Entries are flushed into whichever bucket is open at flush time.
    assert_eq!(read_rows(&first), vec![header_line()]);
    let rows = read_rows(&second);
    assert_eq!(rows.len(), 2);
    assert!(rows[1].ends_with(",Upload,15,3.3.3.3,22"));
}

#[tokio::test]
async fn test_restart_appends_without_second_header() {
    let dir = TempDir::new().expect("tempdir");
    let at = local_time(9, 15, 0);
    let path: PathBuf = dir.path().join("results-2024-05-01-09.csv");

    for size in [11, 22] {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let mut sink = FlowSink::new(settings(dir.path(), Duration::from_secs(3600)), health);
        let ctx = CancellationToken::new();
        sink.sender()
            .send(flow([4, 4, 4, 4], 53, Direction::Download, size, at))
            .await
            .expect("send");
        ctx.cancel();
        sink.start(ctx).expect("start");
        sink.wait_for_shutdown().await.expect("shutdown");
    }

    let rows = read_rows(&path);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows.iter().filter(|r| **r == header_line()).count(), 1);
    assert!(rows[1].ends_with(",Download,11,4.4.4.4,53"));
    assert!(rows[2].ends_with(",Download,22,4.4.4.4,53"));
}

fn write_capture(path: &Path, frames: &[(SystemTime, Vec<u8>)]) {
    let file = File::create(path).expect("create pcap");
    let mut writer = PcapWriter::new(file).expect("pcap writer");
    for (at, frame) in frames {
        let ts = at
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("after epoch");
        let packet = PcapPacket::new(ts, frame.len() as u32, frame);
        writer.write_packet(&packet).expect("write packet");
    }
}

fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1, 1024);
    let payload = vec![0u8; payload_len];
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload).expect("build frame");
    frame
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_runs_full_pipeline() {
    let dir = TempDir::new().expect("tempdir");
    let capture = dir.path().join("trace.pcap");
    let out = dir.path().join("logs");

    let up = tcp_frame(LOCAL, [1, 1, 1, 1], 50000, 443, 100);
    let down = tcp_frame([2, 2, 2, 2], LOCAL, 80, 50001, 20);
    let up_len = up.len() as u64;
    let down_len = down.len() as u64;
    write_capture(
        &capture,
        &[
            (local_time(10, 0, 5), up.clone()),
            (local_time(10, 0, 6), up),
            (local_time(10, 0, 7), down),
        ],
    );

    let mut cfg = Config::default();
    cfg.capture.replay_file = Some(capture);
    cfg.capture.local_address = Some("192.168.1.10".to_string());
    cfg.output.dir = out.clone();
    cfg.validate().expect("valid config");

    let mut agent = Agent::new(cfg).expect("agent");
    let cancel = agent.cancel_token();
    agent.start().await.expect("start");

    // Replay exhaustion requests shutdown on its own.
    tokio::time::timeout(Duration::from_secs(10), cancel.cancelled())
        .await
        .expect("replay should finish");

    let report = agent.stop().await.expect("stop").expect("report");
    assert_eq!(report.rows_flushed, 2);
    assert_eq!(
        report.closed_path,
        Some(out.join("results-2024-05-01-10.csv"))
    );

    let summary = report.summary.expect("summary");
    assert_eq!(summary.uploaded, 2 * up_len);
    assert_eq!(summary.downloaded, down_len);
    assert_eq!(summary.peer_visits["1.1.1.1"], 1);
    assert_eq!(summary.peer_visits["2.2.2.2"], 1);
    assert_eq!(agent.health().packets_received.get() as u64, 3);
}

#[tokio::test]
async fn test_replay_without_local_address_fails_to_start() {
    let dir = TempDir::new().expect("tempdir");
    let capture = dir.path().join("trace.pcap");
    write_capture(&capture, &[]);

    let mut cfg = Config::default();
    cfg.capture.replay_file = Some(capture);
    cfg.output.dir = dir.path().join("logs");

    let mut agent = Agent::new(cfg).expect("agent");
    let err = agent.start().await.expect_err("missing local address");
    assert!(err.to_string().contains("capture.local_address"));
    assert!(agent.stop().await.expect("stop").is_none());
}
