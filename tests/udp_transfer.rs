mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cfp::sim::{LinkSimConfig, LossyRelay};
use cfp::{ChunkJob, ChunkRequest, Config, Error, Frame, Request, UdpClient, UdpServer};
use tokio::net::UdpSocket;
use common::{assert_same, fast_config, Fixture};

async fn start_server(fixture: &Fixture, config: Config) -> (Arc<UdpServer>, SocketAddr) {
    let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), fixture.catalog(), config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let server = Arc::new(server);
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (server, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_not_found_has_no_size() {
    let fixture = Fixture::new(&[("a.bin", 1000)], &["ghost.bin"]);
    let (_server, addr) = start_server(&fixture, fast_config(4)).await;

    let client = UdpClient::connect(addr, fast_config(4)).await.unwrap();
    assert_eq!(
        client.list_files().await.unwrap(),
        vec!["a.bin".to_string(), "ghost.bin".to_string()]
    );

    let err = client.request_file("ghost.bin").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(ref name) if name == "ghost.bin"));
    assert_eq!(client.request_file("a.bin").await.unwrap(), 1000);
    client.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_single_worker_exact_copy() {
    let fixture = Fixture::new(&[("a.bin", 1000)], &[]);
    let (_server, addr) = start_server(&fixture, fast_config(1)).await;

    let client = UdpClient::connect(addr, fast_config(1)).await.unwrap();
    let dest = fixture.dest_path("a.bin");
    let report = client.fetch("a.bin", &dest).await.unwrap();
    assert_eq!(report.file_size, 1000);
    assert_same(&dest, &fixture.source("a.bin"));
    client.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_four_workers_over_lossy_link() {
    let fixture = Fixture::new(&[("big.bin", 60_001), ("tiny.bin", 3)], &[]);
    let (_server, addr) = start_server(&fixture, fast_config(4)).await;
    let relay = LossyRelay::start(addr, LinkSimConfig::lossy(7)).await.unwrap();

    let client = UdpClient::connect(relay.local_addr(), fast_config(4)).await.unwrap();
    for name in ["big.bin", "tiny.bin"] {
        let dest = fixture.dest_path(name);
        tokio::time::timeout(Duration::from_secs(60), client.fetch(name, &dest))
            .await
            .unwrap()
            .unwrap();
        assert_same(&dest, &fixture.source(name));
    }
    client.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_queued_client_promoted_after_off() {
    let fixture = Fixture::new(&[("a.bin", 2048)], &[]);
    let (server, addr) = start_server(&fixture, fast_config(2)).await;

    let first = UdpClient::connect(addr, fast_config(2)).await.unwrap();

    let second = tokio::spawn(UdpClient::connect(addr, fast_config(2)));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!second.is_finished());
    assert_eq!(server.admission().queue_len(), 1);

    // 대기 중인 동안에도 활성 클라이언트는 정상 처리
    assert_eq!(first.request_file("a.bin").await.unwrap(), 2048);

    first.disconnect().await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server.admission().queue_len(), 0);

    let dest = fixture.dest_path("a.bin");
    second.fetch("a.bin", &dest).await.unwrap();
    assert_same(&dest, &fixture.source("a.bin"));
    second.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_oversized_file_is_rejected() {
    let fixture = Fixture::new(&[("a.bin", 1000)], &[]);
    let (_server, addr) = start_server(&fixture, fast_config(1)).await;

    let config = Config {
        max_file_size: 999,
        ..fast_config(1)
    };
    let client = UdpClient::connect(addr, config).await.unwrap();
    let err = client.request_file("a.bin").await.unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
    client.disconnect().await.unwrap();
}

/// 늦게 도착한 이전 응답이 섞여도 해당 요청의 응답만 받아들임
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_control_replies_skip_stale_datagrams() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let connecting = tokio::spawn(UdpClient::connect(addr, fast_config(1)));
    let mut buf = vec![0u8; 2048];
    let (n, peer) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"CLIENT");
    server.send_to(b"ACCEPT", peer).await.unwrap();
    let client = connecting.await.unwrap().unwrap();

    let fake_server = async move {
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"LIST_FILES");
        for datagram in [&b"OK"[..], b"1000", b"ACCEPT", b"x.bin\ny.bin\n"] {
            server.send_to(datagram, peer).await.unwrap();
        }

        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x.bin");
        for datagram in [&b"777"[..], b"OK", b"a.bin\nb.bin\n", b"1234"] {
            server.send_to(datagram, peer).await.unwrap();
        }
    };
    let requests = async {
        let catalog = client.list_files().await.unwrap();
        let size = client.request_file("x.bin").await.unwrap();
        (catalog, size)
    };

    let ((catalog, size), ()) = tokio::join!(requests, fake_server);
    assert_eq!(catalog, vec!["x.bin".to_string(), "y.bin".to_string()]);
    assert_eq!(size, 1234);
}

/// 같은 워커 엔드포인트의 새 CHUNK_REQUEST는 이전 송신자를 EOF 없이 멈춤
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udp_resend_request_supersedes_running_sender() {
    let fixture = Fixture::new(&[("a.bin", 5000)], &[]);
    let config = Config {
        datagram_payload: 100,
        pacing_us: 5000,
        ..fast_config(1)
    };
    let (_server, addr) = start_server(&fixture, config).await;

    let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    control.send_to(b"CLIENT", addr).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, _) = control.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ACCEPT");

    let worker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    worker.connect(addr).await.unwrap();
    let job = ChunkJob::new(0, 0, 5000);
    let request = |seq| Request::ChunkRequest(ChunkRequest::resume("a.bin", &job, 0, seq).unwrap()).encode();

    worker.send(request(0).as_bytes()).await.unwrap();
    for expected in 0..3 {
        let n = worker.recv(&mut buf).await.unwrap();
        let frame = Frame::from_bytes(&buf[..n]).unwrap();
        assert!(frame.verify());
        assert_eq!(frame.seq, expected);
    }

    // 새 송신자는 seq 1000부터 번호를 매김
    worker.send(request(1000).as_bytes()).await.unwrap();

    let mut old_seqs = Vec::new();
    let mut new_seqs = Vec::new();
    let mut eofs = 0;
    while let Ok(received) = tokio::time::timeout(Duration::from_millis(500), worker.recv(&mut buf)).await {
        let bytes = &buf[..received.unwrap()];
        if bytes == b"EOF" {
            eofs += 1;
            assert_eq!(new_seqs.len(), 50, "EOF before the range was sent");
            continue;
        }
        let frame = Frame::from_bytes(bytes).unwrap();
        assert!(frame.verify());
        if frame.seq >= 1000 {
            new_seqs.push(frame.seq);
        } else {
            old_seqs.push(frame.seq);
        }
    }

    assert_eq!(eofs, 1);
    assert_eq!(new_seqs, (1000..1050).collect::<Vec<u32>>());
    // 게이트 확인 이후 이미 읽은 한 프레임까지만 허용
    assert!(old_seqs.len() <= 1, "superseded sender kept sending: {:?}", old_seqs);
}
