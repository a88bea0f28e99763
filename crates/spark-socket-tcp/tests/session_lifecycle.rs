//! TCP 会话端到端行为：收发闭环、生命周期事件顺序、致命与非致命错误、接入过滤。
//!
//! # 教案式说明
//! - **Why**：会话的读循环、写泵与关闭流程只有在真实套接字上才能完整验证；
//! - **How**：服务端与客户端各自持有独立的 `IoGroup`，测试线程在运行时之外以阻塞方式驱动，
//!   并通过竞技场统计断言缓冲零泄漏；
//! - **What**：每个测试在 5 秒内完成，超时即视为失败。

mod support;

use std::{
    io::{Read, Write},
    net::TcpStream as StdTcpStream,
    time::Duration,
};

use spark_socket_core::{Session, SessionEvent, SessionState, WriteRejected};
use spark_socket_tcp::{AioClient, AioServer};
use support::{LengthPrefixed, Recorder, config, frame, wait_until};
use tracing_test::traced_test;

fn start_server(protocol: LengthPrefixed) -> (AioServer<LengthPrefixed, Recorder>, std::net::SocketAddr) {
    let mut server = AioServer::new(config(), protocol, Recorder::default());
    let addr = server.start().expect("服务端应能绑定回环地址");
    (server, addr)
}

/// PING/PONG 闭环，并在优雅关闭后检查事件顺序与缓冲归还。
#[test]
fn ping_pong_round_trip_releases_every_buffer() {
    let (server, addr) = start_server(LengthPrefixed::default());
    let client = AioClient::new(config(), LengthPrefixed::default(), Recorder::default())
        .expect("客户端资源组应能创建");

    let session = client.connect(addr).expect("应能连接到服务端");
    session.send(&b"PING".to_vec()).expect("写入应被接受");

    assert!(wait_until(|| client.processor().messages() == vec![b"PONG".to_vec()]));
    assert_eq!(server.processor().messages(), vec![b"PING".to_vec()]);

    session.close(false);
    assert!(wait_until(|| server.processor().count(SessionEvent::SessionClosed) == 1));
    assert!(wait_until(|| client.processor().count(SessionEvent::SessionClosed) == 1));

    let events = server.processor().events();
    assert_eq!(events.first(), Some(&SessionEvent::NewSession));
    assert_eq!(events.last(), Some(&SessionEvent::SessionClosed));
    assert!(events.contains(&SessionEvent::InputShutdown));

    let server_group = server.group().expect("服务端已启动");
    assert!(wait_until(|| server_group.arena().stats().in_use == 0));
    assert!(wait_until(|| client.group().arena().stats().in_use == 0));
    assert_eq!(server_group.arena().stats().implicit_releases, 0);
    assert_eq!(client.group().arena().stats().implicit_releases, 0);
    assert_eq!(server_group.session_count(), 0);
}

/// 重复关闭是空操作：`SessionClosed` 只出现一次，并记录一次告警。
#[traced_test]
#[test]
fn close_twice_emits_single_closed_event() {
    let (_server, addr) = start_server(LengthPrefixed::default());
    let client = AioClient::new(config(), LengthPrefixed::default(), Recorder::default())
        .expect("客户端资源组应能创建");
    let session = client.connect(addr).expect("应能连接到服务端");

    session.close(true);
    session.close(true);
    session.close(false);

    assert_eq!(client.processor().count(SessionEvent::SessionClosed), 1);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.is_invalid());
    assert_eq!(session.write(b"late"), Err(WriteRejected::Closed));
    assert!(session.remote_addr().is_err());
    assert!(logs_contain("ignore, session already closed"));
}

/// 对端不读取时写队列达到上限，之后的写入以背压拒绝且不丢失已入队数据的所有权。
#[test]
fn stalled_peer_triggers_backpressure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("应能绑定回环地址");
    let addr = listener.local_addr().expect("监听地址");
    let acceptor = std::thread::spawn(move || listener.accept().map(|(stream, _)| stream));

    let mut cfg = config().with_write_queue_capacity(4);
    cfg.socket.send_buffer_size = Some(4096);
    let client = AioClient::new(cfg, LengthPrefixed::default(), Recorder::default())
        .expect("客户端资源组应能创建");
    let session = client.connect(addr).expect("应能连接到阻塞对端");
    let _peer = acceptor.join().expect("接入线程").expect("应接入一个连接");

    let chunk = vec![0x5a_u8; 64 * 1024];
    let mut accepted = 0;
    let mut rejected = None;
    for _ in 0..4096 {
        match session.write(&chunk) {
            Ok(()) => accepted += 1,
            Err(reason) => {
                rejected = Some(reason);
                break;
            }
        }
    }
    assert_eq!(rejected, Some(WriteRejected::Backpressure));
    assert!(accepted >= 4);
    assert!(session.pending_writes() <= 4);

    session.close(true);
    assert!(wait_until(|| client.group().arena().stats().in_use == 0));
}

/// 优雅关闭会先写完队列中的数据。
#[test]
fn graceful_close_flushes_queued_writes() {
    let mut server_config = config().with_read_buffer_size(256 * 1024);
    server_config.socket.recv_buffer_size = Some(8192);
    let mut server = AioServer::new(server_config, LengthPrefixed::default(), Recorder::default());
    let addr = server.start().expect("服务端应能绑定回环地址");
    let client = AioClient::new(config(), LengthPrefixed::default(), Recorder::default())
        .expect("客户端资源组应能创建");
    let session = client.connect(addr).expect("应能连接到服务端");

    let payload = vec![7_u8; 200 * 1024];
    session.send(&payload).expect("写入应被接受");
    session.close(false);

    assert!(wait_until(|| server.processor().messages().len() == 1));
    assert_eq!(server.processor().messages()[0], payload);
    assert!(wait_until(|| client.processor().count(SessionEvent::SessionClosed) == 1));
}

/// 超长长度前缀是致命解码错误：一次 `DecodeException`，不调用 `process`，随后关闭。
#[test]
fn oversized_frame_closes_session_with_one_decode_exception() {
    let (server, addr) = start_server(LengthPrefixed { max_frame: 1024 });
    let mut raw = StdTcpStream::connect(addr).expect("应能连接到服务端");
    raw.write_all(&u32::MAX.to_be_bytes()).expect("写入长度前缀");

    assert!(wait_until(|| server.processor().count(SessionEvent::SessionClosed) == 1));
    assert_eq!(server.processor().count(SessionEvent::DecodeException), 1);
    assert_eq!(
        server.processor().error_codes(SessionEvent::DecodeException),
        vec!["spark.socket.decode_failed"]
    );
    assert!(server.processor().messages().is_empty());

    raw.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");
    let mut rest = Vec::new();
    let _ = raw.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

/// 读缓冲被一条尚未完整的消息写满同样是致命解码错误。
#[test]
fn full_read_buffer_without_message_is_fatal() {
    let mut server = AioServer::new(
        config().with_read_buffer_size(64),
        LengthPrefixed::default(),
        Recorder::default(),
    );
    let addr = server.start().expect("服务端应能绑定回环地址");
    let mut raw = StdTcpStream::connect(addr).expect("应能连接到服务端");
    let mut bytes = 1000_u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(&[1_u8; 200]);
    raw.write_all(&bytes).expect("写入半条消息");

    assert!(wait_until(|| server.processor().count(SessionEvent::SessionClosed) == 1));
    assert_eq!(
        server.processor().error_codes(SessionEvent::DecodeException),
        vec!["spark.socket.read_buffer_overflow"]
    );
    assert!(server.processor().messages().is_empty());
    let group = server.group().expect("服务端已启动");
    assert!(wait_until(|| group.arena().stats().in_use == 0));
}

/// `process` 的错误与 panic 只上报，会话继续服务后续消息。
#[test]
fn processor_failures_keep_session_alive() {
    let (server, addr) = start_server(LengthPrefixed::default());
    let mut raw = StdTcpStream::connect(addr).expect("应能连接到服务端");
    let mut bytes = frame(b"FAIL");
    bytes.extend(frame(b"PANIC"));
    bytes.extend(frame(b"PING"));
    raw.write_all(&bytes).expect("写入三条消息");

    raw.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");
    let mut reply = [0_u8; 8];
    raw.read_exact(&mut reply).expect("应收到 PONG");
    assert_eq!(reply.to_vec(), frame(b"PONG"));

    assert_eq!(server.processor().count(SessionEvent::ProcessException), 2);
    assert_eq!(
        server.processor().error_codes(SessionEvent::ProcessException),
        vec!["spark.socket.process_failed"; 2]
    );
    assert_eq!(server.processor().count(SessionEvent::SessionClosed), 0);
}

/// 接入过滤拒绝的连接不会创建会话。
#[test]
fn accept_filter_rejects_connection() {
    let mut server = AioServer::new(config(), LengthPrefixed::default(), Recorder::default())
        .with_accept_filter(|_peer: std::net::SocketAddr| false);
    let addr = server.start().expect("服务端应能绑定回环地址");

    let mut raw = StdTcpStream::connect(addr).expect("TCP 握手由内核完成");
    raw.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");
    let mut sink = [0_u8; 1];
    assert!(matches!(raw.read(&mut sink), Ok(0) | Err(_)));

    assert!(wait_until(|| server.processor().count(SessionEvent::AcceptRejected) == 1));
    assert_eq!(server.processor().count(SessionEvent::NewSession), 0);
    assert_eq!(server.group().expect("服务端已启动").session_count(), 0);
}

/// 重复启动被拒绝；关闭后本地地址不再可用。
#[test]
fn server_start_is_single_shot() {
    let (mut server, _addr) = start_server(LengthPrefixed::default());
    assert!(matches!(
        server.start(),
        Err(spark_socket_tcp::ServiceError::AlreadyStarted)
    ));
    server.shutdown();
    server.shutdown();
    assert!(server.local_addr().is_none());
}
