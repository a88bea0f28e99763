//! UDP 集成测试共享的数据报协议与事件记录处理器。

#![allow(dead_code)]

use std::{
    net::{SocketAddr, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use spark_socket_core::{
    BoxError, BufferHandle, DecodeError, EncodeError, MessageProcessor, Protocol, Session,
    SessionEvent, TransportConfig, TransportError, WriteRejected,
};

/// 整个数据报即一条消息；空数据报解码为 `None`，以 `BAD` 开头的数据报解码失败。
#[derive(Clone, Copy, Debug, Default)]
pub struct Datagram;

impl Protocol for Datagram {
    type Message = Vec<u8>;

    fn decode(
        &self,
        buffer: &mut BufferHandle,
        _session: &dyn Session,
    ) -> Result<Option<Vec<u8>>, DecodeError> {
        let readable = buffer.readable();
        if readable.is_empty() {
            return Ok(None);
        }
        if readable.starts_with(b"BAD") {
            return Err(DecodeError::malformed("datagram flagged as malformed"));
        }
        let message = readable.to_vec();
        buffer.advance(message.len());
        Ok(Some(message))
    }

    fn encode(
        &self,
        message: &Vec<u8>,
        _session: &dyn Session,
        out: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        out.extend_from_slice(message);
        Ok(())
    }
}

/// 记录事件与消息。
///
/// - `PING` 回复 `PONG`；
/// - `BURST` 连续写入三个数据报并记录每次写入的结果；
/// - `FAIL` 返回错误。
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<(SessionEvent, Option<&'static str>)>>,
    messages: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    bursts: Mutex<Vec<(SocketAddr, Vec<Result<(), WriteRejected>>)>>,
}

impl Recorder {
    pub fn count(&self, event: SessionEvent) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(seen, _)| *seen == event)
            .count()
    }

    pub fn error_codes(&self, event: SessionEvent) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|(seen, _)| *seen == event)
            .filter_map(|(_, code)| *code)
            .collect()
    }

    pub fn messages(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.messages.lock().clone()
    }

    pub fn messages_from(&self, remote: SocketAddr) -> Vec<Vec<u8>> {
        self.messages
            .lock()
            .iter()
            .filter(|(from, _)| *from == remote)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn bursts(&self) -> Vec<(SocketAddr, Vec<Result<(), WriteRejected>>)> {
        self.bursts.lock().clone()
    }
}

impl MessageProcessor<Vec<u8>> for Recorder {
    fn process(&self, session: &dyn Session, message: Vec<u8>) -> Result<(), BoxError> {
        let remote = session.remote_addr()?;
        self.messages.lock().push((remote, message.clone()));
        match message.as_slice() {
            b"PING" => {
                session.write(b"PONG")?;
                Ok(())
            }
            b"BURST" => {
                let results = (0..3).map(|n| session.write(&[b'0' + n])).collect();
                self.bursts.lock().push((remote, results));
                Ok(())
            }
            b"FAIL" => Err("processor rejected datagram".into()),
            _ => Ok(()),
        }
    }

    fn state_event(
        &self,
        _session: Option<&dyn Session>,
        event: SessionEvent,
        error: Option<&TransportError>,
    ) {
        self.events.lock().push((event, error.map(TransportError::code)));
    }
}

pub fn config() -> TransportConfig {
    TransportConfig::new(0)
        .with_host("127.0.0.1")
        .with_thread_num(2)
        .with_udp_workers(2)
}

/// 绑定回环地址的阻塞式对端，读超时 5 秒。
pub fn peer() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("绑定对端套接字");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");
    socket
}

pub fn receive(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (length, _) = socket.recv_from(&mut buf).expect("应在超时前收到数据报");
    buf[..length].to_vec()
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
