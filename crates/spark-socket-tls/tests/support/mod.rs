//! TLS 集成测试共享的协议、处理器与临时密钥材料。

#![allow(dead_code)]

use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use spark_socket_core::{
    BoxError, BufferHandle, DecodeError, EncodeError, MessageProcessor, Protocol, Session,
    SessionEvent, TransportConfig, TransportError,
};

pub const SERVER_NAME: &str = "localhost";

/// 4 字节大端长度前缀 + 负载。
#[derive(Clone, Copy, Debug, Default)]
pub struct LengthPrefixed;

impl Protocol for LengthPrefixed {
    type Message = Vec<u8>;

    fn decode(
        &self,
        buffer: &mut BufferHandle,
        _session: &dyn Session,
    ) -> Result<Option<Vec<u8>>, DecodeError> {
        let readable = buffer.readable();
        if readable.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([readable[0], readable[1], readable[2], readable[3]]) as usize;
        if readable.len() < 4 + length {
            return Ok(None);
        }
        let message = readable[4..4 + length].to_vec();
        buffer.advance(4 + length);
        Ok(Some(message))
    }

    fn encode(
        &self,
        message: &Vec<u8>,
        _session: &dyn Session,
        out: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        out.put_u32(message.len() as u32);
        out.extend_from_slice(message);
        Ok(())
    }
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    Event(SessionEvent, Option<&'static str>),
    Message(Vec<u8>),
}

/// 按发生顺序记录事件与消息；`PING` 回复 `PONG`，以 `ECHO` 开头的消息原样回送。
///
/// 配置了 `greeting` 时在 `NewSession` 回调内立即写出问候，此时握手尚未完成。
#[derive(Debug, Default)]
pub struct Recorder {
    timeline: Mutex<Vec<Entry>>,
    greeting: Option<&'static [u8]>,
}

impl Recorder {
    pub fn greeting(payload: &'static [u8]) -> Self {
        Self {
            timeline: Mutex::default(),
            greeting: Some(payload),
        }
    }

    pub fn timeline(&self) -> Vec<Entry> {
        self.timeline.lock().clone()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.timeline
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Message(message) => Some(message.clone()),
                Entry::Event(..) => None,
            })
            .collect()
    }

    pub fn count(&self, event: SessionEvent) -> usize {
        self.timeline
            .lock()
            .iter()
            .filter(|entry| matches!(entry, Entry::Event(seen, _) if *seen == event))
            .count()
    }

    pub fn error_codes(&self, event: SessionEvent) -> Vec<&'static str> {
        self.timeline
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Event(seen, code) if *seen == event => *code,
                _ => None,
            })
            .collect()
    }

    /// 某事件第一次出现的位置。
    pub fn position(&self, event: SessionEvent) -> Option<usize> {
        self.timeline
            .lock()
            .iter()
            .position(|entry| matches!(entry, Entry::Event(seen, _) if *seen == event))
    }

    pub fn first_message_position(&self) -> Option<usize> {
        self.timeline
            .lock()
            .iter()
            .position(|entry| matches!(entry, Entry::Message(_)))
    }
}

impl MessageProcessor<Vec<u8>> for Recorder {
    fn process(&self, session: &dyn Session, message: Vec<u8>) -> Result<(), BoxError> {
        let reply = if message == b"PING" {
            Some(frame(b"PONG"))
        } else if message.starts_with(b"ECHO") {
            Some(frame(&message))
        } else {
            None
        };
        self.timeline.lock().push(Entry::Message(message));
        if let Some(reply) = reply {
            session.write(&reply)?;
        }
        Ok(())
    }

    fn state_event(
        &self,
        session: Option<&dyn Session>,
        event: SessionEvent,
        error: Option<&TransportError>,
    ) {
        self.timeline
            .lock()
            .push(Entry::Event(event, error.map(TransportError::code)));
        if event == SessionEvent::NewSession
            && let (Some(payload), Some(session)) = (self.greeting, session)
        {
            let _ = session.write(&frame(payload));
        }
    }
}

pub fn config() -> TransportConfig {
    TransportConfig::new(0)
        .with_host("127.0.0.1")
        .with_thread_num(2)
}

/// 读缓冲足以容纳单个大帧（数倍于一条 TLS 记录）。
pub fn large_frame_config() -> TransportConfig {
    config().with_read_buffer_size(256 * 1024)
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

/// 临时目录中的自签名 PEM：`keystore.pem`（证书 + 私钥）与 `cert.pem`（仅证书）。
pub struct PemFiles {
    dir: PathBuf,
}

impl PemFiles {
    pub fn generate(label: &str) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "spark-socket-tls-it-{label}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).expect("创建临时目录");
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()])
            .expect("生成自签名证书");
        let cert_pem = certified.cert.pem();
        fs::write(dir.join("cert.pem"), &cert_pem).expect("写入证书");
        fs::write(
            dir.join("keystore.pem"),
            format!("{cert_pem}{}", certified.key_pair.serialize_pem()),
        )
        .expect("写入密钥库");
        Self { dir }
    }

    pub fn keystore(&self) -> PathBuf {
        self.dir.join("keystore.pem")
    }

    pub fn certificate(&self) -> PathBuf {
        self.dir.join("cert.pem")
    }
}

impl Drop for PemFiles {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}
