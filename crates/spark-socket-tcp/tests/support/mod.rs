//! TCP 集成测试共享的长度前缀协议与事件记录处理器。

#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use spark_socket_core::{
    BoxError, BufferHandle, DecodeError, EncodeError, MessageProcessor, Protocol, Session,
    SessionEvent, TransportConfig, TransportError,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// 4 字节大端长度前缀 + 负载。
#[derive(Clone, Copy, Debug)]
pub struct LengthPrefixed {
    pub max_frame: usize,
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self { max_frame: 1 << 20 }
    }
}

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
        if length > self.max_frame {
            return Err(DecodeError::FrameTooLarge {
                length,
                limit: self.max_frame,
            });
        }
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
        let length = u32::try_from(message.len())
            .map_err(|_| EncodeError::Invalid("frame longer than u32::MAX".into()))?;
        out.put_u32(length);
        out.extend_from_slice(message);
        Ok(())
    }
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// 记录事件与消息；`PING` 回复 `PONG`，`FAIL` 返回错误，`PANIC` 直接 panic。
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<(SessionEvent, Option<&'static str>)>>,
    messages: Mutex<Vec<Vec<u8>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().iter().map(|(event, _)| *event).collect()
    }

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

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().clone()
    }
}

impl MessageProcessor<Vec<u8>> for Recorder {
    fn process(&self, session: &dyn Session, message: Vec<u8>) -> Result<(), BoxError> {
        self.messages.lock().push(message.clone());
        match message.as_slice() {
            b"PING" => {
                session.write(&frame(b"PONG"))?;
                Ok(())
            }
            b"FAIL" => Err("processor rejected message".into()),
            b"PANIC" => panic!("processor exploded"),
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
}

/// 轮询直到条件成立或超时。
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
