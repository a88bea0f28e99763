use std::fmt;

/// 会话生命周期事件，经 `MessageProcessor::state_event` 同步派发。
///
/// # 契约说明（What）
/// - `NewSession` 先于该会话的任何读取；TLS 会话在首个 `process` 之前派发 `HandshakeCompleted`；
/// - `SessionClosed` 每个会话恰好一次，且是该会话的最后一个事件；
/// - `AcceptRejected` / `AcceptException` 不关联会话（`session` 参数为 `None`）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    NewSession,
    HandshakeCompleted,
    InputShutdown,
    DecodeException,
    ProcessException,
    WriteException,
    ReadException,
    SessionClosing,
    SessionClosed,
    AcceptRejected,
    AcceptException,
}

impl SessionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewSession => "new_session",
            Self::HandshakeCompleted => "handshake_completed",
            Self::InputShutdown => "input_shutdown",
            Self::DecodeException => "decode_exception",
            Self::ProcessException => "process_exception",
            Self::WriteException => "write_exception",
            Self::ReadException => "read_exception",
            Self::SessionClosing => "session_closing",
            Self::SessionClosed => "session_closed",
            Self::AcceptRejected => "accept_rejected",
            Self::AcceptException => "accept_exception",
        }
    }

    /// 携带错误的事件。
    pub fn is_exception(self) -> bool {
        matches!(
            self,
            Self::DecodeException
                | Self::ProcessException
                | Self::WriteException
                | Self::ReadException
                | Self::AcceptException
        )
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
