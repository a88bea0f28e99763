use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use bytes::BytesMut;
use spark_socket_buffer::BufferHandle;

use crate::{
    error::{BoxError, DecodeError, EncodeError, SendError, TransportError},
    event::SessionEvent,
    session::Session,
};

/// `Protocol` 把字节流切分为消息，并把消息编码回字节。
///
/// # 契约说明（What）
/// - `decode` 必须非阻塞：可读字节不足一条完整消息时返回 `Ok(None)` 且不得消费任何字节；
///   成功时恰好消费一条消息对应的字节；
/// - 返回 `Err` 表示字节流已不可恢复，会话将以 `DecodeException` 关闭；
/// - 同一实例在所有会话间共享，实现必须无会话内可变状态（需要时放入会话附件）；
/// - UDP 路径上每个数据报恰好调用一次 `decode`，缓冲中即为完整数据报。
pub trait Protocol: Send + Sync + 'static {
    type Message: Send + 'static;

    fn decode(
        &self,
        buffer: &mut BufferHandle,
        session: &dyn Session,
    ) -> Result<Option<Self::Message>, DecodeError>;

    fn encode(
        &self,
        message: &Self::Message,
        session: &dyn Session,
        out: &mut BytesMut,
    ) -> Result<(), EncodeError>;
}

/// `MessageProcessor` 是业务回调与生命周期事件的接收端。
///
/// # 契约说明（What）
/// - `process` 在 I/O 完成线程或事件环消费线程上执行，不应长时间阻塞；
///   返回 `Err` 或 panic 都会被捕获并以 `ProcessException` 上报，会话继续存活；
/// - `state_event` 同步派发，`error` 仅在异常类事件上携带；
///   `AcceptRejected` 等无会话事件的 `session` 为 `None`。
pub trait MessageProcessor<M>: Send + Sync + 'static {
    fn process(&self, session: &dyn Session, message: M) -> Result<(), BoxError>;

    fn state_event(
        &self,
        session: Option<&dyn Session>,
        event: SessionEvent,
        error: Option<&TransportError>,
    ) {
        let _ = (session, event, error);
    }
}

/// 调用 `process` 并把返回错误与 panic 统一转换为 [`TransportError::Process`]。
pub fn process_guarded<M, H>(
    handler: &H,
    session: &dyn Session,
    message: M,
) -> Result<(), TransportError>
where
    H: MessageProcessor<M> + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| handler.process(session, message))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(TransportError::Process(error)),
        Err(payload) => Err(TransportError::Process(panic_message(payload).into())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => format!("process panicked: {message}"),
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(message) => format!("process panicked: {message}"),
            None => "process panicked".to_owned(),
        },
    }
}

/// 用协议编码消息并写入会话。
pub fn write_message<P: Protocol>(
    session: &dyn Session,
    protocol: &P,
    message: &P::Message,
) -> Result<(), SendError> {
    let mut out = BytesMut::new();
    protocol.encode(message, session, &mut out)?;
    session.write(&out)?;
    Ok(())
}
