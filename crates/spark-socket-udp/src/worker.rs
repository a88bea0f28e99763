use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use spark_socket_core::{
    EventRing, MessageProcessor, Protocol, Session, SessionEvent, SessionState, process_guarded,
};

use crate::session::UdpSession;

/// 派发到分片工作线程的一条消息。
pub(crate) type Delivery<P, H> = (Arc<UdpSession<P, H>>, <P as Protocol>::Message);

/// 启动第 `index` 个分片工作线程，线程名 `spark-socket:udp-worker-<index>`。
///
/// 线程在事件环关闭且取尽剩余消息后退出。
pub(crate) fn spawn<P, H>(
    index: usize,
    ring: Arc<EventRing<Delivery<P, H>>>,
    processor: Arc<H>,
) -> io::Result<JoinHandle<()>>
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    thread::Builder::new()
        .name(format!("spark-socket:udp-worker-{index}"))
        .spawn(move || {
            loop {
                match ring.take_timeout(Duration::from_millis(200)) {
                    Some((session, message)) => process(&*processor, &session, message),
                    None if ring.is_closed() => break,
                    None => {}
                }
            }
            tracing::debug!(shard = index, "udp worker stopped");
        })
}

/// 在当前线程执行业务回调；会话已不再启用时丢弃消息。
pub(crate) fn process<P, H>(processor: &H, session: &UdpSession<P, H>, message: P::Message)
where
    P: Protocol,
    H: MessageProcessor<P::Message>,
{
    if session.state() != SessionState::Enabled {
        tracing::debug!(session = %session.id(), "udp session no longer enabled, message dropped");
        return;
    }
    if let Err(error) = process_guarded(processor, session, message) {
        tracing::debug!(session = %session.id(), %error, "process failed");
        session.emit(SessionEvent::ProcessException, Some(&error));
    }
}
