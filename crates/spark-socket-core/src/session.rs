use std::{
    any::Any,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    error::{TransportError, WriteRejected},
    state::SessionState,
};

/// 会话附件：调用方挂载在会话上的任意状态。
pub type Attachment = Arc<dyn Any + Send + Sync>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内单调分配的会话标识，渲染为 `session-<n>`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// `Session` 是交给 `Protocol` 与 `MessageProcessor` 的对象安全能力接口。
///
/// # 设计初衷（Why）
/// - 明文 TCP、TLS、UDP 会话对业务侧呈现同一组能力，业务代码无需感知底层通道；
/// - 仅暴露写入、关闭、附件与地址查询，读取路径完全由传输层驱动。
///
/// # 契约说明（What）
/// - `write`：拷贝 `data` 进入写队列；队列满返回 [`WriteRejected::Backpressure`]，
///   会话终止后返回 [`WriteRejected::Closed`]；从不阻塞（TLS 握手前除外）；
/// - `close(true)`：丢弃排队数据立即关闭；`close(false)`：等写队列排空后关闭；
///   重复调用为空操作；
/// - `local_addr` / `remote_addr`：会话关闭后返回 [`TransportError::Closed`]；
/// - `is_invalid`：状态为 `Closing` 或 `Closed` 时为真。
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn write(&self, data: &[u8]) -> Result<(), WriteRejected>;

    fn close(&self, immediate: bool);

    fn state(&self) -> SessionState;

    fn is_invalid(&self) -> bool {
        self.state().is_terminal()
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    fn remote_addr(&self) -> Result<SocketAddr, TransportError>;

    fn attachment(&self) -> Option<Attachment>;

    fn set_attachment(&self, value: Option<Attachment>);
}

impl dyn Session + '_ {
    /// 以具体类型读取附件，类型不匹配时返回 `None`。
    pub fn attachment_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.attachment()?.downcast::<T>().ok()
    }
}

/// 会话实现共享的附件槽。
#[derive(Default)]
pub struct AttachmentSlot {
    value: Mutex<Option<Attachment>>,
}

impl AttachmentSlot {
    pub fn get(&self) -> Option<Attachment> {
        self.value.lock().clone()
    }

    pub fn set(&self, value: Option<Attachment>) {
        *self.value.lock() = value;
    }

    /// 取走附件，会话关闭时调用以尽早释放调用方状态。
    pub fn take(&self) -> Option<Attachment> {
        self.value.lock().take()
    }
}

impl fmt::Debug for AttachmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentSlot")
            .field("occupied", &self.value.lock().is_some())
            .finish()
    }
}
