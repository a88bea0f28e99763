#![deny(unsafe_code)]

//! `spark-socket-core` 定义会话传输核心的全部契约与共享构件。
//!
//! # 模块定位（Why）
//! - TCP、TLS、UDP 三条传输路径共享同一套会话语义：协议编解码、业务回调、
//!   生命周期事件、单写者写队列与背压；
//! - 把这些语义集中在不依赖具体网络运行时的 crate 中，传输实现只负责把字节搬进搬出。
//!
//! # 模块地图（How）
//! - [`protocol`]：`Protocol` 与 `MessageProcessor` 两个调用方扩展点；
//! - [`session`]：对象安全的 `Session` 能力接口、`SessionId` 与附件槽；
//! - [`state`]：会话状态机与唯一的受保护迁移函数；
//! - [`write_queue`]：有界写队列 + 单许可准入闸门；
//! - [`ring`] / [`dispatch`]：跨线程事件环与读完成回调的派发策略；
//! - [`config`]：TOML 可加载的传输配置；
//! - [`error`] / [`event`]：错误分类与生命周期事件。

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod protocol;
pub mod ring;
pub mod session;
pub mod state;
pub mod write_queue;

pub use config::{
    ArenaSettings, ClientAuth, ConfigError, SocketOptions, TlsSettings, TransportConfig,
};
pub use dispatch::{DispatchStats, ReadDispatcher};
pub use error::{
    BoxError, DecodeError, EncodeError, OperationKind, SendError, TransportError, WriteRejected,
};
pub use event::SessionEvent;
pub use protocol::{MessageProcessor, Protocol, process_guarded, write_message};
pub use ring::EventRing;
pub use session::{Attachment, AttachmentSlot, Session, SessionId};
pub use state::{SessionState, SessionStateCell, Transition};
pub use write_queue::{QueueFull, WritePermit, WriteQueue, WriteStep};

pub use spark_socket_buffer::{ArenaConfig, ArenaStats, BufferArena, BufferHandle};

#[allow(dead_code)]
fn _assert_send_sync() {
    fn assert_send_sync<T: Send + Sync + 'static>() {}

    assert_send_sync::<WriteQueue>();
    assert_send_sync::<ReadDispatcher>();
    assert_send_sync::<EventRing<BufferHandle>>();
    assert_send_sync::<SessionStateCell>();
    assert_send_sync::<TransportError>();
}
