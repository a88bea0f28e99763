#![deny(unsafe_code)]

//! `spark-socket-buffer` 为会话读写路径提供分页缓冲竞技场（Buffer Arena）。
//!
//! # 模块定位（Why）
//! - 会话的读缓冲、写队列条目、TLS 密文暂存区都需要固定容量的字节块，
//!   若每次都向系统申请内存，高连接数下会产生明显的分配抖动；
//! - 竞技场预先分配若干页，按二次幂尺寸类切分复用，并在页耗尽时降级为独立分配，
//!   保证 `allocate` 永不失败、永不阻塞。
//!
//! # 设计概要（How）
//! - [`arena`] 模块维护页、尺寸类自由链表与统计计数；
//! - [`handle`] 模块实现 [`BufferHandle`]，以 `position`/`limit` 游标描述可读区与空闲区，
//!   并实现 [`bytes::Buf`] 供协议解码器直接消费；
//! - 句柄不可 `Clone`，所有权随会话组件转移，`release(self)` 消耗句柄，
//!   从类型层面杜绝重复释放与释放后使用。
//!
//! # 契约说明（What）
//! - 所有公开类型满足 `Send + Sync + 'static`（句柄为 `Send`），可跨线程转移；
//! - 统计快照 [`ArenaStats`] 满足 `allocations == releases + implicit_releases + in_use`。

mod arena;
mod handle;

pub use arena::{ArenaConfig, ArenaStats, BufferArena};
pub use handle::BufferHandle;

#[allow(dead_code)]
fn _assert_send_sync() {
    fn assert_send_sync<T: Send + Sync + 'static>() {}
    fn assert_send<T: Send + 'static>() {}

    assert_send_sync::<BufferArena>();
    assert_send::<BufferHandle>();
}
