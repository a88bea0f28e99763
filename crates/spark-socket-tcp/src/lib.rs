#![deny(unsafe_code)]

//! `spark-socket-tcp` 在 Tokio 就绪模型之上实现完成驱动的 TCP 会话。
//!
//! # 模块定位（Why）
//! - 会话以“发起读 → 完成回调 → 解码派发 → 重新发起读”的循环驱动，
//!   写路径经由单写者写队列串行化，语义与平台无关；
//! - 明文与 TLS 通道通过 [`StreamTransport`] 能力接口接入同一个 [`StreamSession`]，
//!   会话本身不感知加密层。
//!
//! # 模块地图（How）
//! - [`transport`]：`StreamTransport` 能力接口、明文实现与通道工厂；
//! - [`session`]：会话状态机、读循环、写泵与关闭流程；
//! - [`group`]：`IoGroup`，聚合运行时、竞技场、派发器与会话登记表；
//! - [`server`] / [`client`]：接入器与连接器；
//! - `socket`：基于 `socket2` 的套接字选项落地。
//!
//! # 契约说明（What）
//! - 所有 I/O 线程上的错误都转化为生命周期事件交给 `MessageProcessor::state_event`，
//!   不会以 panic 或 `Err` 形式越过组件边界；
//! - 调用方必须在 Tokio 多线程运行时（由 `IoGroup` 创建）之外调用阻塞式 API。

mod error;
pub mod transport;

#[cfg(feature = "runtime-tokio")]
pub mod client;
#[cfg(feature = "runtime-tokio")]
pub mod group;
#[cfg(feature = "runtime-tokio")]
pub mod server;
#[cfg(feature = "runtime-tokio")]
pub mod session;
#[cfg(feature = "runtime-tokio")]
mod socket;

pub use error::ServiceError;
pub use transport::{IoFuture, StartFuture, StreamTransport};

#[cfg(feature = "runtime-tokio")]
pub use client::AioClient;
#[cfg(feature = "runtime-tokio")]
pub use group::IoGroup;
#[cfg(feature = "runtime-tokio")]
pub use server::{AcceptFilter, AioServer};
#[cfg(feature = "runtime-tokio")]
pub use session::StreamSession;
#[cfg(feature = "runtime-tokio")]
pub use transport::{PlainTransport, PlainTransportFactory, TransportFactory};
