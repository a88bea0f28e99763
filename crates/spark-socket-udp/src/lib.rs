#![deny(unsafe_code)]

//! `spark-socket-udp` 在单个数据报套接字上复用多个逻辑会话。
//!
//! # 模块定位（Why）
//! - UDP 对端以远端地址区分，业务侧通过与 TCP 相同的 `Session` 能力接口收发与关闭；
//! - 接收、写出集中在一个接收任务上，业务处理按远端地址分片到专用线程，
//!   同一对端的消息保持接收顺序。
//!
//! # 模块地图（How）
//! - [`multiplexer`]：`UdpMultiplexer`，套接字绑定、接收任务、待写集合与分片派发；
//! - [`session`]：`UdpSession`，每个远端地址的状态、写队列与附件；
//! - `worker`：分片工作线程与业务回调的异常隔离。
//!
//! # 契约说明（What）
//! - 每个数据报恰好调用一次 `Protocol::decode`，解码结果为空的数据报被丢弃；
//! - `udp_workers == 0` 时消息在接收任务上同步处理；
//! - 写队列满时 `write` 返回 `WriteRejected::Backpressure`，只影响该远端地址。

pub mod multiplexer;
pub mod session;
mod worker;

pub use multiplexer::UdpMultiplexer;
pub use session::UdpSession;
