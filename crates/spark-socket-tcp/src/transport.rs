use std::{future::Future, io, net::SocketAddr, pin::Pin};

use spark_socket_core::{BufferHandle, TransportError};

#[cfg(feature = "runtime-tokio")]
pub use self::tokio_impl::{PlainTransport, PlainTransportFactory, TransportFactory};

/// 就绪等待的返回类型。
pub type IoFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// 通道启动阶段（TLS 握手）的返回类型。
pub type StartFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// `StreamTransport` 描述会话所需的全部字节通道能力。
///
/// # 意图（Why）
/// - 会话驱动逻辑（读循环、写泵、关闭）只依赖这组能力，
///   明文 TCP 与 TLS 以组合方式各自实现，互不继承；
/// - `try_*` + 就绪等待的组合让会话能够区分“立即完成”与“稍后完成”，
///   前者在当前线程直接回调，后者挂到运行时任务上。
///
/// # 契约（What）
/// - `try_read`：把明文写入 `dst` 的空闲区并 `commit`，返回写入字节数；`Ok(0)` 表示对端关闭；
///   暂无数据返回 `WouldBlock`；调用方保证 `dst.spare() > 0`；
/// - `try_write`：从 `src` 可读区消费明文并 `advance`，返回消费字节数；通道满返回 `WouldBlock`；
/// - `flush_pending`：把实现内部缓存的待发字节（TLS 密文）写出，未写完返回 `WouldBlock`；
/// - `has_pending_output`：读取期间产生、尚未写出的内部字节（TLS 回应记录），
///   会话在每次读尝试之后检查，为真时经 `flush_pending` 冲刷并在写满时等待可写；
/// - `shutdown`：同时关闭读写两个方向，幂等，并释放实现持有的竞技场缓冲；
/// - `start`：启动阶段，完成之前会话不会发起读取。
pub trait StreamTransport: Send + Sync + 'static {
    fn start(&self) -> StartFuture<'_> {
        Box::pin(std::future::ready(Ok(())))
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn try_read(&self, dst: &mut BufferHandle) -> io::Result<usize>;

    fn readable(&self) -> IoFuture<'_>;

    fn try_write(&self, src: &mut BufferHandle) -> io::Result<usize>;

    fn flush_pending(&self) -> io::Result<()> {
        Ok(())
    }

    fn has_pending_output(&self) -> bool {
        false
    }

    fn writable(&self) -> IoFuture<'_>;

    fn shutdown(&self);

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

#[cfg(feature = "runtime-tokio")]
mod tokio_impl {
    use std::{
        io,
        net::{Shutdown, SocketAddr},
        sync::atomic::{AtomicBool, Ordering},
    };

    use bytes::Buf;
    use socket2::SockRef;
    use spark_socket_core::{BufferArena, BufferHandle, TransportError};
    use tokio::net::TcpStream;

    use super::{IoFuture, StreamTransport};

    /// 为新建立的 TCP 连接选择通道实现（明文或 TLS）。
    pub trait TransportFactory: Send + Sync + 'static {
        fn wrap(
            &self,
            stream: TcpStream,
            arena: &BufferArena,
        ) -> Result<Box<dyn StreamTransport>, TransportError>;
    }

    /// 明文通道工厂。
    #[derive(Clone, Copy, Debug, Default)]
    pub struct PlainTransportFactory;

    impl TransportFactory for PlainTransportFactory {
        fn wrap(
            &self,
            stream: TcpStream,
            _arena: &BufferArena,
        ) -> Result<Box<dyn StreamTransport>, TransportError> {
            Ok(Box::new(PlainTransport::new(stream)))
        }
    }

    /// 明文 TCP 通道：`tokio::net::TcpStream` 的非阻塞读写加就绪等待。
    ///
    /// TLS 通道以组合方式持有一个 `PlainTransport` 收发密文。
    #[derive(Debug)]
    pub struct PlainTransport {
        stream: TcpStream,
        shut: AtomicBool,
    }

    impl PlainTransport {
        pub fn new(stream: TcpStream) -> Self {
            Self {
                stream,
                shut: AtomicBool::new(false),
            }
        }

        pub fn stream(&self) -> &TcpStream {
            &self.stream
        }

        pub fn is_shutdown(&self) -> bool {
            self.shut.load(Ordering::Acquire)
        }
    }

    impl StreamTransport for PlainTransport {
        fn try_read(&self, dst: &mut BufferHandle) -> io::Result<usize> {
            if dst.spare() == 0 {
                return Err(io::Error::other("read buffer has no spare capacity"));
            }
            let n = self.stream.try_read(dst.spare_mut())?;
            dst.commit(n);
            Ok(n)
        }

        fn readable(&self) -> IoFuture<'_> {
            Box::pin(self.stream.readable())
        }

        fn try_write(&self, src: &mut BufferHandle) -> io::Result<usize> {
            if !src.has_remaining() {
                return Ok(0);
            }
            let n = self.stream.try_write(src.chunk())?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            src.advance(n);
            Ok(n)
        }

        fn writable(&self) -> IoFuture<'_> {
            Box::pin(self.stream.writable())
        }

        fn shutdown(&self) {
            if self.shut.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Err(error) = SockRef::from(&self.stream).shutdown(Shutdown::Both)
                && error.kind() != io::ErrorKind::NotConnected
            {
                tracing::debug!(%error, "tcp shutdown failed");
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.stream.local_addr()
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.stream.peer_addr()
        }
    }

}
