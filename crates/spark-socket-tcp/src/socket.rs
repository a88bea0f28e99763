use std::{io, net::SocketAddr};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use spark_socket_core::SocketOptions;
use tokio::net::{TcpListener, TcpStream};

/// 已接入/已连接套接字的选项。未显式配置时开启 `TCP_NODELAY`。
pub(crate) fn apply_stream_options(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.no_delay.unwrap_or(true))?;
    let sock = SockRef::from(stream);
    if let Some(size) = options.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(keep_alive) = options.keep_alive {
        sock.set_keepalive(keep_alive)?;
    }
    Ok(())
}

/// 创建监听套接字；必须在 Tokio 运行时上下文内调用。
///
/// 接收缓冲在 `listen` 之前设置，以便被接入的连接继承；`SO_REUSEADDR` 默认开启。
pub(crate) fn bind_listener(
    addr: SocketAddr,
    options: &SocketOptions,
    backlog: u32,
) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(options.reuse_address.unwrap_or(true))?;
    if let Some(size) = options.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
