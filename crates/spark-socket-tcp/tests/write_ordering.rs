//! 真实套接字上的写入顺序：任意写入序列到达对端的字节流等于各次写入的拼接。

mod support;

use std::{io::Read, net::TcpListener, time::Duration};

use proptest::prelude::*;
use spark_socket_core::Session;
use spark_socket_tcp::AioClient;
use support::{LengthPrefixed, Recorder, config};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn session_writes_reach_peer_in_order(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..2048), 1..48),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("应能绑定回环地址");
        let client = AioClient::new(config(), LengthPrefixed::default(), Recorder::default())
            .expect("客户端资源组应能创建");
        let session = client
            .connect(listener.local_addr().expect("监听地址"))
            .expect("应能连接");
        let (mut peer, _) = listener.accept().expect("应能接入");
        peer.set_read_timeout(Some(Duration::from_secs(5))).expect("设置读超时");

        for chunk in &chunks {
            session.write(chunk).expect("写队列容量足以容纳全部写入");
        }
        let expected = chunks.concat();
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).expect("应在超时前收到全部字节");

        prop_assert_eq!(received, expected);
        session.close(true);
    }
}
