//! Serial forwarder protocol over a real TCP connection

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use moteproto::network::SfSource;
use moteproto::protocol::SfCodec;
use moteproto::{PacketSource, TimestampedPacketSource};

#[tokio::test]
async fn test_forwarder_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let forwarder = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"UT").await.unwrap();
        let mut hello = [0u8; 2];
        stream.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello, b"UT");

        let mut framed = Framed::new(stream, SfCodec::new(b'T'));
        let packet = framed.next().await.unwrap().unwrap();
        // echo with the sender's timestamp preserved
        framed.send(packet).await.unwrap();
    });

    let source = SfSource::connect_tcp(addr).await.unwrap();
    assert_eq!(source.name(), format!("sf@{}", addr));
    source.open().await.unwrap();
    assert!(source.supports_timestamping());

    let before = moteproto::time::now_millis();
    assert!(source.write_packet(&[0x00, 0xff, 0xff]).await.unwrap());
    let echoed = source.read_packet().await.unwrap();
    assert_eq!(&echoed[..], &[0x00, 0xff, 0xff]);
    assert!(source.last_timestamp() >= before);

    forwarder.await.unwrap();
    source.close().await.unwrap();
}
