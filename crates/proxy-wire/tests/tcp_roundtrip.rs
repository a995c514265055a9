use proxy_wire::{
    read_frame, tags::field, write_frame, Envelope, FrameConfig, MoreFlag, RequestTag,
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn request_and_response_cross_a_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let config = FrameConfig::default();
        let frame = read_frame(&mut socket, &config).await.expect("read request");
        let request = Envelope::decode(&frame.payload).expect("decode request");
        assert_eq!(request.request_tag(), Some(RequestTag::ProxyData));

        let mut response = Envelope::success().with_version("7.0.0");
        response.set_field(field::HISTORY_DATA, json!([{"id": 7, "itemid": 1}]));
        response.set_more(MoreFlag::More);
        write_frame(&mut socket, &response.encode().unwrap(), &config)
            .await
            .expect("write response");
    });

    let mut client = TcpStream::connect(addr).await.expect("connect");
    let config = FrameConfig::default();
    let request = Envelope::request(RequestTag::ProxyData);
    write_frame(&mut client, &request.encode().unwrap(), &config)
        .await
        .expect("write request");
    let frame = read_frame(&mut client, &config).await.expect("read response");
    let response = Envelope::decode(&frame.payload).expect("decode response");

    assert!(response.is_success());
    assert_eq!(response.more(), MoreFlag::More);
    assert_eq!(response.version.as_deref(), Some("7.0.0"));
    assert_eq!(
        response
            .field_array(field::HISTORY_DATA)
            .map(|rows| rows.len()),
        Some(1)
    );

    server.await.expect("server task");
}

#[tokio::test]
async fn legacy_sender_is_read_until_half_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        read_frame(&mut socket, &FrameConfig::default())
            .await
            .expect("read")
    });

    let mut client = TcpStream::connect(addr).await.expect("connect");
    client.write_all(b"web01:agent.ping:1").await.expect("write");
    client.shutdown().await.expect("shutdown");

    let frame = server.await.expect("server task");
    assert!(frame.legacy);
    assert_eq!(&frame.payload[..], b"web01:agent.ping:1");
}
