use proxy_exchange::{exchange, AddressCandidate, AddressList, ErrorKind, ExchangeConfig, ExchangeError};
use proxy_wire::tags::field;
use proxy_wire::{read_frame, write_frame, Envelope, FrameConfig, RequestTag};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Answers every connection with `reply` after reading one request.
async fn fixed_peer(reply: Envelope) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let config = FrameConfig::default();
            if read_frame(&mut socket, &config).await.is_err() {
                continue;
            }
            let _ = write_frame(&mut socket, &reply.encode().unwrap(), &config).await;
        }
    });
    (port, handle)
}

fn redirect_to(revision: u64, port: u16) -> Envelope {
    Envelope::failed("host is served by another node").with_field(
        field::REDIRECT,
        json!({"revision": revision, "address": format!("127.0.0.1:{port}")}),
    )
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").port()
}

#[tokio::test]
async fn redirect_is_followed_once() {
    let (target, target_task) = fixed_peer(Envelope::success().with_info("from target")).await;
    let (origin, origin_task) = fixed_peer(redirect_to(5, target)).await;

    let mut addresses = AddressList::new(AddressCandidate::new("127.0.0.1", origin));
    let request = Envelope::request(RequestTag::ProxyData);
    let reply = exchange(&mut addresses, &request, &ExchangeConfig::default(), true)
        .await
        .expect("exchange")
        .expect("reply");

    assert_eq!(reply.envelope.info.as_deref(), Some("from target"));
    assert_eq!(reply.address.port, target);
    assert_eq!(addresses.first().revision, 5);
    assert_eq!(addresses.first().port, target);
    assert_eq!(addresses.len(), 2);

    target_task.abort();
    origin_task.abort();
}

#[tokio::test]
async fn second_redirect_in_one_call_fails() {
    let (second, second_task) = fixed_peer(redirect_to(9, 1)).await;
    let (first, first_task) = fixed_peer(redirect_to(5, second)).await;

    let mut addresses = AddressList::new(AddressCandidate::new("127.0.0.1", first));
    let err = exchange(
        &mut addresses,
        &Envelope::request(RequestTag::ProxyData),
        &ExchangeConfig::default(),
        true,
    )
    .await
    .expect_err("sequential redirect");
    assert!(matches!(err, ExchangeError::SequentialRedirect));
    assert_eq!(err.kind(), ErrorKind::Fail);
    assert_eq!(addresses.first().revision, 5);

    second_task.abort();
    first_task.abort();
}

#[tokio::test]
async fn failed_retry_keeps_redirect_for_next_call() {
    let unreachable = closed_port().await;
    let (origin, origin_task) = fixed_peer(redirect_to(5, unreachable)).await;

    let mut addresses = AddressList::new(AddressCandidate::new("127.0.0.1", origin));
    let err = exchange(
        &mut addresses,
        &Envelope::request(RequestTag::ProxyData),
        &ExchangeConfig::default(),
        true,
    )
    .await
    .expect_err("redirect target is down");
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert_eq!(addresses.first().port, unreachable);
    assert_eq!(addresses.first().revision, 5);

    origin_task.abort();
}

#[tokio::test]
async fn stale_redirect_leaves_list_untouched() {
    let (target, target_task) = fixed_peer(Envelope::success()).await;
    let (stale, stale_task) = fixed_peer(redirect_to(3, target)).await;

    let mut addresses = AddressList::new(AddressCandidate::new("127.0.0.1", target));
    addresses.apply_redirect(&proxy_exchange::RedirectDirective::Address {
        revision: 5,
        host: "127.0.0.1".to_string(),
        port: stale,
    });
    let before = addresses.clone();

    // The stale answer is retried against the same first address, which
    // keeps answering with the stale redirect.
    let err = exchange(
        &mut addresses,
        &Envelope::request(RequestTag::ProxyData),
        &ExchangeConfig::default(),
        true,
    )
    .await
    .expect_err("second redirect");
    assert!(matches!(err, ExchangeError::SequentialRedirect));
    assert_eq!(addresses, before);

    target_task.abort();
    stale_task.abort();
}
