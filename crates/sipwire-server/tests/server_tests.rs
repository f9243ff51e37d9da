// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end server scenarios over loopback UDP.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use sipwire_core::{Headers, Method, Request, RequestLine, Response, SipUri};
use sipwire_parse::parse_message;
use sipwire_server::{ids, Server, ServerConfig};
use sipwire_transaction::{TimerDefaults, TransactionError};
use sipwire_transport::TransportKind;

const WAIT: Duration = Duration::from_secs(2);

fn fast_timers() -> TimerDefaults {
    TimerDefaults {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(80),
        t4: Duration::from_millis(40),
    }
}

async fn server_on_loopback() -> (Server, std::net::SocketAddr) {
    let server = Server::with_timers(
        ServerConfig {
            host_addr: "127.0.0.1".to_owned(),
            extensions: vec!["replaces".to_owned()],
        },
        fast_timers(),
    );
    server
        .listen(TransportKind::Udp, "127.0.0.1:0")
        .await
        .unwrap();
    let addr = server
        .transactions()
        .transport()
        .listen_addr(TransportKind::Udp)
        .unwrap();
    (server, addr)
}

async fn recv_response(socket: &UdpSocket) -> Response {
    let mut buf = vec![0u8; 65_535];
    let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    parse_message(&buf[..n])
        .expect("unparseable response")
        .as_response()
        .expect("expected a response")
        .clone()
}

#[tokio::test]
async fn invite_handler_is_invoked_exactly_once() {
    let (server, addr) = server_on_loopback().await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let (seen_tx, mut seen_rx) = mpsc::channel::<Request>(4);
    server.on_request(Method::Invite, move |req: Request| {
        let seen = seen_tx.clone();
        async move {
            let _ = seen.send(req).await;
        }
    });

    let invite = "INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:9001;branch=z9hG4bK-abc\r\n\
From: \"Alice\" <sip:alice@wonderland.com>;tag=1928301774\r\n\
To: \"Bob\" <sip:bob@far-far-away.com>\r\n\
Call-ID: abc@127.0.0.1\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n";
    peer.send_to(invite.as_bytes(), addr).await.unwrap();

    let req = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(req.method(), &Method::Invite);

    // A retransmission is absorbed by the transaction, not re-dispatched.
    peer.send_to(invite.as_bytes(), addr).await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), seen_rx.recv())
            .await
            .is_err(),
        "handler must be invoked exactly once"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn options_round_trip_between_two_servers() {
    let (uas, uas_addr) = server_on_loopback().await;
    let (uac, _uac_addr) = server_on_loopback().await;

    let responder = uas.clone();
    uas.on_request(Method::Options, move |req: Request| {
        let server = responder.clone();
        async move {
            let mut res = Response::from_request(&req, 200, "OK");
            if let Some(mut to) = res.to_header() {
                to.set_param("tag", Some(ids::generate_tag().as_str()));
                res.headers_mut().set("To", to.to_string());
            }
            let _ = server.respond(res).await;
        }
    });

    let mut headers = Headers::new();
    headers.push("From", "<sip:uac@127.0.0.1>;tag=uactag");
    headers.push("To", "<sip:uas@127.0.0.1>");
    headers.push("Call-ID", ids::generate_call_id("127.0.0.1"));
    headers.push("CSeq", "1 OPTIONS");
    let req = Request::new(
        RequestLine::new(
            Method::Options,
            SipUri::parse(&format!("sip:uas@{}:{}", uas_addr.ip(), uas_addr.port())).unwrap(),
        ),
        headers,
        Bytes::new(),
    );

    let mut responses = uac.request(req).await.unwrap();
    let res = timeout(WAIT, responses.recv()).await.unwrap().unwrap();
    assert_eq!(res.code(), 200);

    // The OPTIONS answer advertises the method set.
    let allow = res.headers().get("Allow").expect("Allow header");
    for required in ["INVITE", "ACK", "CANCEL", "OPTIONS"] {
        assert!(allow.contains(required), "Allow missing {required}");
    }

    // Exactly one response, then the channel closes at termination.
    let end = timeout(WAIT, responses.recv()).await.unwrap();
    assert!(end.is_none(), "channel should close after Timer K");

    uac.shutdown().await;
    uas.shutdown().await;
}

#[tokio::test]
async fn unknown_method_draws_405_with_allow() {
    let (server, addr) = server_on_loopback().await;
    server.on_request(Method::Invite, |_req: Request| async {});
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    let subscribe = format!(
        "SUBSCRIBE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{peer_port};branch=z9hG4bKsub1\r\n\
From: <sip:alice@127.0.0.1>;tag=s1\r\n\
To: <sip:bob@example.com>\r\n\
Call-ID: sub@127.0.0.1\r\n\
CSeq: 1 SUBSCRIBE\r\n\
Content-Length: 0\r\n\r\n"
    );
    peer.send_to(subscribe.as_bytes(), addr).await.unwrap();

    let res = recv_response(&peer).await;
    assert_eq!(res.code(), 405);
    let allow = res.headers().get("Allow").expect("Allow header");
    for required in ["INVITE", "ACK", "CANCEL"] {
        assert!(allow.contains(required), "Allow missing {required}");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn stray_ack_is_ignored() {
    let (server, addr) = server_on_loopback().await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    let ack = format!(
        "ACK sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{peer_port};branch=z9hG4bKlateack\r\n\
From: <sip:alice@127.0.0.1>;tag=s1\r\n\
To: <sip:bob@example.com>;tag=gone\r\n\
Call-ID: late@127.0.0.1\r\n\
CSeq: 1 ACK\r\n\
Content-Length: 0\r\n\r\n"
    );
    peer.send_to(ack.as_bytes(), addr).await.unwrap();

    // No response of any kind comes back.
    let mut buf = [0u8; 1024];
    assert!(
        timeout(Duration::from_millis(300), peer.recv_from(&mut buf))
            .await
            .is_err(),
        "a stray ACK must be dropped silently"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn send_apis_reject_after_shutdown() {
    let (server, addr) = server_on_loopback().await;
    server.shutdown().await;

    let mut headers = Headers::new();
    headers.push("CSeq", "1 OPTIONS");
    headers.push("Call-ID", "x@127.0.0.1");
    let req = Request::new(
        RequestLine::new(
            Method::Options,
            SipUri::parse(&format!("sip:uas@{}:{}", addr.ip(), addr.port())).unwrap(),
        ),
        headers,
        Bytes::new(),
    );
    assert!(matches!(
        server.request(req).await,
        Err(TransactionError::Stopped)
    ));
}
