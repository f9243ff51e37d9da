// sipwire - async SIP transaction engine
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end transaction layer tests over loopback UDP with shrunk
//! timers. A plain UdpSocket plays the remote peer.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use sipwire_core::{Headers, Method, Request, RequestLine, Response, SipMessage, SipUri};
use sipwire_parse::parse_message;
use sipwire_transaction::{
    generate_branch, TimerDefaults, TransactionError, TransactionLayer,
};
use sipwire_transport::{TransportKind, TransportLayer};

const WAIT: Duration = Duration::from_secs(2);

fn fast_timers() -> TimerDefaults {
    TimerDefaults {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(80),
        t4: Duration::from_millis(40),
    }
}

async fn stack() -> (TransactionLayer, std::net::SocketAddr) {
    let transport = TransportLayer::new("127.0.0.1");
    transport
        .listen(TransportKind::Udp, "127.0.0.1:0")
        .await
        .unwrap();
    let local = transport.pool().any_packet_socket().unwrap().local_addr();
    let layer = TransactionLayer::with_timers(transport, fast_timers());
    (layer, local)
}

async fn peer() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv_msg(socket: &UdpSocket) -> SipMessage {
    let mut buf = vec![0u8; 65_535];
    let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    parse_message(&buf[..n]).expect("peer received unparseable message")
}

fn client_request(method: Method, branch: &str, to: std::net::SocketAddr) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", format!("SIP/2.0/UDP 127.0.0.1;branch={}", branch));
    headers.push("From", "<sip:alice@127.0.0.1>;tag=clienttag");
    headers.push("To", "<sip:bob@127.0.0.1>");
    headers.push("Call-ID", format!("{}@127.0.0.1", branch));
    headers.push("CSeq", format!("1 {}", method.as_str()));
    Request::new(
        RequestLine::new(
            method,
            SipUri::parse(&format!("sip:bob@{}:{}", to.ip(), to.port())).unwrap(),
        ),
        headers,
        Bytes::new(),
    )
}

fn peer_reply(req: &SipMessage, code: u16, reason: &str) -> Vec<u8> {
    let req = req.as_request().unwrap();
    let mut res = Response::from_request(req, code, reason);
    if code >= 200 {
        res.headers_mut()
            .set("To", "<sip:bob@127.0.0.1>;tag=peertag");
    }
    sipwire_parse::serialize_response(&res).to_vec()
}

fn peer_invite(branch: &str, peer_port: u16) -> Vec<u8> {
    format!(
        "INVITE sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{peer_port};rport;branch={branch}\r\n\
From: \"Alice\" <sip:alice@wonderland.com>;tag=1928301774\r\n\
To: \"Bob\" <sip:bob@far-far-away.com>\r\n\
Call-ID: {branch}@127.0.0.1\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n"
    )
    .into_bytes()
}

#[tokio::test]
async fn non_invite_client_gets_response_then_channel_closes() {
    let (layer, _local) = stack().await;
    let remote = peer().await;
    let branch = generate_branch();

    let mut responses = layer
        .request(client_request(
            Method::Options,
            &branch,
            remote.local_addr().unwrap(),
        ))
        .await
        .unwrap();

    let (req, from) = {
        let mut buf = vec![0u8; 65_535];
        let (n, from) = timeout(WAIT, remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (parse_message(&buf[..n]).unwrap(), from)
    };
    assert_eq!(req.as_request().unwrap().method(), &Method::Options);

    remote
        .send_to(&peer_reply(&req, 200, "OK"), from)
        .await
        .unwrap();

    let res = timeout(WAIT, responses.recv()).await.unwrap().unwrap();
    assert_eq!(res.code(), 200);

    // Timer K (T4) terminates the transaction and closes the channel.
    let end = timeout(WAIT, responses.recv()).await.unwrap();
    assert!(end.is_none(), "channel should close after termination");
    assert_eq!(layer.client_count(), 0);

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn invite_client_times_out_without_response() {
    let (layer, _local) = stack().await;
    let remote = peer().await;
    let mut errors = layer.errors().unwrap();
    let branch = generate_branch();

    let mut responses = layer
        .request(client_request(
            Method::Invite,
            &branch,
            remote.local_addr().unwrap(),
        ))
        .await
        .unwrap();

    // 64 * T1 = 1.28s with the shrunk timers.
    let err = timeout(Duration::from_secs(3), errors.recv())
        .await
        .expect("expected a timeout error")
        .unwrap();
    assert!(matches!(err, TransactionError::Timeout { .. }), "{err}");

    let end = timeout(WAIT, responses.recv()).await.unwrap();
    assert!(end.is_none());
    assert_eq!(layer.client_count(), 0);

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn invite_client_retransmits_on_timer_a() {
    let (layer, _local) = stack().await;
    let remote = peer().await;
    let branch = generate_branch();

    let _responses = layer
        .request(client_request(
            Method::Invite,
            &branch,
            remote.local_addr().unwrap(),
        ))
        .await
        .unwrap();

    // First transmission plus at least one Timer A retransmission, and
    // every copy is byte-identical.
    let mut buf_a = vec![0u8; 65_535];
    let (n_a, _) = timeout(WAIT, remote.recv_from(&mut buf_a))
        .await
        .unwrap()
        .unwrap();
    let mut buf_b = vec![0u8; 65_535];
    let (n_b, _) = timeout(WAIT, remote.recv_from(&mut buf_b))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf_a[..n_a], &buf_b[..n_b]);

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn invite_client_acks_each_final_failure() {
    let (layer, _local) = stack().await;
    let remote = peer().await;
    let branch = generate_branch();

    let mut responses = layer
        .request(client_request(
            Method::Invite,
            &branch,
            remote.local_addr().unwrap(),
        ))
        .await
        .unwrap();

    let (req, from) = {
        let mut buf = vec![0u8; 65_535];
        let (n, from) = timeout(WAIT, remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (parse_message(&buf[..n]).unwrap(), from)
    };
    let reply = peer_reply(&req, 400, "Bad Request");
    remote.send_to(&reply, from).await.unwrap();

    let res = timeout(WAIT, responses.recv()).await.unwrap().unwrap();
    assert_eq!(res.code(), 400);

    // The transaction generates the ACK itself.
    let ack = recv_msg(&remote).await;
    let ack_req = ack.as_request().unwrap();
    assert_eq!(ack_req.method(), &Method::Ack);
    assert_eq!(ack_req.cseq().unwrap().method, Method::Ack);
    assert_eq!(ack_req.cseq().unwrap().seq, 1);
    assert_eq!(
        ack_req.top_via().unwrap().branch(),
        Some(branch.as_str()),
        "ACK must reuse the INVITE branch"
    );

    // A retransmitted final provokes another, identical ACK.
    remote.send_to(&reply, from).await.unwrap();
    let ack2 = recv_msg(&remote).await;
    assert_eq!(ack, ack2);

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn server_transaction_absorbs_retransmissions() {
    let (layer, local) = stack().await;
    let remote = peer().await;
    let mut requests = layer.requests().unwrap();
    let branch = generate_branch();
    let peer_port = remote.local_addr().unwrap().port();

    let wire_invite = peer_invite(&branch, peer_port);
    remote.send_to(&wire_invite, local).await.unwrap();

    let req = timeout(WAIT, requests.recv()).await.unwrap().unwrap();
    assert_eq!(req.method(), &Method::Invite);

    // The automatic 100 Trying arrives while the TU stays silent.
    let trying = recv_msg(&remote).await;
    assert_eq!(trying.as_response().unwrap().code(), 100);

    // A retransmitted INVITE does not create a second transaction; it
    // provokes a re-send of the last provisional instead.
    remote.send_to(&wire_invite, local).await.unwrap();
    assert!(
        timeout(Duration::from_millis(200), requests.recv())
            .await
            .is_err(),
        "retransmission must not surface a second request"
    );
    assert_eq!(layer.server_count(), 1);
    let trying_again = recv_msg(&remote).await;
    assert_eq!(trying_again.as_response().unwrap().code(), 100);

    // TU rejects the call; the peer sees the 486.
    let mut res = Response::from_request(&req, 486, "Busy Here");
    res.headers_mut()
        .set("To", "<sip:bob@far-far-away.com>;tag=uas1");
    let mut peer_msgs = layer.respond(res).await.unwrap();

    let busy = recv_msg(&remote).await;
    assert_eq!(busy.as_response().unwrap().code(), 486);

    // Another INVITE retransmission triggers a byte-identical re-send of
    // the final response.
    remote.send_to(&wire_invite, local).await.unwrap();
    let busy_again = recv_msg(&remote).await;
    assert_eq!(busy, busy_again);

    // The ACK reaches the TU through the respond() channel.
    let wire_ack = format!(
        "ACK sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{peer_port};rport;branch={branch}\r\n\
From: \"Alice\" <sip:alice@wonderland.com>;tag=1928301774\r\n\
To: \"Bob\" <sip:bob@far-far-away.com>;tag=uas1\r\n\
Call-ID: {branch}@127.0.0.1\r\n\
CSeq: 1 ACK\r\n\
Content-Length: 0\r\n\r\n"
    );
    remote.send_to(wire_ack.as_bytes(), local).await.unwrap();
    let ack = timeout(WAIT, peer_msgs.recv()).await.unwrap().unwrap();
    assert_eq!(ack.method(), &Method::Ack);

    // Timer I dismantles the transaction shortly after.
    timeout(WAIT, async {
        while layer.server_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server transaction should terminate after Timer I");

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn unmatched_response_is_forwarded_as_stray_exactly_once() {
    let (layer, local) = stack().await;
    let remote = peer().await;
    let mut strays = layer.responses().unwrap();

    let wire = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKnobody\r\n\
From: <sip:alice@127.0.0.1>;tag=x\r\n\
Call-ID: stray@127.0.0.1\r\n\
CSeq: 9 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";
    remote.send_to(wire.as_bytes(), local).await.unwrap();

    let stray = timeout(WAIT, strays.recv()).await.unwrap().unwrap();
    assert_eq!(stray.code(), 200);
    assert!(
        timeout(Duration::from_millis(200), strays.recv())
            .await
            .is_err(),
        "stray must be forwarded exactly once"
    );

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn cancel_for_unknown_transaction_draws_481() {
    let (layer, local) = stack().await;
    let remote = peer().await;
    let peer_port = remote.local_addr().unwrap().port();

    let wire = format!(
        "CANCEL sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:{peer_port};branch=z9hG4bKunknowncancel\r\n\
From: <sip:alice@127.0.0.1>;tag=a\r\n\
To: <sip:bob@127.0.0.1>\r\n\
Call-ID: ghost@127.0.0.1\r\n\
CSeq: 1 CANCEL\r\n\
Content-Length: 0\r\n\r\n"
    );
    remote.send_to(wire.as_bytes(), local).await.unwrap();

    let res = recv_msg(&remote).await;
    assert_eq!(res.as_response().unwrap().code(), 481);

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn duplicate_client_key_is_rejected_synchronously() {
    let (layer, _local) = stack().await;
    let remote = peer().await;
    let branch = generate_branch();
    let to = remote.local_addr().unwrap();

    let _rx = layer
        .request(client_request(Method::Options, &branch, to))
        .await
        .unwrap();
    let second = layer
        .request(client_request(Method::Options, &branch, to))
        .await;
    assert!(matches!(
        second,
        Err(TransactionError::DuplicateTransaction(_))
    ));

    layer.cancel();
    layer.done().await;
}

#[tokio::test]
async fn shutdown_terminates_every_transaction() {
    let (layer, local) = stack().await;
    let remote = peer().await;
    let mut errors = layer.errors().unwrap();
    let mut requests = layer.requests().unwrap();
    let branch = generate_branch();

    // One client transaction in flight...
    let mut responses = layer
        .request(client_request(
            Method::Options,
            &branch,
            remote.local_addr().unwrap(),
        ))
        .await
        .unwrap();

    // ...and one server transaction.
    let server_branch = generate_branch();
    remote
        .send_to(
            &peer_invite(&server_branch, remote.local_addr().unwrap().port()),
            local,
        )
        .await
        .unwrap();
    let _ = timeout(WAIT, requests.recv()).await.unwrap().unwrap();

    layer.cancel();
    layer.done().await;

    assert_eq!(layer.client_count(), 0);
    assert_eq!(layer.server_count(), 0);

    let end = timeout(WAIT, responses.recv()).await.unwrap();
    assert!(end.is_none(), "response channel must close on shutdown");

    let mut cancelled = 0;
    while let Ok(Some(err)) = timeout(Duration::from_millis(200), errors.recv()).await {
        if matches!(err, TransactionError::Cancelled { .. }) {
            cancelled += 1;
        }
    }
    assert!(cancelled >= 2, "expected both transactions to report Cancelled");

    // New work is refused after shutdown.
    let refused = layer
        .request(client_request(
            Method::Options,
            &generate_branch(),
            remote.local_addr().unwrap(),
        ))
        .await;
    assert!(matches!(refused, Err(TransactionError::Stopped)));
}
