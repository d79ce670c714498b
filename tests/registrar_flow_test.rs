//! Registration and routing scenarios through the request router

mod common;

use common::{challenge_param, incoming, invite, proxy, register, DOMAIN};
use sipcore::domain::subscriber::Subscriber;
use sipcore::infrastructure::protocols::sip::auth::{calculate_response, compute_ha1};
use sipcore::infrastructure::protocols::sip::message::HeaderAccess;
use sipcore::infrastructure::protocols::sip::dispatch::DEFAULT_QUEUE_IDLE;
use sipcore::infrastructure::protocols::sip::{Dispatcher, RouteOutcome};
use std::net::SocketAddr;
use std::time::Duration;

fn alice_phone() -> SocketAddr {
    "192.0.2.10:5060".parse().unwrap()
}

fn carol_phone() -> SocketAddr {
    "192.0.2.20:5060".parse().unwrap()
}

#[tokio::test]
async fn test_register_refresh_unregister_then_invite_not_found() {
    let proxy = proxy(None).await;
    let contact = "sip:alice@192.0.2.10:5060";

    let created = proxy
        .router
        .route(incoming(&register("alice", contact, "reg-a", 1, 3600, None), alice_phone()))
        .await;
    assert_eq!(created, RouteOutcome::Replied(200));
    let ok = proxy.transport.last_response().await.unwrap();
    assert!(ok.header_list("Contact")[0].contains("expires="));
    assert_eq!(proxy.location.resolve("sip:alice@example.com").await.unwrap().len(), 1);

    // Same Call-ID, same CSeq, new branch: acknowledged without a state change
    let stored = proxy.location.resolve("sip:alice@example.com").await.unwrap();
    let duplicate = register("alice", contact, "reg-a", 1, 60, None)
        .replace("branch=z9hG4bKreg-a1", "branch=z9hG4bKreg-a1-dup");
    assert_eq!(
        proxy.router.route(incoming(&duplicate, alice_phone())).await,
        RouteOutcome::Replied(200)
    );
    let after = proxy.location.resolve("sip:alice@example.com").await.unwrap();
    assert_eq!(after[0].expires_at, stored[0].expires_at);

    let removed = proxy
        .router
        .route(incoming(&register("alice", contact, "reg-a", 2, 0, None), alice_phone()))
        .await;
    assert_eq!(removed, RouteOutcome::Replied(200));
    assert!(proxy.location.resolve("sip:alice@example.com").await.unwrap().is_empty());

    let call = proxy
        .router
        .route(incoming(&invite("alice", "z9hG4bKinv1"), carol_phone()))
        .await;
    assert_eq!(call, RouteOutcome::Replied(404));
}

#[tokio::test]
async fn test_unregister_removes_only_matching_contact() {
    let proxy = proxy(None).await;
    let desk = "sip:alice@192.0.2.10:5060";
    let mobile = "sip:alice@198.51.100.7:5070";

    proxy
        .router
        .route(incoming(&register("alice", desk, "reg-desk", 1, 3600, None), alice_phone()))
        .await;
    proxy
        .router
        .route(incoming(&register("alice", mobile, "reg-mob", 1, 3600, None), alice_phone()))
        .await;
    proxy
        .router
        .route(incoming(&register("alice", desk, "reg-desk", 2, 0, None), alice_phone()))
        .await;

    let bindings = proxy.location.resolve("sip:alice@example.com").await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].contact, mobile);
}

#[tokio::test]
async fn test_registered_user_receives_invite() {
    let proxy = proxy(None).await;
    proxy
        .router
        .route(incoming(
            &register("alice", "sip:alice@10.1.1.1:5060", "reg-b", 1, 3600, None),
            alice_phone(),
        ))
        .await;

    let outcome = proxy
        .router
        .route(incoming(&invite("alice", "z9hG4bKinv2"), carol_phone()))
        .await;
    assert_eq!(outcome, RouteOutcome::Forwarded);

    let (forwarded, destination) = proxy.transport.sent_requests().await.pop().unwrap();
    assert_eq!(forwarded.uri_string(), "sip:alice@10.1.1.1:5060");
    // Delivered where the REGISTER came from, not to the private contact
    assert_eq!(destination, alice_phone());
    assert_eq!(forwarded.max_forwards().unwrap(), Some(69));
}

#[tokio::test]
async fn test_digest_challenge_then_success() {
    let proxy = proxy(Some(vec![
        Subscriber::new("alice", DOMAIN).with_password("wonderland"),
    ]))
    .await;
    let contact = "sip:alice@192.0.2.10:5060";

    let first = proxy
        .router
        .route(incoming(&register("alice", contact, "reg-auth", 1, 3600, None), alice_phone()))
        .await;
    assert_eq!(first, RouteOutcome::Replied(401));
    let challenge = proxy
        .transport
        .last_response()
        .await
        .and_then(|r| r.header("WWW-Authenticate"))
        .unwrap();
    let nonce = challenge_param(&challenge, "nonce").unwrap();

    let uri = format!("sip:{}", DOMAIN);
    let ha1 = compute_ha1("alice", DOMAIN, "wonderland");
    let response = calculate_response(&ha1, &nonce, "REGISTER", &uri, None, None, None);
    let authorization = format!(
        r#"Digest username="alice", realm="{DOMAIN}", nonce="{nonce}", uri="{uri}", response="{response}", algorithm=MD5"#
    );

    let second = proxy
        .router
        .route(incoming(
            &register("alice", contact, "reg-auth", 2, 3600, Some(&authorization)),
            alice_phone(),
        ))
        .await;
    assert_eq!(second, RouteOutcome::Replied(200));
    assert_eq!(proxy.location.resolve("sip:alice@example.com").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_wrong_password_is_forbidden() {
    let proxy = proxy(Some(vec![
        Subscriber::new("alice", DOMAIN).with_password("wonderland"),
    ]))
    .await;
    let contact = "sip:alice@192.0.2.10:5060";

    proxy
        .router
        .route(incoming(&register("alice", contact, "reg-bad", 1, 3600, None), alice_phone()))
        .await;
    let challenge = proxy
        .transport
        .last_response()
        .await
        .and_then(|r| r.header("WWW-Authenticate"))
        .unwrap();
    let nonce = challenge_param(&challenge, "nonce").unwrap();

    let uri = format!("sip:{}", DOMAIN);
    let ha1 = compute_ha1("alice", DOMAIN, "guess");
    let response = calculate_response(&ha1, &nonce, "REGISTER", &uri, None, None, None);
    let authorization = format!(
        r#"Digest username="alice", realm="{DOMAIN}", nonce="{nonce}", uri="{uri}", response="{response}""#
    );

    let outcome = proxy
        .router
        .route(incoming(
            &register("alice", contact, "reg-bad", 2, 3600, Some(&authorization)),
            alice_phone(),
        ))
        .await;
    assert_eq!(outcome, RouteOutcome::Replied(403));
    assert!(proxy.location.resolve("sip:alice@example.com").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_registrations_for_different_users() {
    let proxy = proxy(None).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let router = proxy.router.clone();
        handles.push(tokio::spawn(async move {
            let user = format!("user{}", i);
            let contact = format!("sip:{}@192.0.2.{}:5060", user, i + 1);
            let source: SocketAddr = format!("192.0.2.{}:5060", i + 1).parse().unwrap();
            router
                .route(incoming(
                    &register(&user, &contact, &format!("reg-{}", i), 1, 3600, None),
                    source,
                ))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), RouteOutcome::Replied(200));
    }

    for i in 0..20 {
        let aor = format!("sip:user{}@example.com", i);
        assert_eq!(proxy.location.resolve(&aor).await.unwrap().len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_user_applied_in_arrival_order() {
    let contact = "sip:alice@192.0.2.10:5060";

    for round in 0..200 {
        let proxy = proxy(None).await;
        let mut dispatcher = Dispatcher::new(proxy.router.clone(), DEFAULT_QUEUE_IDLE);

        // Different Call-IDs: replay protection cannot order these two
        dispatcher.dispatch(incoming(
            &register("alice", contact, &format!("bind-{}", round), 1, 3600, None),
            alice_phone(),
        ));
        dispatcher.dispatch(incoming(
            &register("alice", contact, &format!("drop-{}", round), 1, 0, None),
            alice_phone(),
        ));

        let answered = tokio::time::timeout(Duration::from_secs(5), async {
            while proxy.transport.sent.lock().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(answered.is_ok(), "round {} not answered", round);

        assert!(
            proxy
                .location
                .resolve("sip:alice@example.com")
                .await
                .unwrap()
                .is_empty(),
            "binding survived its removal in round {}",
            round
        );
        assert_eq!(dispatcher.queue_count(), 1);
    }
}
