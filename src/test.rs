//! In-process stub CA for the test suite.
//!
//! Implements just enough of the protocol to drive one order end to end:
//! directory, nonces, account registration, order creation, one
//! authorization with dns-01 and http-01 challenges, finalize, and
//! certificate download. Behavior knobs live in [`TestOptions`].

use std::{
    convert::Infallible,
    net::TcpListener,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use actix_http::{body::MessageBody, HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use base64::prelude::*;
use futures_util::StreamExt as _;
use parking_lot::Mutex;
use serde_json::{json, Value};

/// How the stub decides authorizations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum AuthOutcome {
    /// Valid once the client responds to a challenge.
    #[default]
    Valid,
    /// Invalid once the client responds to a challenge.
    Invalid,
    /// Never leaves pending.
    AlwaysPending,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TestOptions {
    /// Reject this many signed requests with `badNonce` before accepting.
    pub(crate) bad_nonces: u32,

    pub(crate) auth_outcome: AuthOutcome,
}

#[derive(Debug, Default)]
struct OrderState {
    identifiers: Vec<Value>,
    challenge_responded: bool,
    finalized: bool,
}

struct State {
    options: TestOptions,
    cert_pem: String,
    nonce_seq: AtomicU64,
    directory_fetches: AtomicUsize,
    bad_nonces_served: AtomicUsize,
    orders_created: AtomicUsize,
    order: Mutex<OrderState>,
}

impl State {
    fn next_nonce(&self) -> String {
        format!("test-nonce-{}", self.nonce_seq.fetch_add(1, Ordering::SeqCst))
    }
}

pub(crate) struct TestServer {
    pub(crate) dir_url: String,
    state: Arc<State>,
    handle: ServerHandle,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

impl TestServer {
    pub(crate) fn spawn() -> TestServer {
        TestServer::spawn_with(TestOptions::default())
    }

    pub(crate) fn spawn_with(options: TestOptions) -> TestServer {
        let lst = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = lst.local_addr().unwrap().port();

        let url = format!("http://127.0.0.1:{port}");
        let dir_url = format!("{url}/directory");

        let signed = rcgen::generate_simple_self_signed(vec![
            "acme-test.example.com".to_owned(),
        ])
        .unwrap();

        let state = Arc::new(State {
            options,
            cert_pem: signed.cert.pem(),
            nonce_seq: AtomicU64::new(0),
            directory_fetches: AtomicUsize::new(0),
            bad_nonces_served: AtomicUsize::new(0),
            orders_created: AtomicUsize::new(0),
            order: Mutex::new(OrderState::default()),
        });

        let served = Arc::clone(&state);

        let server = Server::build()
            .listen("stub-ca", lst, move || {
                let state = Arc::clone(&served);
                let url = url.clone();

                HttpService::build()
                    .finish(move |mut req: Request| {
                        let state = Arc::clone(&state);
                        let url = url.clone();

                        async move {
                            let body = read_body(&mut req).await;
                            Ok::<_, Infallible>(route_request(&req, &body, &url, &state))
                        }
                    })
                    .tcp()
            })
            .unwrap()
            .workers(1)
            .run();

        let handle = server.handle();
        tokio::spawn(server);

        TestServer {
            dir_url,
            state,
            handle,
        }
    }

    pub(crate) fn directory_fetches(&self) -> usize {
        self.state.directory_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn bad_nonces_served(&self) -> usize {
        self.state.bad_nonces_served.load(Ordering::SeqCst)
    }

    pub(crate) fn orders_created(&self) -> usize {
        self.state.orders_created.load(Ordering::SeqCst)
    }
}

async fn read_body(req: &mut Request) -> Vec<u8> {
    let mut payload = req.take_payload();
    let mut body = Vec::new();

    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(bytes) => body.extend_from_slice(&bytes),
            Err(_) => break,
        }
    }

    body
}

/// Decodes the payload of a flattened JWS envelope. Signatures are not
/// checked.
fn jws_payload(body: &[u8]) -> Value {
    let envelope: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return Value::Null,
    };

    let payload_b64 = envelope["payload"].as_str().unwrap_or_default();
    if payload_b64.is_empty() {
        return Value::Null;
    }

    BASE64_URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .unwrap_or(Value::Null)
}

fn json_response(status: StatusCode, body: Value, state: &State) -> Response<impl MessageBody> {
    Response::build(status)
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("Replay-Nonce", state.next_nonce()))
        .body(body.to_string())
}

fn bad_nonce_response(state: &State) -> Response<impl MessageBody> {
    state.bad_nonces_served.fetch_add(1, Ordering::SeqCst);

    json_response(
        StatusCode::BAD_REQUEST,
        json!({
            "type": "urn:ietf:params:acme:error:badNonce",
            "detail": "stale nonce",
        }),
        state,
    )
}

fn get_directory(url: &str, state: &State) -> Response<impl MessageBody> {
    state.directory_fetches.fetch_add(1, Ordering::SeqCst);

    json_response(
        StatusCode::OK,
        json!({
            "newNonce": format!("{url}/acme/new-nonce"),
            "newAccount": format!("{url}/acme/new-acct"),
            "newOrder": format!("{url}/acme/new-order"),
            "revokeCert": format!("{url}/acme/revoke-cert"),
            "keyChange": format!("{url}/acme/key-change"),
            "meta": {
                "termsOfService": format!("{url}/terms"),
                "caaIdentities": ["testdir.org"],
            },
        }),
        state,
    )
}

fn head_new_nonce(state: &State) -> Response<impl MessageBody> {
    Response::build(StatusCode::NO_CONTENT)
        .insert_header(("Replay-Nonce", state.next_nonce()))
        .finish()
}

fn account_body() -> Value {
    json!({
        "status": "valid",
        "contact": ["mailto:foo@bar.com"],
        "orders": "",
    })
}

fn post_new_acct(url: &str, state: &State) -> Response<impl MessageBody> {
    Response::build(StatusCode::CREATED)
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("Location", format!("{url}/acme/acct/7728515")))
        .insert_header(("Replay-Nonce", state.next_nonce()))
        .body(account_body().to_string())
}

fn post_account(state: &State) -> Response<impl MessageBody> {
    json_response(StatusCode::OK, account_body(), state)
}

fn post_new_order(url: &str, body: &[u8], state: &State) -> Response<impl MessageBody> {
    state.orders_created.fetch_add(1, Ordering::SeqCst);

    let payload = jws_payload(body);
    let identifiers = payload["identifiers"].as_array().cloned().unwrap_or_default();

    *state.order.lock() = OrderState {
        identifiers: identifiers.clone(),
        ..Default::default()
    };

    Response::build(StatusCode::CREATED)
        .insert_header(("Content-Type", "application/json"))
        .insert_header(("Location", format!("{url}/acme/order/1")))
        .insert_header(("Replay-Nonce", state.next_nonce()))
        .body(
            json!({
                "status": "pending",
                "expires": "2039-01-09T08:26:43Z",
                "identifiers": identifiers,
                "authorizations": [format!("{url}/acme/authz/1")],
                "finalize": format!("{url}/acme/finalize/1"),
            })
            .to_string(),
        )
}

fn post_get_order(url: &str, state: &State) -> Response<impl MessageBody> {
    let order = state.order.lock();

    let status = if order.finalized {
        "valid"
    } else if order.challenge_responded && state.options.auth_outcome == AuthOutcome::Valid {
        "ready"
    } else {
        "pending"
    };

    let mut body = json!({
        "status": status,
        "expires": "2039-01-09T08:26:43Z",
        "identifiers": order.identifiers,
        "authorizations": [format!("{url}/acme/authz/1")],
        "finalize": format!("{url}/acme/finalize/1"),
    });

    if status == "valid" {
        body["certificate"] = json!(format!("{url}/acme/cert/1"));
    }

    drop(order);
    json_response(StatusCode::OK, body, state)
}

fn post_authz(url: &str, state: &State) -> Response<impl MessageBody> {
    let order = state.order.lock();

    // wildcard identifiers authorize the base name with the wildcard flag
    let requested = order.identifiers[0]["value"].as_str().unwrap_or_default();
    let (value, wildcard) = match requested.strip_prefix("*.") {
        Some(base) => (base, true),
        None => (requested, false),
    };

    let status = match state.options.auth_outcome {
        AuthOutcome::Valid if order.challenge_responded => "valid",
        AuthOutcome::Invalid if order.challenge_responded => "invalid",
        _ => "pending",
    };

    let challenge_error = if status == "invalid" {
        json!({
            "type": "urn:ietf:params:acme:error:dns",
            "detail": "no TXT record found",
        })
    } else {
        Value::Null
    };

    let mut body = json!({
        "identifier": { "type": "dns", "value": value },
        "status": status,
        "expires": "2039-01-09T08:26:43Z",
        "challenges": [
            {
                "type": "dns-01",
                "url": format!("{url}/acme/challenge/1"),
                "status": if status == "pending" { "pending" } else { status },
                "token": "token-dns-1",
            },
            {
                "type": "http-01",
                "url": format!("{url}/acme/challenge/2"),
                "status": if status == "pending" { "pending" } else { status },
                "token": "token-http-1",
            },
        ],
    });

    if wildcard {
        body["wildcard"] = json!(true);
    }
    if !challenge_error.is_null() {
        body["challenges"][0]["error"] = challenge_error;
    }

    drop(order);
    json_response(StatusCode::OK, body, state)
}

fn post_challenge(url: &str, state: &State) -> Response<impl MessageBody> {
    state.order.lock().challenge_responded = true;

    json_response(
        StatusCode::OK,
        json!({
            "type": "dns-01",
            "url": format!("{url}/acme/challenge/1"),
            "status": "processing",
            "token": "token-dns-1",
        }),
        state,
    )
}

fn post_finalize(url: &str, state: &State) -> Response<impl MessageBody> {
    state.order.lock().finalized = true;
    post_get_order(url, state)
}

fn post_certificate(state: &State) -> Response<impl MessageBody> {
    Response::build(StatusCode::OK)
        .insert_header(("Content-Type", "application/pem-certificate-chain"))
        .insert_header(("Replay-Nonce", state.next_nonce()))
        .body(state.cert_pem.clone())
}

fn route_request(
    req: &Request,
    body: &[u8],
    url: &str,
    state: &State,
) -> Response<impl MessageBody> {
    if req.method() == Method::POST && req.path().starts_with("/acme/") {
        let pending = state.bad_nonces_served.load(Ordering::SeqCst);
        if pending < state.options.bad_nonces as usize {
            return bad_nonce_response(state).map_into_boxed_body();
        }
    }

    match (req.method(), req.path()) {
        (&Method::GET, "/directory") => get_directory(url, state).map_into_boxed_body(),
        (&Method::HEAD, "/acme/new-nonce") => head_new_nonce(state).map_into_boxed_body(),
        (&Method::POST, "/acme/new-acct") => post_new_acct(url, state).map_into_boxed_body(),
        (&Method::POST, "/acme/acct/7728515") => post_account(state).map_into_boxed_body(),

        (&Method::POST, "/acme/new-order") => {
            post_new_order(url, body, state).map_into_boxed_body()
        }

        (&Method::POST, "/acme/order/1") => post_get_order(url, state).map_into_boxed_body(),
        (&Method::POST, "/acme/authz/1") => post_authz(url, state).map_into_boxed_body(),

        (&Method::POST, "/acme/challenge/1") | (&Method::POST, "/acme/challenge/2") => {
            post_challenge(url, state).map_into_boxed_body()
        }

        (&Method::POST, "/acme/finalize/1") => post_finalize(url, state).map_into_boxed_body(),
        (&Method::POST, "/acme/cert/1") => post_certificate(state).map_into_boxed_body(),

        (_, _) => Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body(),
    }
}

#[tokio::test]
async fn stub_directory_is_reachable() {
    let server = TestServer::spawn();
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());
    assert_eq!(server.directory_fetches(), 1);
}

// the stub must speak the same wire dialect the client parses
#[tokio::test]
async fn stub_directory_matches_wire_types() {
    let server = TestServer::spawn();

    let body = reqwest::get(&server.dir_url)
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let dir: crate::api::Directory = serde_json::from_str(&body).unwrap();
    assert!(dir.new_nonce.ends_with("/acme/new-nonce"));
    assert!(dir.revoke_cert.ends_with("/acme/revoke-cert"));
    assert!(dir.terms_of_service().is_some());
}
