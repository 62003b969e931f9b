//! Integration tests for the chat engine against a minimal in-process
//! WebSocket server (no mocks).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use doc_chat_client::{
    Backoff, ChatEngine, ClientEvent, ConnectionError, ConnectionSection, Handlers, PendingRequest,
    SendError, SequentialRequestIds, SocketState, UserMessage,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
    done: Arc<Mutex<Vec<PendingRequest>>>,
}

impl Recorder {
    fn handlers(&self) -> Handlers {
        let (a, b, c, d) = (self.log.clone(), self.log.clone(), self.log.clone(), self.log.clone());
        let done = self.done.clone();
        Handlers::new()
            .on_conversation_assigned(move |x| {
                a.lock().unwrap().push(format!("chat_id {}", x.conversation_id))
            })
            .on_delta(move |id, delta| b.lock().unwrap().push(format!("delta {id} {delta}")))
            .on_citations(move |id, cs| {
                c.lock().unwrap().push(format!("citations {id} {}", cs.len()))
            })
            .on_done(move |request| done.lock().unwrap().push(request.clone()))
            .on_error(move |e| {
                d.lock().unwrap().push(format!(
                    "error {} {} {}",
                    e.request_id.as_deref().unwrap_or("-"),
                    e.code.as_deref().unwrap_or("-"),
                    e.detail
                ))
            })
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn done(&self) -> Vec<PendingRequest> {
        self.done.lock().unwrap().clone()
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://127.0.0.1:{}/ws/chat", listener.local_addr().unwrap().port());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (tcp, _) = listener.accept().await.unwrap();
    accept_async(tcp).await.unwrap()
}

/// Wait for the next `user_message` and return its request id.
async fn read_request_id(ws: &mut ServerWs) -> String {
    loop {
        if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "user_message");
            return value["request_id"].as_str().unwrap().to_string();
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn engine(url: &str, recorder: &Recorder) -> ChatEngine {
    ChatEngine::init(url, recorder.handlers(), ConnectionSection::default())
        .expect("test endpoint should parse")
        .with_id_source(SequentialRequestIds::with_epoch("t"))
}

fn question(engine: &mut ChatEngine, content: &str) -> (String, ClientEvent) {
    let id = engine.next_request_id();
    (id.clone(), ClientEvent::UserMessage(UserMessage::new(id, 0, content)))
}

async fn drive_until_idle(engine: &mut ChatEngine) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.pending_count() > 0 {
            assert!(engine.process_next().await);
        }
    })
    .await
    .expect("pending requests should finish");
}

#[tokio::test]
async fn streams_answer_for_new_conversation() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let id = read_request_id(&mut ws).await;
        send_json(&mut ws, json!({"type":"chat_id","request_id":id,"conversation_id":42})).await;
        send_json(
            &mut ws,
            json!({"type":"assistant_start","request_id":id,"assistant_message_id":"a-1"}),
        )
        .await;
        send_json(&mut ws, json!({"type":"assistant_delta","request_id":id,"delta":"Hel"})).await;
        send_json(&mut ws, json!({"type":"assistant_delta","request_id":id,"delta":"lo"})).await;
        send_json(
            &mut ws,
            json!({"type":"assistant_citations","request_id":id,"citations":[
                {"doc_id":1,"chunk_id":3,"page_start":2,"page_end":2,"section_path":"Intro","score":0.8}
            ]}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type":"assistant_done","request_id":id,"message_id":77,"timing_ms":120}),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let recorder = Recorder::default();
    let mut engine = engine(&url, &recorder);
    engine.open().await.expect("open should succeed");
    assert!(engine.is_ready());

    let (id, event) = question(&mut engine, "hi");
    engine.send(event).expect("send should succeed");
    assert!(engine.is_pending(&id));
    drive_until_idle(&mut engine).await;

    assert_eq!(
        recorder.log(),
        vec![
            "chat_id 42".to_string(),
            format!("delta {id} Hel"),
            format!("delta {id} lo"),
            format!("citations {id} 1"),
        ]
    );
    let done = recorder.done();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].content, "Hello");
    assert_eq!(done[0].conversation_id, 42);
    assert_eq!(done[0].message_id, Some(77));
    assert_eq!(done[0].citations[0].section_path.as_deref(), Some("Intro"));
    assert!(!engine.is_pending(&id));
}

#[tokio::test]
async fn interleaved_requests_share_one_socket() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let a = read_request_id(&mut ws).await;
        let b = read_request_id(&mut ws).await;
        for (id, delta) in [(&a, "1"), (&b, "x"), (&a, "2"), (&b, "y"), (&a, "3")] {
            send_json(
                &mut ws,
                json!({"type":"assistant_delta","request_id":id,"delta":delta}),
            )
            .await;
        }
        send_json(&mut ws, json!({"type":"assistant_done","request_id":b})).await;
        send_json(&mut ws, json!({"type":"assistant_done","request_id":a})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let recorder = Recorder::default();
    let mut engine = engine(&url, &recorder);
    engine.open().await.unwrap();
    let (a, first) = question(&mut engine, "first");
    let (b, second) = question(&mut engine, "second");
    engine.send(first).unwrap();
    engine.send(second).unwrap();
    assert_eq!(engine.pending_count(), 2);
    drive_until_idle(&mut engine).await;

    let done = recorder.done();
    assert_eq!(done[0].request_id, b);
    assert_eq!(done[0].content, "xy");
    assert_eq!(done[1].request_id, a);
    assert_eq!(done[1].content, "123");
}

#[tokio::test]
async fn server_error_fails_request_and_late_done_is_ignored() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let id = read_request_id(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type":"error","request_id":id,"detail":"boom","code":"chat_failed"}),
        )
        .await;
        send_json(&mut ws, json!({"type":"assistant_done","request_id":id})).await;
        send_json(&mut ws, json!({"type":"error","detail":"Unknown message type"})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let recorder = Recorder::default();
    let mut engine = engine(&url, &recorder);
    engine.open().await.unwrap();
    let (id, event) = question(&mut engine, "hi");
    engine.send(event).unwrap();
    drive_until_idle(&mut engine).await;
    // Late done, then the connection-scoped error.
    engine.process_next().await;
    engine.process_next().await;

    assert_eq!(
        recorder.log(),
        vec![
            format!("error {id} chat_failed boom"),
            "error - - Unknown message type".to_string(),
        ]
    );
    assert!(recorder.done().is_empty());
}

#[tokio::test]
async fn non_streaming_server_answer_arrives_on_done() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let id = read_request_id(&mut ws).await;
        send_json(&mut ws, json!({"type":"chat_id","request_id":id,"conversation_id":5})).await;
        send_json(
            &mut ws,
            json!({"type":"assistant_done","request_id":id,"conversation_id":5,"message_id":9,
                   "answer":"Whole answer","citations":[{"doc_id":2,"chunk_id":4,"score":0.4}]}),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let recorder = Recorder::default();
    let mut engine = engine(&url, &recorder);
    engine.open().await.unwrap();
    let (_, event) = question(&mut engine, "hi");
    engine.send(event).unwrap();
    drive_until_idle(&mut engine).await;

    let done = recorder.done();
    assert_eq!(done[0].content, "Whole answer");
    assert_eq!(done[0].citations.len(), 1);
}

#[tokio::test]
async fn duplicate_request_id_is_rejected() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let _ws = accept(&listener).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let recorder = Recorder::default();
    let mut engine = engine(&url, &recorder);
    engine.open().await.unwrap();
    let event = ClientEvent::UserMessage(UserMessage::new("same", 0, "hi"));
    engine.send(event.clone()).unwrap();
    assert!(matches!(engine.send(event), Err(SendError::Duplicate(_))));
    assert_eq!(engine.pending_count(), 1);
}

#[tokio::test]
async fn token_is_sent_as_query_parameter() {
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    let (listener, url) = bind().await;
    let seen = Arc::new(Mutex::new(None::<String>));
    let seen_server = seen.clone();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *seen_server.lock().unwrap() = Some(req.uri().to_string());
            Ok(resp)
        };
        let _ws = tokio_tungstenite::accept_hdr_async(tcp, record).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let recorder = Recorder::default();
    let endpoint = doc_chat_client::connection::endpoint_url(&url, Some("s3cret")).unwrap();
    let mut engine =
        ChatEngine::init(endpoint.as_str(), recorder.handlers(), ConnectionSection::default())
            .unwrap();
    engine.open().await.unwrap();
    assert_eq!(seen.lock().unwrap().as_deref(), Some("/ws/chat?token=s3cret"));
}

#[tokio::test]
async fn disconnect_silences_late_frames_and_publishes_state() {
    let (listener, url) = bind().await;
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let id = read_request_id(&mut ws).await;
        let _ = closed_rx.await;
        // The client is gone; these may or may not make it onto the wire.
        let late = json!({"type":"assistant_delta","request_id":id,"delta":"late"});
        let _ = ws.send(Message::Text(late.to_string())).await;
        let done = json!({"type":"assistant_done","request_id":id});
        let _ = ws.send(Message::Text(done.to_string())).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
    });

    let recorder = Recorder::default();
    let mut engine = engine(&url, &recorder);
    let mut ready = engine.ready();
    assert_eq!(*ready.borrow_and_update(), SocketState::Disconnected);

    engine.connect();
    assert_eq!(*ready.borrow_and_update(), SocketState::Connecting);
    engine.open().await.unwrap();
    assert!(ready.has_changed().unwrap());
    assert_eq!(*ready.borrow_and_update(), SocketState::Open);

    let (id, event) = question(&mut engine, "hi");
    engine.send(event).unwrap();
    engine.disconnect();
    assert_eq!(*ready.borrow_and_update(), SocketState::Disconnected);
    assert_eq!(engine.pending_count(), 0);
    closed_tx.send(()).unwrap();

    let idle = tokio::time::timeout(Duration::from_millis(400), engine.process_next()).await;
    assert!(idle.is_err(), "no event may surface after disconnect");
    assert_eq!(
        recorder.log(),
        vec![format!("error {id} connection_lost connection lost")]
    );
    assert!(recorder.done().is_empty());
    assert!(!engine.is_ready());
    assert!(!ready.has_changed().unwrap());
}

#[tokio::test]
async fn dropped_connection_fails_pending_then_reconnects() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _ = read_request_id(&mut ws).await;
        ws.close(None).await.unwrap();
        drop(ws);
        let mut ws = accept(&listener).await;
        let id = read_request_id(&mut ws).await;
        send_json(&mut ws, json!({"type":"assistant_delta","request_id":id,"delta":"again"})).await;
        send_json(&mut ws, json!({"type":"assistant_done","request_id":id})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let recorder = Recorder::default();
    let mut engine = engine(&url, &recorder).with_backoff(Backoff {
        base: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_retries: 3,
    });
    engine.open().await.unwrap();
    let (lost, event) = question(&mut engine, "first");
    engine.send(event).unwrap();
    drive_until_idle(&mut engine).await;

    assert!(!engine.is_ready());
    assert_eq!(
        recorder.log(),
        vec![
            "error - transport WebSocket closed".to_string(),
            format!("error {lost} connection_lost connection lost"),
        ]
    );
    let (_, retry) = question(&mut engine, "second");
    assert!(matches!(
        engine.send(retry),
        Err(SendError::Connection(ConnectionError::NotConnected))
    ));
    assert_eq!(engine.pending_count(), 0);

    engine.reconnect().await.expect("reconnect should succeed");
    let (_, event) = question(&mut engine, "second");
    engine.send(event).unwrap();
    drive_until_idle(&mut engine).await;
    assert_eq!(recorder.done()[0].content, "again");
}

#[tokio::test]
async fn reconnect_gives_up_after_max_retries() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let recorder = Recorder::default();
    let url = format!("ws://127.0.0.1:{port}/ws/chat");
    let mut engine = engine(&url, &recorder).with_backoff(Backoff {
        base: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        max_retries: 2,
    });
    let result = engine.reconnect().await;
    assert!(matches!(result, Err(ConnectionError::ConnectFailed(_))));
    assert!(recorder.log().is_empty());
}
