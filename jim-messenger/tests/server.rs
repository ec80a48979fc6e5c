use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use jim_messenger::{
    config::ServerSettings,
    message::{Frame, FrameStream, Request, Response},
    server::{Server, ServerEvent},
    store::{MemoryUserStore, UserStore},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

struct TestServer {
    addr: SocketAddr,
    events: broadcast::Receiver<ServerEvent>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(store: Arc<dyn UserStore>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, store).with_settings(ServerSettings {
            accept_timeout: Duration::from_millis(50),
            backlog_interval: Duration::from_millis(1),
        });
        let addr = server.local_addr()?;
        let events = server.subscribe();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            events,
            shutdown,
            handle,
        })
    }

    async fn open() -> Result<Self> {
        Self::start(Arc::new(MemoryUserStore::default())).await
    }

    async fn connect(&self) -> Result<FrameStream<TcpStream>> {
        Ok(FrameStream::new(TcpStream::connect(self.addr).await?))
    }

    async fn join(&self, name: &str) -> Result<FrameStream<TcpStream>> {
        let mut peer = self.connect().await?;
        peer.write_frame(&Request::presence(name).into()).await?;
        assert_eq!(recv(&mut peer).await?, Frame::Response(Response::Ok));
        Ok(peer)
    }

    async fn next_event(&mut self) -> Result<ServerEvent> {
        Ok(timeout(READ_TIMEOUT, self.events.recv()).await??)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

async fn recv(peer: &mut FrameStream<TcpStream>) -> Result<Frame> {
    timeout(READ_TIMEOUT, peer.read_frame())
        .await
        .map_err(|_| anyhow!("timed out waiting for a frame"))?
        .map_err(Into::into)
}

async fn send(peer: &mut FrameStream<TcpStream>, request: Request) -> Result<()> {
    peer.write_frame(&request.into()).await?;
    Ok(())
}

async fn assert_quiet(peer: &mut FrameStream<TcpStream>) {
    assert!(
        timeout(QUIET_PERIOD, peer.read_frame()).await.is_err(),
        "expected no frame"
    );
}

async fn assert_closed(peer: &mut FrameStream<TcpStream>) {
    let read = timeout(READ_TIMEOUT, peer.read_frame())
        .await
        .expect("server should close the connection");
    assert!(read.is_err(), "expected a closed connection, got {read:?}");
}

#[tokio::test]
async fn distinct_identities_both_join() -> Result<()> {
    let server = TestServer::open().await?;
    let _alice = server.join("alice").await?;
    let _bob = server.join("bob").await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_are_routed_to_the_destination() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;

    send(&mut alice, Request::message("alice", "bob", "hello bob")).await?;

    match recv(&mut bob).await? {
        Frame::Request(Request::Message {
            sender,
            destination,
            text,
            ..
        }) => {
            assert_eq!(sender, "alice");
            assert_eq!(destination, "bob");
            assert_eq!(text, "hello bob");
        }
        other => panic!("expected a routed message, got {other:?}"),
    }
    assert_quiet(&mut alice).await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_identity_is_rejected_without_disturbing_the_original() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;
    let mut carol = server.join("carol").await?;

    let mut impostor = server.connect().await?;
    send(&mut impostor, Request::presence("alice")).await?;
    assert_eq!(
        recv(&mut impostor).await?,
        Frame::Response(Response::error("name in use"))
    );
    assert_closed(&mut impostor).await;

    send(&mut carol, Request::message("carol", "alice", "still there?")).await?;
    assert!(matches!(
        recv(&mut alice).await?,
        Frame::Request(Request::Message { text, .. }) if text == "still there?"
    ));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn repeated_presence_on_a_bound_connection_keeps_the_session() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;

    send(&mut alice, Request::presence("alice")).await?;
    assert_eq!(
        recv(&mut alice).await?,
        Frame::Response(Response::error("bad request"))
    );

    send(&mut alice, Request::get_users("alice")).await?;
    assert_eq!(
        recv(&mut alice).await?,
        Frame::Response(Response::Accepted(vec!["alice".into(), "bob".into()]))
    );

    send(&mut bob, Request::message("bob", "alice", "still bound?")).await?;
    assert!(matches!(
        recv(&mut alice).await?,
        Frame::Request(Request::Message { text, .. }) if text == "still bound?"
    ));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn rejected_peer_takes_the_name_after_the_owner_exits() -> Result<()> {
    let server = TestServer::open().await?;
    let mut first = server.join("alice").await?;

    let mut second = server.connect().await?;
    send(&mut second, Request::presence("alice")).await?;
    assert_eq!(
        recv(&mut second).await?,
        Frame::Response(Response::error("name in use"))
    );
    assert_closed(&mut second).await;

    send(&mut first, Request::exit("alice")).await?;
    assert_closed(&mut first).await;

    let _second = server.join("alice").await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn message_to_an_absent_user_is_dropped_silently() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;

    send(&mut alice, Request::message("alice", "nobody", "hello?")).await?;
    assert_quiet(&mut alice).await;

    send(&mut alice, Request::get_users("alice")).await?;
    assert_eq!(
        recv(&mut alice).await?,
        Frame::Response(Response::Accepted(vec!["alice".into()]))
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn exit_frees_the_identity() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;

    send(&mut alice, Request::exit("alice")).await?;
    assert_closed(&mut alice).await;

    let _again = server.join("alice").await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_frees_the_identity() -> Result<()> {
    let server = TestServer::open().await?;
    let alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    drop(alice);

    // Once the server notices, messages for alice are dropped and the name is free.
    let mut again = None;
    for _ in 0..20 {
        let mut peer = server.connect().await?;
        send(&mut peer, Request::presence("alice")).await?;
        if recv(&mut peer).await? == Frame::Response(Response::Ok) {
            again = Some(peer);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let mut alice = again.ok_or_else(|| anyhow!("alice never became free"))?;

    send(&mut bob, Request::message("bob", "alice", "welcome back")).await?;
    assert!(matches!(
        recv(&mut alice).await?,
        Frame::Request(Request::Message { text, .. }) if text == "welcome back"
    ));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn contacts_round_trip() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;
    let _bob = server.join("bob").await?;

    send(&mut alice, Request::add_contact("alice", "bob")).await?;
    assert_eq!(recv(&mut alice).await?, Frame::Response(Response::Ok));

    send(&mut alice, Request::get_contacts("alice")).await?;
    assert_eq!(
        recv(&mut alice).await?,
        Frame::Response(Response::Accepted(vec!["bob".into()]))
    );

    send(&mut alice, Request::remove_contact("alice", "bob")).await?;
    assert_eq!(recv(&mut alice).await?, Frame::Response(Response::Ok));

    send(&mut alice, Request::get_contacts("alice")).await?;
    assert_eq!(
        recv(&mut alice).await?,
        Frame::Response(Response::Accepted(vec![]))
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn requests_for_another_identity_are_bad_requests() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;
    let _bob = server.join("bob").await?;

    send(&mut alice, Request::get_contacts("bob")).await?;
    assert_eq!(
        recv(&mut alice).await?,
        Frame::Response(Response::error("bad request"))
    );

    let mut anonymous = server.connect().await?;
    send(&mut anonymous, Request::get_users("bob")).await?;
    assert_eq!(
        recv(&mut anonymous).await?,
        Frame::Response(Response::error("bad request"))
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_action_gets_a_bad_request_and_the_connection_survives() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;

    let body = br#"{"action":"dance","time":1.0}"#;
    let stream = alice.get_mut();
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    assert_eq!(
        recv(&mut alice).await?,
        Frame::Response(Response::error("bad request"))
    );

    send(&mut alice, Request::get_users("alice")).await?;
    assert!(matches!(
        recv(&mut alice).await?,
        Frame::Response(Response::Accepted(_))
    ));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn undecodable_frames_only_drop_their_own_connection() -> Result<()> {
    let server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;

    let mut garbage = TcpStream::connect(server.addr).await?;
    garbage.write_all(&[0, 0, 0, 4, b'n', b'o', b'p', b'e']).await?;
    let mut buf = [0u8; 16];
    let read = timeout(READ_TIMEOUT, garbage.read(&mut buf)).await?;
    assert!(matches!(read, Ok(0) | Err(_)));

    let mut oversized = TcpStream::connect(server.addr).await?;
    oversized.write_all(&u32::MAX.to_be_bytes()).await?;
    let read = timeout(READ_TIMEOUT, oversized.read(&mut buf)).await?;
    assert!(matches!(read, Ok(0) | Err(_)));

    send(&mut alice, Request::get_users("alice")).await?;
    assert!(matches!(
        recv(&mut alice).await?,
        Frame::Response(Response::Accepted(_))
    ));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn closed_registry_rejects_unknown_users() -> Result<()> {
    let server = TestServer::start(Arc::new(MemoryUserStore::with_users(["alice"]))).await?;
    let _alice = server.join("alice").await?;

    let mut mallory = server.connect().await?;
    send(&mut mallory, Request::presence("mallory")).await?;
    assert_eq!(
        recv(&mut mallory).await?,
        Frame::Response(Response::error("user not registered"))
    );
    assert_closed(&mut mallory).await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn session_events_are_published() -> Result<()> {
    let mut server = TestServer::open().await?;
    let mut alice = server.join("alice").await?;

    assert!(matches!(
        server.next_event().await?,
        ServerEvent::Connected { .. }
    ));
    assert_eq!(
        server.next_event().await?,
        ServerEvent::SessionOpened {
            identity: "alice".into()
        }
    );

    send(&mut alice, Request::exit("alice")).await?;
    assert_eq!(
        server.next_event().await?,
        ServerEvent::SessionClosed {
            identity: "alice".into()
        }
    );

    server.stop().await;
    Ok(())
}
