use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_core::{
    Channel, ChatError, ChatEvent, ConnectedEvent, Message, OwnUser, SocketListener, User,
};
use chat_offline::{ChannelLogicConfig, ChannelQueryClient, ChannelRegistry, QueryChannelRequest};
use chat_platform::{
    CachedTokenProvider, InMemoryLocalStore, ManualLifecycle, ManualNetworkState,
    StaticTokenLoader, dev_token,
};
use chat_socket::{
    ChatSocket, ChatSocketConfig, ChatSocketDeps, LoopbackServer, LoopbackTransport,
};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

mod logging;

const SMOKE_USER: &str = "smoke-user";
const SMOKE_CHANNEL_TYPE: &str = "messaging";
const SMOKE_CHANNEL_ID: &str = "smoke";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel query backend that answers with one canned message.
struct CannedQueryClient;

#[async_trait]
impl ChannelQueryClient for CannedQueryClient {
    async fn query_channel(
        &self,
        channel_type: &str,
        channel_id: &str,
        _request: &QueryChannelRequest,
    ) -> Result<Channel, ChatError> {
        let cid = chat_core::cid_of(channel_type, channel_id);
        Ok(Channel {
            cid: cid.clone(),
            channel_type: channel_type.to_owned(),
            id: channel_id.to_owned(),
            messages: vec![smoke_message(&cid, "welcome", 1_000)],
            member_count: 2,
            ..Channel::default()
        })
    }
}

fn smoke_message(cid: &str, id: &str, created_at: u64) -> Message {
    Message {
        id: id.to_owned(),
        cid: cid.to_owned(),
        user: User::new("echo-bot"),
        text: format!("smoke message {id}"),
        created_at: Some(created_at),
        ..Message::default()
    }
}

/// Plays the server: acknowledges the session and pushes one new message.
async fn serve(mut server: LoopbackServer) {
    let Some(peer) = server.accept().await else {
        warn!("loopback transport closed before a session was opened");
        return;
    };
    info!(endpoint = %peer.conf().endpoint(), "loopback session accepted");

    let cid = chat_core::cid_of(SMOKE_CHANNEL_TYPE, SMOKE_CHANNEL_ID);
    let ack = ChatEvent::Connected(ConnectedEvent {
        connection_id: "smoke-connection".to_owned(),
        me: OwnUser {
            id: SMOKE_USER.to_owned(),
            ..OwnUser::default()
        },
        created_at: 1_500,
    });
    let message = ChatEvent::NewMessage {
        cid: cid.clone(),
        message: smoke_message(&cid, "live", 2_000),
        created_at: 2_000,
    };
    if !(peer.open().await && peer.push_event(&ack).await && peer.push_event(&message).await) {
        warn!("client went away during the loopback handshake");
        return;
    }
    peer.closed().await;
    info!(close_code = ?peer.close_code(), "loopback session closed by client");
}

async fn run() -> Result<(), String> {
    let config = match ChatSocketConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "socket config from env unusable; using loopback defaults");
            ChatSocketConfig::new("smoke-key", "ws://localhost:3030").map_err(|e| e.to_string())?
        }
    };

    let (transport, server) = LoopbackTransport::new();
    tokio::spawn(serve(server));

    let socket = ChatSocket::new(
        config,
        ChatSocketDeps {
            transport: Arc::new(transport),
            token_provider: Arc::new(CachedTokenProvider::new(StaticTokenLoader::new(
                dev_token(SMOKE_USER),
            ))),
            network: Arc::new(ManualNetworkState::new(true)),
            lifecycle: Arc::new(ManualLifecycle::new()),
        },
    );
    let registry = Arc::new(ChannelRegistry::new(
        ChannelLogicConfig::default(),
        Arc::new(InMemoryLocalStore::new()),
        Arc::new(CannedQueryClient),
    ));
    socket.add_listener(registry.clone() as Arc<dyn SocketListener>);

    let channel = registry.channel(SMOKE_CHANNEL_TYPE, SMOKE_CHANNEL_ID);
    let snapshot = channel.watch(None).await.map_err(|e| e.to_string())?;
    info!(cid = %snapshot.cid, messages = snapshot.messages.len(), "channel watched");

    socket
        .connect_user(User::new(SMOKE_USER))
        .map_err(|e| e.to_string())?;
    let mut state = socket.subscribe_state();
    timeout(STEP_TIMEOUT, state.wait_for(|current| current.is_connected()))
        .await
        .map_err(|_| "socket did not connect in time".to_owned())?
        .map_err(|e| e.to_string())?;
    info!(connection_id = ?socket.connection_id(), "socket connected");

    timeout(STEP_TIMEOUT, async {
        while channel.get_message("live").is_none() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| "live message never reached the channel".to_owned())?;

    let snapshot = channel.snapshot();
    info!(
        messages = snapshot.messages.len(),
        unread = snapshot.unread_count,
        "channel reconciled"
    );

    socket.disconnect().map_err(|e| e.to_string())?;
    socket.terminate();
    Ok(())
}

#[tokio::main]
async fn main() {
    logging::init();

    match run().await {
        Ok(()) => println!("Chat connection smoke run completed over the loopback transport."),
        Err(err) => {
            eprintln!("Smoke run failed: {err}");
            std::process::exit(1);
        }
    }
}
