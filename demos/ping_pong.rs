//! Two listeners on loopback exchanging one reliable ping and an unreliable
//! pong. Run with `cargo run --example ping_pong`.

use redgram::{Config, Listener, Packet, Reliability, SocketState};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let server = Arc::new(Listener::bind("127.0.0.1:0", Config::default()).await?);
    let client = Arc::new(Listener::bind("127.0.0.1:0", Config::default()).await?);

    let pump_server = server.clone();
    let server_task = tokio::spawn(async move {
        loop {
            pump_server.receive(true, Duration::from_millis(10)).await;
            pump_server.update().await;

            for connection in pump_server.connections().await {
                while let Some(packet) = connection.pop().await {
                    if packet.payload().is_empty() {
                        continue; // a bare acknowledgement
                    }
                    println!("server got: {}", String::from_utf8_lossy(packet.payload()));

                    let mut reply = Packet::message(Reliability::None);
                    reply.put_payload(b"pong");
                    connection
                        .send(&mut reply, false, pump_server.as_ref())
                        .await
                        .expect("well-formed reply");
                }
            }
        }
    });

    let connection = client.dial(server.local_addr()).await;
    while !connection.connected().await {
        client.receive(true, Duration::from_millis(10)).await;
    }
    println!("connected to {}", connection.remote_addr());

    let mut ping = Packet::message(Reliability::Ack);
    ping.put_payload(b"ping");
    let state = connection.send(&mut ping, true, client.as_ref()).await?;
    assert_eq!(state, SocketState::Done);
    println!("ping acknowledged");

    loop {
        client.receive(true, Duration::from_millis(10)).await;
        if let Some(packet) = connection.pop().await {
            if packet.payload().is_empty() {
                continue;
            }
            println!("client got: {}", String::from_utf8_lossy(packet.payload()));
            break;
        }
    }

    server_task.abort();
    Ok(())
}
