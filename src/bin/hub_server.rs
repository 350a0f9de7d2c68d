//! Serves the exchange over TCP with newline-delimited JSON frames.
//!
//! One frame per line. This is the smallest transport that exercises the
//! whole stack; production deployments put the hub behind whatever duplex
//! transport they already terminate.

use std::sync::Arc;

use futures::prelude::*;
use structopt::StructOpt;

use cryptohub::exchange::{Exchange, SequentialIdProvider};
use cryptohub::socket::SocketConnection;
use cryptohub::Hub;

/// Run the message exchange hub on a TCP listener.
#[derive(StructOpt)]
#[structopt(name = "hub-server")]
struct Cli {
    /// Address to listen on
    #[structopt(long, default_value = "127.0.0.1:8181")]
    listen: std::net::SocketAddr,
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::from_args();

    let exchange = Exchange::new(SequentialIdProvider::default());
    let hub = Hub::new(exchange);

    let listener = async_std::net::TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, "listening");

    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(?error, "failed to accept connection");
                continue;
            }
        };
        if let Ok(peer) = stream.peer_addr() {
            tracing::debug!(%peer, "accepted connection");
        }

        let framed = futures_codec::Framed::new(stream, futures_codec::LinesCodec {});
        let (send, receive) = framed.split();
        let send = send.with(|frame: Vec<u8>| {
            future::ready(String::from_utf8(frame).map(|mut line| {
                line.push('\n');
                line
            })
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error)))
        });
        let receive = receive.map_ok(String::into_bytes);

        hub.add_connection(Arc::new(SocketConnection::new(send, receive)));
    }

    Ok(())
}
