//! brokerctl — a thin diagnostic client: connects a bare DEALER socket to
//! a running broker's child-facing ROUTER endpoint and issues one `cmb.*`
//! request.
//!
//! # Usage
//!
//! ```bash
//! brokerctl --endpoint tcp://127.0.0.1:5555 ping
//! brokerctl --endpoint tcp://127.0.0.1:5555 lsmod
//! brokerctl --endpoint tcp://127.0.0.1:5555 lspeer
//! ```

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tbon_broker::message::{Message, NODEID_ANY};
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

#[derive(Parser, Debug)]
#[command(name = "brokerctl", version, about)]
struct Cli {
    /// Endpoint of the broker's child-facing ROUTER socket, e.g.
    /// `tcp://127.0.0.1:5555` or `ipc:///tmp/tbon-broker/rank0.sock`.
    #[arg(short, long, env = "BROKERCTL_ENDPOINT")]
    endpoint: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Round-trip a `cmb.ping`.
    Ping {
        #[arg(long, default_value_t = 0)]
        seq: u32,
    },
    /// List loaded modules via `cmb.lsmod`.
    Lsmod,
    /// List known children via `cmb.lspeer`.
    Lspeer,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut socket = DealerSocket::new();
    if let Err(e) = socket.connect(&cli.endpoint).await {
        eprintln!("failed to connect to {}: {e}", cli.endpoint);
        return ExitCode::FAILURE;
    }

    let request = match &cli.command {
        Command::Ping { seq } => Message::request("cmb.ping", NODEID_ANY, 1, &PingReq { seq: *seq }),
        Command::Lsmod => Message::request("cmb.lsmod", NODEID_ANY, 1, &()),
        Command::Lspeer => Message::request("cmb.lspeer", NODEID_ANY, 1, &()),
    };
    let request = match request {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to build request: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = send(&mut socket, &request).await {
        eprintln!("send failed: {e}");
        return ExitCode::FAILURE;
    }

    match recv(&mut socket).await {
        Ok(resp) => {
            match serde_json::to_string_pretty(&resp) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{resp:?}"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("recv failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[derive(serde::Serialize)]
struct PingReq {
    seq: u32,
}

async fn send(socket: &mut DealerSocket, msg: &Message) -> anyhow::Result<()> {
    let bytes = msg.to_bytes()?;
    let mut zmsg = ZmqMessage::from(msg.topic.as_str());
    zmsg.push_back(bytes.into());
    socket.send(zmsg).await?;
    Ok(())
}

async fn recv(socket: &mut DealerSocket) -> anyhow::Result<Message> {
    let zmsg = socket.recv().await?;
    let frames: Vec<_> = zmsg.iter().collect();
    if frames.len() < 2 {
        anyhow::bail!("expected [topic, envelope] from DEALER, got {} frames", frames.len());
    }
    Ok(Message::from_bytes(frames[1].as_ref())?)
}
