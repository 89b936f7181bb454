//! Minimal interactive demo of the networking core: loads (or bootstraps)
//! a config file, joins the LAN, logs discovery/message events, and reads
//! `uid payload` lines from stdin to drive sends until Ctrl-C.

use std::sync::Arc;

use lan_node_core::{EventBus, MessageReceived, Node, NodeDiscovered, NodeLost};
use log::{info, warn, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};

fn subscribe_logging(bus: &Arc<EventBus>) {
    bus.subscribe_node_discovered(Arc::new(|event: NodeDiscovered| async move {
        info!("discovered {} at {}", event.uid, event.ip);
        Ok(())
    }));
    bus.subscribe_node_lost(Arc::new(|event: NodeLost| async move {
        info!("lost {}", event.uid);
        Ok(())
    }));
    bus.subscribe_message_received(Arc::new(|event: MessageReceived| async move {
        info!("message from {}: {}", event.uid, event.to_json());
        Ok(())
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let file_config = match lan_node_core::config_file::load(&cwd) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return Ok(());
        }
    };

    lan_node_core::logging::init(LevelFilter::Info, None)?;

    let node = Node::new(file_config.into_node_config())?;
    subscribe_logging(&node.event_bus());

    node.start_network().await?;
    info!("node {} is up, type 'uid payload' to send, Ctrl-C to quit", node.uid());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let mut parts = line.splitn(2, ' ');
                let (Some(uid), Some(payload)) = (parts.next(), parts.next()) else {
                    warn!("expected 'uid payload', got: {line:?}");
                    continue;
                };
                node.send(uid, serde_json::json!(payload)).await;
            }
        }
    }

    node.stop_network().await?;
    Ok(())
}
