use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use agent_session::{
    ChannelId, Entity, EntityTarget, RequestSpec, Session, SessionConfig, SessionError,
    WebSocketConnector,
};

use crate::{ListenArgs, RequestArgs};

pub(crate) async fn listen(config: SessionConfig, args: ListenArgs) -> Result<()> {
    let channels: Vec<ChannelId> = args.channels.into_iter().map(ChannelId::from).collect();
    let session = Session::start(config, Arc::new(WebSocketConnector::new()));
    let mut events = session.events();
    session.open_channels(&channels).await;
    info!(count = channels.len(), "listening, Ctrl+C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl+C")?;
                info!("received shutdown signal, cleaning up...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}

pub(crate) async fn request(config: SessionConfig, args: RequestArgs) -> Result<()> {
    let channel = ChannelId::from(args.channel);
    let mut spec = RequestSpec::new(args.message_type);
    for (key, value) in args.fields {
        spec = spec.field(key, value);
    }

    let session = Session::start(config, Arc::new(WebSocketConnector::new()));
    session.open_channels(std::slice::from_ref(&channel)).await;

    let output = match (args.entity_field, args.entity_type, args.category) {
        (Some(field), Some(entity_type), Some(category)) => {
            let target = EntityTarget::new(field, entity_type, category);
            entity_output(session.fetch_entity(&channel, spec, target).await)
        }
        _ => session.request(&channel, spec).await.map_err(anyhow::Error::from),
    };

    session.shutdown().await;
    let output = output.with_context(|| format!("request on channel {channel} failed"))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn entity_output(entity: Result<Entity, SessionError>) -> Result<Value> {
    serde_json::to_value(entity?).context("failed to encode entity")
}
