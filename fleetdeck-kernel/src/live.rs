//! Per-connection push loop for the live channel.
//!
//! One task per connection owns both the tick and the receive side, so frames
//! on a connection never interleave and stop as soon as either side closes.
//! The loop is written against `Stream`/`Sink` so it runs without sockets.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::aggregator::StatusAggregator;
use crate::dispatcher::{ControlDispatcher, Target};
use crate::models::{ControlAction, ControlResult, StatusSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close,
    /// pings, pongs, binary
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveCommand {
    service_id: Option<String>,
    environment_id: Option<String>,
    action: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    Snapshot(Box<StatusSnapshot>),
    ControlResult(ControlResultFrame),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResultFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    pub action: ControlAction,
    #[serde(flatten)]
    pub result: ControlResult,
}

pub async fn run_session<R, W>(
    aggregator: &StatusAggregator,
    dispatcher: &ControlDispatcher,
    mut inbound: R,
    mut outbound: W,
    tick: Duration,
) where
    R: Stream<Item = Inbound> + Unpin,
    W: Sink<String> + Unpin,
{
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            frame = inbound.next() => match frame {
                None | Some(Inbound::Close) => break,
                Some(Inbound::Other) => {}
                Some(Inbound::Text(text)) => {
                    let reply = handle_command(dispatcher, &text).await;
                    let answered = matches!(reply, OutboundFrame::ControlResult(_));
                    if push(&mut outbound, &reply).await.is_err() {
                        break;
                    }
                    if answered {
                        let snapshot = OutboundFrame::Snapshot(Box::new(aggregator.snapshot().await));
                        if push(&mut outbound, &snapshot).await.is_err() {
                            break;
                        }
                    }
                }
            },

            _ = ticker.tick() => {
                let snapshot = OutboundFrame::Snapshot(Box::new(aggregator.snapshot().await));
                if push(&mut outbound, &snapshot).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("live session closed");
}

async fn handle_command(dispatcher: &ControlDispatcher, text: &str) -> OutboundFrame {
    let command: LiveCommand = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            return OutboundFrame::Error {
                message: format!("invalid command: {e}"),
            }
        }
    };
    let action: ControlAction = match command.action.parse() {
        Ok(a) => a,
        Err(e) => {
            return OutboundFrame::Error {
                message: format!("{e}"),
            }
        }
    };

    let target = match (&command.service_id, &command.environment_id) {
        (Some(id), _) => Target::Service(id),
        (None, Some(id)) => Target::Environment(id),
        (None, None) => {
            return OutboundFrame::Error {
                message: "command needs serviceId or environmentId".into(),
            }
        }
    };
    let result = dispatcher.execute(target, action).await;

    let (service_id, environment_id) = match target {
        Target::Service(id) => (Some(id.to_string()), None),
        Target::Environment(id) => (None, Some(id.to_string())),
    };
    OutboundFrame::ControlResult(ControlResultFrame {
        service_id,
        environment_id,
        action,
        result,
    })
}

async fn push<W>(outbound: &mut W, frame: &OutboundFrame) -> Result<(), ()>
where
    W: Sink<String> + Unpin,
{
    let text = match serde_json::to_string(frame) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "dropping unserializable frame");
            return Ok(());
        }
    };
    outbound.send(text).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::config::FleetConfig;
    use crate::host::fake::FixedHost;
    use crate::models::ResourceUsage;
    use crate::registry::EnvironmentRegistry;
    use crate::state::LastErrors;
    use futures::channel::mpsc;
    use serde_json::Value;
    use std::sync::Arc;

    const TICK: Duration = Duration::from_secs(2);

    fn context() -> (Arc<StatusAggregator>, Arc<ControlDispatcher>) {
        let cfg: FleetConfig = serde_yaml::from_str(
            r#"
services:
  - { id: api, backend: { kind: container } }
  - { id: worker, backend: { kind: container } }
"#,
        )
        .unwrap();
        let registry = Arc::new(EnvironmentRegistry::from_config(&cfg).unwrap());
        let backend = Arc::new(FakeBackend::new(["api", "worker"]));
        let errors = LastErrors::new();
        let host = Arc::new(FixedHost(ResourceUsage::default()));
        let aggregator = Arc::new(StatusAggregator::new(
            backend.clone(),
            registry.clone(),
            host,
            errors.clone(),
        ));
        let dispatcher = Arc::new(ControlDispatcher::new(backend, registry, errors));
        (aggregator, dispatcher)
    }

    fn spawn_session(
        inbound: mpsc::UnboundedReceiver<Inbound>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> tokio::task::JoinHandle<()> {
        let (aggregator, dispatcher) = context();
        tokio::spawn(async move {
            run_session(&aggregator, &dispatcher, inbound, outbound, TICK).await;
        })
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let text = rx.next().await.expect("session closed early");
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_push_ordered_snapshots() {
        let (_in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, mut out_rx) = mpsc::unbounded();
        let _session = spawn_session(in_rx, out_tx);

        let mut last_seq = 0;
        let mut last_ts = 0;
        for _ in 0..4 {
            let frame = next_frame(&mut out_rx).await;
            assert_eq!(frame["type"], "snapshot");
            let seq = frame["sequence"].as_u64().unwrap();
            let ts = frame["timestamp"].as_i64().unwrap();
            assert!(seq > last_seq);
            assert!(ts > last_ts);
            assert_eq!(frame["summary"]["total"], 2);
            last_seq = seq;
            last_ts = ts;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn command_answers_then_pushes_fresh_snapshot() {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, mut out_rx) = mpsc::unbounded();
        let _session = spawn_session(in_rx, out_tx);

        let first = next_frame(&mut out_rx).await;
        assert_eq!(first["statuses"]["api"]["running"], false);

        in_tx
            .unbounded_send(Inbound::Text(
                r#"{"serviceId":"api","action":"start"}"#.into(),
            ))
            .unwrap();

        let reply = next_frame(&mut out_rx).await;
        assert_eq!(reply["type"], "controlResult");
        assert_eq!(reply["serviceId"], "api");
        assert_eq!(reply["action"], "start");
        assert_eq!(reply["success"], true);

        let fresh = next_frame(&mut out_rx).await;
        assert_eq!(fresh["type"], "snapshot");
        assert_eq!(fresh["statuses"]["api"]["running"], true);
        assert_eq!(fresh["sequence"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_commands_get_an_error_frame() {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, mut out_rx) = mpsc::unbounded();
        let _session = spawn_session(in_rx, out_tx);
        next_frame(&mut out_rx).await;

        in_tx
            .unbounded_send(Inbound::Text(r#"{"serviceId":"api","action":"explode"}"#.into()))
            .unwrap();
        let reply = next_frame(&mut out_rx).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().contains("explode"));

        in_tx.unbounded_send(Inbound::Text("not json".into())).unwrap();
        assert_eq!(next_frame(&mut out_rx).await["type"], "error");

        // unknown service still yields a control result
        in_tx
            .unbounded_send(Inbound::Text(r#"{"serviceId":"nope","action":"stop"}"#.into()))
            .unwrap();
        let reply = next_frame(&mut out_rx).await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"]["kind"], "notFound");
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_after_disconnect() {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, mut out_rx) = mpsc::unbounded();
        let session = spawn_session(in_rx, out_tx);
        next_frame(&mut out_rx).await;

        drop(in_tx);
        session.await.unwrap();
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_sink_ends_the_session() {
        let (_in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded::<String>();
        drop(out_rx);
        let session = spawn_session(in_rx, out_tx);
        session.await.unwrap();
    }
}
