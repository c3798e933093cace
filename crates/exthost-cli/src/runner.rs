//! Child side of the process host protocol.
//!
//! Reads requests from stdin and answers on stdout. The runner has no
//! extension code to load; "activating" an extension means recording it as
//! active and reporting the usual will/did events.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use exthost_core::host::protocol::{
    decode_line, encode_line, HostRequest, RunnerMessage, HOST_PROTOCOL_VERSION,
};
use exthost_core::{
    ActivationTimes, ExtensionDescription, ExtensionHostKind, ExtensionIdentifier,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Extension bookkeeping of one runner.
pub struct HostRunner {
    kind: ExtensionHostKind,
    known: HashMap<String, ExtensionDescription>,
    mine: Vec<ExtensionIdentifier>,
    active: HashSet<ExtensionIdentifier>,
}

/// What to do after handling a request.
#[derive(Debug, PartialEq)]
pub struct Reply {
    pub messages: Vec<RunnerMessage>,
    pub shutdown: bool,
}

impl Reply {
    fn one(message: RunnerMessage) -> Self {
        Self {
            messages: vec![message],
            shutdown: false,
        }
    }
}

impl HostRunner {
    pub fn new(kind: ExtensionHostKind) -> Self {
        Self {
            kind,
            known: HashMap::new(),
            mine: Vec::new(),
            active: HashSet::new(),
        }
    }

    pub fn is_active(&self, extension_id: &ExtensionIdentifier) -> bool {
        self.active.contains(extension_id)
    }

    pub fn handle(&mut self, request: HostRequest) -> Reply {
        match request {
            HostRequest::Start {
                request_id,
                protocol_version,
                host_kind,
                all_extensions,
                my_extensions,
            } => {
                if protocol_version != HOST_PROTOCOL_VERSION {
                    return Reply::one(RunnerMessage::Failed {
                        request_id,
                        error: format!(
                            "unsupported protocol {protocol_version}, expected {HOST_PROTOCOL_VERSION}"
                        ),
                    });
                }
                if host_kind != self.kind {
                    tracing::warn!(expected = %self.kind, got = %host_kind, "Started as a different host kind");
                }
                self.known = all_extensions
                    .into_iter()
                    .map(|desc| (desc.identifier.key().to_string(), desc))
                    .collect();
                self.mine = my_extensions;
                tracing::info!(kind = %self.kind, extensions = self.mine.len(), "Host runner started");
                Reply::one(RunnerMessage::Ack {
                    request_id,
                    protocol_version: Some(HOST_PROTOCOL_VERSION),
                })
            }
            HostRequest::Activate {
                request_id,
                extension_id,
                reason,
            } => {
                if !self.mine.contains(&extension_id) {
                    return Reply::one(RunnerMessage::Activated {
                        request_id,
                        activated: false,
                    });
                }
                let mut messages = self.activate(&extension_id, &reason.activation_event);
                let activated = !messages
                    .iter()
                    .any(|m| matches!(m, RunnerMessage::ActivationError { .. }));
                messages.push(RunnerMessage::Activated {
                    request_id,
                    activated,
                });
                Reply {
                    messages,
                    shutdown: false,
                }
            }
            HostRequest::ActivateByEvent {
                request_id, event, ..
            } => {
                let interested: Vec<ExtensionIdentifier> = self
                    .mine
                    .iter()
                    .filter(|id| {
                        self.known.get(id.key()).is_some_and(|desc| {
                            desc.effective_activation_events().any(|e| e == event)
                        })
                    })
                    .cloned()
                    .collect();
                let mut messages: Vec<RunnerMessage> = interested
                    .iter()
                    .flat_map(|id| self.activate(id, &event))
                    .collect();
                messages.push(RunnerMessage::Ack {
                    request_id,
                    protocol_version: None,
                });
                Reply {
                    messages,
                    shutdown: false,
                }
            }
            HostRequest::DeltaExtensions {
                request_id,
                to_add,
                to_remove,
            } => {
                for id in &to_remove {
                    self.mine.retain(|member| member != id);
                    self.active.remove(id);
                    self.known.remove(id.key());
                }
                for desc in to_add {
                    if !self.mine.contains(&desc.identifier) {
                        self.mine.push(desc.identifier.clone());
                    }
                    self.known.insert(desc.identifier.key().to_string(), desc);
                }
                Reply::one(RunnerMessage::Ack {
                    request_id,
                    protocol_version: None,
                })
            }
            HostRequest::Ping { request_id } => Reply::one(RunnerMessage::Pong { request_id }),
            HostRequest::Shutdown { request_id } => Reply {
                messages: vec![RunnerMessage::Ack {
                    request_id,
                    protocol_version: None,
                }],
                shutdown: true,
            },
        }
    }

    /// Events for activating one member; nothing when already active.
    ///
    /// Loading resolves the member's description, the call marks it active,
    /// and it resolves once the will-activate event is ready.
    fn activate(&mut self, extension_id: &ExtensionIdentifier, event: &str) -> Vec<RunnerMessage> {
        if self.active.contains(extension_id) {
            return Vec::new();
        }
        let loading = Instant::now();
        let Some(location) = self
            .known
            .get(extension_id.key())
            .map(|desc| desc.location.clone())
        else {
            tracing::warn!(extension_id = %extension_id, "No description for member");
            return vec![RunnerMessage::ActivationError {
                extension_id: extension_id.clone(),
                error: format!("Unknown extension {extension_id}"),
            }];
        };
        let code_loading = loading.elapsed();

        let call = Instant::now();
        self.active.insert(extension_id.clone());
        tracing::debug!(extension_id = %extension_id, event, location = ?location, "Activating extension");
        let activate_call = call.elapsed();
        let will_activate = RunnerMessage::WillActivate {
            extension_id: extension_id.clone(),
        };
        let activate_resolved = call.elapsed();

        vec![
            will_activate,
            RunnerMessage::DidActivate {
                extension_id: extension_id.clone(),
                times: ActivationTimes {
                    code_loading_ms: millis(code_loading),
                    activate_call_ms: millis(activate_call),
                    activate_resolved_ms: millis(activate_resolved),
                    activation_event: event.to_string(),
                },
            },
        ]
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Serve requests from `reader` until shutdown or end of input.
pub async fn serve<R, W>(kind: ExtensionHostKind, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut runner = HostRunner::new(kind);
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("reading request")? {
        let request = match decode_line::<HostRequest>(&line) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed request");
                continue;
            }
        };
        let reply = runner.handle(request);
        for message in &reply.messages {
            writer.write_all(encode_line(message)?.as_bytes()).await?;
        }
        writer.flush().await?;
        if reply.shutdown {
            tracing::info!(kind = %kind, "Host runner shutting down");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use exthost_core::{ActivationKind, ActivationReason, ExtensionLocation};

    fn desc(id: &str, events: &[&str]) -> ExtensionDescription {
        ExtensionDescription::new(
            id,
            semver::Version::new(1, 0, 0),
            ExtensionLocation::local(format!("/ext/{id}")),
        )
        .with_activation_events(events.iter().copied())
    }

    fn started() -> HostRunner {
        let mut runner = HostRunner::new(ExtensionHostKind::LocalProcess);
        let reply = runner.handle(HostRequest::Start {
            request_id: 1,
            protocol_version: HOST_PROTOCOL_VERSION,
            host_kind: ExtensionHostKind::LocalProcess,
            all_extensions: vec![desc("pub.a", &["onFoo"]), desc("pub.b", &["onBar"])],
            my_extensions: vec!["pub.a".into()],
        });
        assert_eq!(
            reply.messages,
            vec![RunnerMessage::Ack {
                request_id: 1,
                protocol_version: Some(HOST_PROTOCOL_VERSION)
            }]
        );
        runner
    }

    #[test]
    fn test_rejects_other_protocol_version() {
        let mut runner = HostRunner::new(ExtensionHostKind::Remote);
        let reply = runner.handle(HostRequest::Start {
            request_id: 1,
            protocol_version: HOST_PROTOCOL_VERSION + 1,
            host_kind: ExtensionHostKind::Remote,
            all_extensions: vec![],
            my_extensions: vec![],
        });
        assert!(matches!(reply.messages[0], RunnerMessage::Failed { request_id: 1, .. }));
    }

    #[test]
    fn test_activate_by_event_only_touches_own_members() {
        let mut runner = started();

        // pub.b is known but belongs to another host.
        let reply = runner.handle(HostRequest::ActivateByEvent {
            request_id: 2,
            event: "onBar".into(),
            activation_kind: ActivationKind::Normal,
        });
        assert_eq!(reply.messages.len(), 1);

        let reply = runner.handle(HostRequest::ActivateByEvent {
            request_id: 3,
            event: "onFoo".into(),
            activation_kind: ActivationKind::Normal,
        });
        assert_eq!(reply.messages.len(), 3);
        assert_eq!(
            reply.messages[0],
            RunnerMessage::WillActivate {
                extension_id: "pub.a".into()
            }
        );
        assert!(runner.is_active(&"pub.a".into()));

        // Second time: nothing to report but the ack.
        let reply = runner.handle(HostRequest::ActivateByEvent {
            request_id: 4,
            event: "onFoo".into(),
            activation_kind: ActivationKind::Normal,
        });
        assert_eq!(reply.messages.len(), 1);
    }

    #[test]
    fn test_activate_reports_membership() {
        let mut runner = started();
        let reason = ActivationReason::new("pub.b".into(), "api");
        let reply = runner.handle(HostRequest::Activate {
            request_id: 2,
            extension_id: "pub.b".into(),
            reason,
        });
        assert_eq!(
            reply.messages,
            vec![RunnerMessage::Activated {
                request_id: 2,
                activated: false
            }]
        );

        runner.handle(HostRequest::DeltaExtensions {
            request_id: 3,
            to_add: vec![desc("pub.b", &["onBar"])],
            to_remove: vec!["pub.a".into()],
        });
        let reply = runner.handle(HostRequest::Activate {
            request_id: 4,
            extension_id: "pub.b".into(),
            reason: ActivationReason::new("pub.b".into(), "api"),
        });
        assert_eq!(
            reply.messages.last(),
            Some(&RunnerMessage::Activated {
                request_id: 4,
                activated: true
            })
        );
        assert!(!runner.is_active(&"pub.a".into()));
    }

    #[test]
    fn test_activation_times_cover_each_phase() {
        let mut runner = started();
        let reply = runner.handle(HostRequest::ActivateByEvent {
            request_id: 2,
            event: "onFoo".into(),
            activation_kind: ActivationKind::Normal,
        });
        let Some(RunnerMessage::DidActivate { extension_id, times }) = reply.messages.get(1) else {
            panic!("expected did-activate, got {:?}", reply.messages);
        };
        assert_eq!(extension_id, &ExtensionIdentifier::from("pub.a"));
        assert_eq!(times.activation_event, "onFoo");
        assert!(times.activate_resolved_ms >= times.activate_call_ms);
        assert_eq!(millis(Duration::from_micros(2_500)), 2);
    }

    #[test]
    fn test_unknown_member_fails_activation() {
        let mut runner = HostRunner::new(ExtensionHostKind::LocalProcess);
        runner.handle(HostRequest::Start {
            request_id: 1,
            protocol_version: HOST_PROTOCOL_VERSION,
            host_kind: ExtensionHostKind::LocalProcess,
            all_extensions: vec![],
            my_extensions: vec!["pub.ghost".into()],
        });
        let reply = runner.handle(HostRequest::Activate {
            request_id: 2,
            extension_id: "pub.ghost".into(),
            reason: ActivationReason::new("pub.ghost".into(), "api"),
        });
        assert!(matches!(
            reply.messages[0],
            RunnerMessage::ActivationError { .. }
        ));
        assert_eq!(
            reply.messages.last(),
            Some(&RunnerMessage::Activated {
                request_id: 2,
                activated: false
            })
        );
        assert!(!runner.is_active(&"pub.ghost".into()));
    }

    #[tokio::test]
    async fn test_serve_answers_and_stops_on_shutdown() {
        let input = [
            r#"{"kind":"ping","request_id":7}"#,
            "not json",
            r#"{"kind":"shutdown","request_id":8}"#,
            r#"{"kind":"ping","request_id":9}"#,
        ]
        .join("\n");
        let mut output = Vec::new();
        serve(
            ExtensionHostKind::LocalProcess,
            tokio::io::BufReader::new(input.as_bytes()),
            &mut output,
        )
        .await
        .unwrap();

        let replies: Vec<RunnerMessage> = String::from_utf8(output)
            .unwrap()
            .lines()
            .filter_map(|line| decode_line(line).unwrap())
            .collect();
        assert_eq!(
            replies,
            vec![
                RunnerMessage::Pong { request_id: 7 },
                RunnerMessage::Ack {
                    request_id: 8,
                    protocol_version: None
                },
            ]
        );
    }
}
