//! Activation through the orchestrator.
//!
//! Tests include:
//! - Barrier handling for normal and immediate requests
//! - Replay of requested events into added extensions
//! - Activation by id
//! - Status bookkeeping from host notifications and failed calls

mod common;

use std::time::Duration;

use common::{id, next_matching};
use exthost_core::prelude::*;
use exthost_core::ActivationTimes;
use exthost_testing::{
    assert_eventually, local_extension, remote_extension, MockCall, TestHarness,
};

#[tokio::test]
async fn test_normal_activation_waits_for_registration() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a").with_activation_events(["onFoo"])])
        .build();

    let orchestrator = h.orchestrator.clone();
    let pending = tokio::spawn(async move {
        orchestrator
            .activate_by_event("onFoo", ActivationKind::Normal)
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());
    assert_eq!(h.orchestrator.requested_activation_events(), vec!["onFoo"]);

    h.orchestrator.initialize().await.unwrap();
    pending.await.unwrap().unwrap();

    // Replayed at start and dispatched after the barrier; activated once.
    assert_eq!(h.local_host().activations(), vec![id("pub.a")]);
    assert!(h
        .local_host()
        .activation_events()
        .iter()
        .all(|event| event == "onFoo"));
}

#[tokio::test]
async fn test_immediate_activation_does_not_wait() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a").with_activation_events(["onFoo"])])
        .build();

    tokio::time::timeout(
        Duration::from_millis(500),
        h.orchestrator
            .activate_by_event("onFoo", ActivationKind::Immediate),
    )
    .await
    .expect("immediate activation must not wait for registration")
    .unwrap();

    h.orchestrator.initialize().await.unwrap();
    // The request was remembered and replayed into the new host.
    assert_eq!(h.local_host().activation_events(), vec!["onFoo"]);
    assert_eq!(h.local_host().activations(), vec![id("pub.a")]);
}

#[tokio::test]
async fn test_uninteresting_event_is_not_dispatched() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a").with_activation_events(["onFoo"])])
        .start()
        .await;
    let mut rx = h.orchestrator.subscribe();

    h.orchestrator
        .activate_by_event("onNothing", ActivationKind::Normal)
        .await
        .unwrap();

    assert!(h.local_host().activation_events().is_empty());
    assert!(rx.drain().is_empty());
    assert!(h
        .orchestrator
        .requested_activation_events()
        .contains(&"onNothing".to_string()));
}

#[tokio::test]
async fn test_dispatch_announces_event() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a").with_activation_events(["onFoo"])])
        .start()
        .await;
    let mut rx = h.orchestrator.subscribe();

    h.orchestrator
        .activate_by_event("onFoo", ActivationKind::Normal)
        .await
        .unwrap();

    let event = next_matching(&mut rx, |e| {
        matches!(e, OrchestratorEvent::WillActivateByEvent { .. })
    })
    .await;
    assert_eq!(
        event,
        OrchestratorEvent::WillActivateByEvent {
            event: "onFoo".to_string()
        }
    );
}

#[tokio::test]
async fn test_host_failure_is_returned() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a").with_activation_events(["onFoo"])])
        .start()
        .await;
    h.local_host().fail_event("onFoo");

    let err = h
        .orchestrator
        .activate_by_event("onFoo", ActivationKind::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::ActivationEventFailed { .. }));
}

#[tokio::test]
async fn test_requested_event_is_replayed_into_added_extension() {
    let h = TestHarness::builder().start().await;
    h.orchestrator
        .activate_by_event("onFoo", ActivationKind::Normal)
        .await
        .unwrap();

    let handle = h.install(local_extension("pub.late").with_activation_events(["onFoo"]));
    h.orchestrator.request_delta(vec![handle], vec![]).await;

    let host = h.local_host();
    assert_eventually!(host.activations() == vec![id("pub.late")]);
    assert!(host.calls().contains(&MockCall::Activate {
        extension_id: id("pub.late"),
        event: "onFoo".to_string(),
    }));
}

#[tokio::test]
async fn test_startup_extensions_are_activated_when_added() {
    let h = TestHarness::builder().start().await;

    let star = h.install(local_extension("pub.star").with_activation_events(["*"]));
    let finished =
        h.install(local_extension("pub.finished").with_activation_events(["onStartupFinished"]));
    let lazy = h.install(local_extension("pub.lazy").with_activation_events(["onCommand:x"]));
    h.orchestrator
        .request_delta(vec![star, finished, lazy], vec![])
        .await;

    let host = h.local_host();
    assert_eventually!(host.activations().len() == 2);
    let activations = host.activations();
    assert!(activations.contains(&id("pub.star")));
    assert!(activations.contains(&id("pub.finished")));
    assert!(!activations.contains(&id("pub.lazy")));
}

#[tokio::test]
async fn test_workspace_contains_is_checked_for_added_extension() {
    let h = TestHarness::builder().start().await;
    h.workspace
        .matches("pub.ws", "workspaceContains:Cargo.toml");

    let ws = h.install(
        local_extension("pub.ws").with_activation_events(["workspaceContains:Cargo.toml"]),
    );
    let other = h.install(
        local_extension("pub.other").with_activation_events(["workspaceContains:go.mod"]),
    );
    h.orchestrator.request_delta(vec![ws, other], vec![]).await;

    let host = h.local_host();
    assert_eventually!(host.activations() == vec![id("pub.ws")]);
    assert_eventually!(h.workspace.checks() == 2);
    assert!(h
        .workspace
        .checked()
        .iter()
        .all(|(kind, _)| *kind == ExtensionHostKind::LocalProcess));
    assert!(host.calls().contains(&MockCall::Activate {
        extension_id: id("pub.ws"),
        event: "workspaceContains:Cargo.toml".to_string(),
    }));
}

#[tokio::test]
async fn test_on_uri_is_scoped_to_extension() {
    let h = TestHarness::builder().start().await;
    h.orchestrator
        .activate_by_event("onUri:pub.uri", ActivationKind::Normal)
        .await
        .unwrap();

    let handle = h.install(local_extension("Pub.Uri").with_activation_events(["onUri"]));
    h.orchestrator.request_delta(vec![handle], vec![]).await;

    assert_eventually!(h.local_host().activations() == vec![id("pub.uri")]);
}

#[tokio::test]
async fn test_activate_by_id() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a")])
        .start()
        .await;

    h.orchestrator
        .activate_by_id(&id("pub.a"), ActivationReason::new(id("pub.a"), "api"))
        .await
        .unwrap();
    assert_eq!(h.local_host().activations(), vec![id("pub.a")]);
    assert!(h.orchestrator.is_extension_active(&id("pub.a")));

    let err = h
        .orchestrator
        .activate_by_id(&id("pub.missing"), ActivationReason::new(id("pub.missing"), "api"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Unknown extension pub.missing");
}

#[tokio::test]
async fn test_status_collects_host_reports() {
    let h = TestHarness::builder()
        .installed([
            local_extension("pub.a").with_activation_events(["onFoo"]),
            local_extension("pub.b").with_activation_events(["onFoo"]),
        ])
        .start()
        .await;
    h.local_host().fail_activation("pub.b");

    h.orchestrator
        .activate_by_event("onFoo", ActivationKind::Normal)
        .await
        .unwrap();
    h.local_host().emit(HostNotification::RuntimeError {
        extension_id: id("pub.a"),
        message: "boom".to_string(),
    });

    assert_eventually!(!h.orchestrator.get_extensions_status()["pub.a"]
        .runtime_errors
        .is_empty());
    assert_eventually!(!h.orchestrator.get_extensions_status()["pub.b"]
        .messages
        .is_empty());

    let status = h.orchestrator.get_extensions_status();
    let a = &status["pub.a"];
    assert!(a.is_active);
    assert_eq!(a.running_location, Some(ExtensionRunningLocation::LocalProcess));
    assert_eq!(a.runtime_errors, vec!["boom".to_string()]);
    assert_eq!(
        a.activation_times,
        Some(ActivationTimes {
            code_loading_ms: 1,
            activate_call_ms: 1,
            activate_resolved_ms: 2,
            activation_event: "onFoo".to_string(),
        })
    );

    let b = &status["pub.b"];
    assert!(!b.is_active);
    assert!(b.activation_times.is_none());
    assert_eq!(b.runtime_errors, vec!["activate() threw".to_string()]);
    assert_eq!(b.messages[0].severity, Severity::Error);
    assert!(b.messages[0].message.contains("activate() threw"));
}

#[tokio::test]
async fn test_failed_activation_by_id_is_recorded() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a")])
        .start()
        .await;
    let mut rx = h.orchestrator.subscribe();
    h.local_host().reject_activation("pub.a");

    let err = h
        .orchestrator
        .activate_by_id(&id("pub.a"), ActivationReason::new(id("pub.a"), "api"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::ActivationFailed { .. }));

    let event = next_matching(&mut rx, OrchestratorEvent::is_status_event).await;
    assert_eq!(
        event,
        OrchestratorEvent::DidChangeExtensionsStatus {
            extension_ids: vec![id("pub.a")]
        }
    );
    let status = h.orchestrator.get_extensions_status();
    assert_eq!(status["pub.a"].runtime_errors, vec![err.to_string()]);
    assert!(!status["pub.a"].is_active);
}

#[tokio::test]
async fn test_failed_replay_into_added_extension_is_recorded() {
    let h = TestHarness::builder().start().await;
    h.orchestrator
        .activate_by_event("onFoo", ActivationKind::Normal)
        .await
        .unwrap();
    h.local_host().reject_activation("pub.b");

    let handle = h.install(local_extension("pub.b").with_activation_events(["onFoo"]));
    h.orchestrator.request_delta(vec![handle], vec![]).await;

    assert_eventually!(!h.orchestrator.get_extensions_status()["pub.b"]
        .runtime_errors
        .is_empty());
    let status = h.orchestrator.get_extensions_status();
    assert_eq!(status["pub.b"].runtime_errors.len(), 1);
    assert!(status["pub.b"].runtime_errors[0].contains("activate request rejected"));
    assert!(h.local_host().activations().is_empty());
}

#[tokio::test]
async fn test_immediate_event_during_slow_host_start_is_delivered() {
    let h = TestHarness::builder()
        .installed([local_extension("pub.a").with_activation_events(["onNow"])])
        .build();
    h.factory
        .on_create(|host| host.set_start_delay(Duration::from_millis(200)));

    let orchestrator = h.orchestrator.clone();
    let init = tokio::spawn(async move { orchestrator.initialize().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.orchestrator
        .activate_by_event("onNow", ActivationKind::Immediate)
        .await
        .unwrap();
    init.await.unwrap().unwrap();

    let host = h.local_host();
    assert_eq!(host.activation_events(), vec!["onNow".to_string()]);
    assert_eq!(host.activations(), vec![id("pub.a")]);
}

#[tokio::test]
async fn test_responsive_state_is_published() {
    let h = TestHarness::builder().start().await;
    let mut rx = h.orchestrator.subscribe();

    h.local_host()
        .emit(HostNotification::ResponsiveStateChanged(false));

    let event = next_matching(&mut rx, |e| {
        matches!(e, OrchestratorEvent::DidChangeResponsiveState { .. })
    })
    .await;
    assert_eq!(
        event,
        OrchestratorEvent::DidChangeResponsiveState {
            kind: ExtensionHostKind::LocalProcess,
            is_responsive: false,
        }
    );
    assert_eventually!(!h.orchestrator.live_hosts()[0].is_responsive);
}

#[tokio::test]
async fn test_workspace_contains_is_checked_on_the_running_host() {
    let h = TestHarness::builder().with_remote_host().start().await;
    h.workspace
        .matches("pub.rws", "workspaceContains:Cargo.toml");

    let handle = h.install(
        remote_extension("pub.rws").with_activation_events(["workspaceContains:Cargo.toml"]),
    );
    h.orchestrator.request_delta(vec![handle], vec![]).await;

    assert_eventually!(h.remote_host().activations() == vec![id("pub.rws")]);
    assert_eq!(
        h.workspace.checked(),
        vec![(ExtensionHostKind::Remote, id("pub.rws"))]
    );
}
