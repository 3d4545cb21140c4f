#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bridge_proto::{InvocationRequest, ProxyRequest, ServiceKind};
use guest_sim::{ExecReply, GuestSim, ServiceReply, SimFactory};
use orchestrator::config::OverlayConfig;
use orchestrator::{
    Event, Orchestrator, OrchestratorConfig, OrchestratorError, SandboxOptions, SandboxState,
    Service,
};
use serde_json::json;
use tokio::sync::broadcast;

const ECHO: &str = r#"export default async (req) => Response.json({ hello: req.body.name });"#;

fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.sandbox.image = PathBuf::from("/images/sim.img");
    config.functions.project = "acme".into();
    config
}

fn setup() -> (Orchestrator, SimFactory) {
    let factory = SimFactory::new(GuestSim::new());
    let orchestrator = Orchestrator::new(config(), Arc::new(factory.clone())).unwrap();
    (orchestrator, factory)
}

/// Drain events up to and including the first `Started` or `Error`.
async fn events_until_settled(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for events")
            .unwrap();
        let done = matches!(event, Event::Started | Event::Error { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn wait_for_state(orchestrator: &Orchestrator, state: SandboxState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.state() != state {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {state}, stuck in {}", orchestrator.state()));
}

#[tokio::test]
async fn echo_survives_stop_and_restart() {
    let (orchestrator, factory) = setup();
    orchestrator.start().await.unwrap();
    orchestrator.registry().deploy("echo", ECHO).unwrap();

    let invoke = || {
        orchestrator.registry().invoke(
            "echo",
            InvocationRequest::with_body(json!({"name": "X"})),
            None,
        )
    };
    let first = invoke().await.unwrap();
    assert_eq!(first.status, 200);
    assert!(first.body.to_string().contains("\"X\""), "{}", first.body);

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.state(), SandboxState::Stopped);
    orchestrator.restart().await.unwrap();
    assert_eq!(orchestrator.state(), SandboxState::Running);
    assert_eq!(factory.boots(), 2);

    let second = invoke().await.unwrap();
    assert_eq!(second.status, 200);
    assert_eq!(second.body, first.body);
    assert_eq!(orchestrator.registry().get("echo").unwrap().version, 1);
}

#[tokio::test]
async fn start_runs_every_stage_in_order() {
    let (orchestrator, factory) = setup();
    let mut rx = orchestrator.subscribe();
    orchestrator.start().await.unwrap();

    assert_eq!(
        events_until_settled(&mut rx).await,
        vec![
            Event::StateChanged {
                from: SandboxState::Stopped,
                to: SandboxState::Starting
            },
            Event::ServiceChanged {
                service: Service::Runtime,
                ready: true
            },
            Event::ServiceChanged {
                service: Service::Gateway,
                ready: true
            },
            Event::ServiceChanged {
                service: Service::Functions,
                ready: true
            },
            Event::ServiceChanged {
                service: Service::Proxy,
                ready: true
            },
            Event::StateChanged {
                from: SandboxState::Starting,
                to: SandboxState::Running
            },
            Event::Started,
        ]
    );
    assert_eq!(
        factory.sim().started(),
        vec![
            ServiceKind::Gateway,
            ServiceKind::FunctionRuntime,
            ServiceKind::Proxy
        ]
    );
    // Runtime confirmed, no install needed.
    assert_eq!(factory.sim().executed(), vec!["deno --version"]);

    let status = orchestrator.get_status();
    assert!(status.ready);
    assert!(status.error.is_none());
    assert!(status.services.runtime && status.services.gateway);
    assert!(status.services.functions && status.services.proxy);
    assert!(!status.services.overlay);
    assert_eq!(status.resources.memory_mb, 2048);
    assert!(status.sandbox_id.is_some());
}

#[tokio::test]
async fn start_is_a_noop_while_running() {
    let (orchestrator, factory) = setup();
    orchestrator.start().await.unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(factory.boots(), 1);
    assert_eq!(orchestrator.state(), SandboxState::Running);
}

#[tokio::test]
async fn concurrent_starts_boot_once() {
    let (orchestrator, factory) = setup();
    let (a, b) = tokio::join!(orchestrator.start(), orchestrator.start());
    a.unwrap();
    b.unwrap();
    assert_eq!(factory.boots(), 1);
    assert_eq!(orchestrator.state(), SandboxState::Running);
}

#[tokio::test]
async fn boot_failure_moves_to_error() {
    let (orchestrator, factory) = setup();
    factory.fail_boot(Some("image corrupt"));

    let err = orchestrator.start().await.unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Initialization { stage: "boot", .. }),
        "{err}"
    );
    let status = orchestrator.get_status();
    assert_eq!(status.state, SandboxState::Error);
    assert!(status.error.as_deref().unwrap().contains("image corrupt"));
    assert!(!status.ready);

    // The message stays until a successful start.
    orchestrator.stop().await.unwrap();
    assert!(orchestrator.get_status().error.is_some());

    factory.fail_boot(None);
    orchestrator.start().await.unwrap();
    let status = orchestrator.get_status();
    assert_eq!(status.state, SandboxState::Running);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn unanswered_handshake_fails_boot() {
    let mut config = config();
    config.timeouts.ping_ms = 100;
    config.resilience.retry.max_attempts = 1;
    let factory = SimFactory::new(GuestSim::new());
    factory.sim().set_silent(true);
    let orchestrator = Orchestrator::new(config, Arc::new(factory.clone())).unwrap();

    let err = orchestrator.start().await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
    assert_eq!(orchestrator.state(), SandboxState::Error);
    assert!(!orchestrator.bridge().is_attached());
}

#[tokio::test]
async fn runtime_install_failure_is_fatal() {
    let (orchestrator, factory) = setup();
    factory
        .sim()
        .on_exec("deno --version", ExecReply::fail(127, "deno: not found"))
        .on_exec("curl", ExecReply::fail(6, "could not resolve host"));

    let err = orchestrator.start().await.unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Initialization { stage: "runtime", .. }),
        "{err}"
    );
    let status = orchestrator.get_status();
    assert_eq!(status.state, SandboxState::Error);
    assert!(status.error.unwrap().contains("could not resolve host"));
    assert!(!status.services.runtime);
    assert!(factory.sim().started().is_empty());
    assert!(!orchestrator.bridge().is_attached());
}

#[tokio::test]
async fn optional_stage_failure_skips_the_chain() {
    let (orchestrator, factory) = setup();
    factory
        .sim()
        .on_service(ServiceKind::Gateway, ServiceReply::Fail("port in use".into()));
    let mut rx = orchestrator.subscribe();

    orchestrator.start().await.unwrap();

    // The gateway flag never left false, so there is no transition to report.
    let events = events_until_settled(&mut rx).await;
    assert!(!events.iter().any(|e| matches!(
        e,
        Event::ServiceChanged {
            service: Service::Gateway | Service::Functions | Service::Proxy,
            ..
        }
    )));
    let status = orchestrator.get_status();
    assert_eq!(status.state, SandboxState::Running);
    assert!(status.ready);
    assert!(status.services.runtime);
    assert!(!status.services.gateway);
    assert!(!status.services.functions);
    assert!(!status.services.proxy);
    assert_eq!(factory.sim().started(), vec![ServiceKind::Gateway]);
}

#[tokio::test]
async fn overlay_runs_only_when_configured() {
    let (orchestrator, factory) = setup();
    orchestrator.start().await.unwrap();
    assert!(!factory.sim().started().contains(&ServiceKind::Overlay));
    orchestrator.stop().await.unwrap();

    orchestrator
        .configure(SandboxOptions {
            overlay: Some(OverlayConfig {
                auth_key: "tskey-test".into(),
                hostname: "sbx".into(),
            }),
            ..SandboxOptions::default()
        })
        .unwrap();
    orchestrator.start().await.unwrap();
    assert!(orchestrator.get_status().services.overlay);
    assert!(factory.sim().started().contains(&ServiceKind::Overlay));
}

#[tokio::test]
async fn overlay_waits_for_the_proxy() {
    let mut config = config();
    config.overlay = Some(OverlayConfig {
        auth_key: "tskey-test".into(),
        hostname: "sbx".into(),
    });
    let factory = SimFactory::new(GuestSim::new());
    factory
        .sim()
        .on_service(ServiceKind::Gateway, ServiceReply::Fail("port in use".into()));
    let orchestrator = Orchestrator::new(config, Arc::new(factory.clone())).unwrap();

    orchestrator.start().await.unwrap();
    let status = orchestrator.get_status();
    assert_eq!(status.state, SandboxState::Running);
    assert!(!status.services.proxy);
    assert!(!status.services.overlay);
    assert_eq!(factory.sim().started(), vec![ServiceKind::Gateway]);
}

#[tokio::test]
async fn overlay_failure_leaves_running() {
    let mut config = config();
    config.overlay = Some(OverlayConfig {
        auth_key: "expired".into(),
        hostname: "sbx".into(),
    });
    let factory = SimFactory::new(GuestSim::new());
    factory
        .sim()
        .on_service(ServiceKind::Overlay, ServiceReply::Fail("auth key expired".into()));
    let orchestrator = Orchestrator::new(config, Arc::new(factory.clone())).unwrap();

    orchestrator.start().await.unwrap();
    let status = orchestrator.get_status();
    assert_eq!(status.state, SandboxState::Running);
    assert!(status.services.proxy);
    assert!(!status.services.overlay);
}

#[tokio::test]
async fn configure_applies_on_next_start() {
    let (orchestrator, factory) = setup();
    orchestrator.start().await.unwrap();

    orchestrator
        .configure(SandboxOptions {
            memory_mb: Some(512),
            cpu_count: Some(1),
            ..SandboxOptions::default()
        })
        .unwrap();
    assert_eq!(factory.last_spec().unwrap().resources.memory_mb, 2048);
    assert_eq!(orchestrator.get_status().resources.memory_mb, 2048);

    orchestrator.restart().await.unwrap();
    let spec = factory.last_spec().unwrap();
    assert_eq!(spec.resources.memory_mb, 512);
    assert_eq!(spec.resources.cpu_count, 1);
    assert_eq!(orchestrator.get_status().resources.memory_mb, 512);

    let err = orchestrator
        .configure(SandboxOptions {
            cpu_count: Some(0),
            ..SandboxOptions::default()
        })
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Config(_)));
}

#[tokio::test]
async fn stop_resets_runtime_state_only() {
    let (orchestrator, factory) = setup();
    orchestrator.start().await.unwrap();
    orchestrator.registry().deploy("echo", ECHO).unwrap();
    let mut rx = orchestrator.subscribe();

    orchestrator.stop().await.unwrap();

    let status = orchestrator.get_status();
    assert_eq!(status.state, SandboxState::Stopped);
    assert!(!status.ready);
    assert_eq!(status.uptime_ms, 0);
    assert!(status.services.ready().is_empty());
    assert!(!orchestrator.bridge().is_attached());
    assert_eq!(orchestrator.registry().len(), 1);

    let mut stopped = Vec::new();
    while let Ok(event) = rx.try_recv() {
        stopped.push(event);
    }
    assert_eq!(stopped.last(), Some(&Event::Stopped));
    assert!(stopped.contains(&Event::ServiceChanged {
        service: Service::Proxy,
        ready: false
    }));

    // Stopping twice is harmless.
    orchestrator.stop().await.unwrap();
    assert_eq!(factory.boots(), 1);
}

#[tokio::test]
async fn status_is_a_copy() {
    let (orchestrator, _factory) = setup();
    let mut status = orchestrator.get_status();
    status.state = SandboxState::Running;
    status.ready = true;
    assert_eq!(orchestrator.state(), SandboxState::Stopped);
    assert!(!orchestrator.get_status().ready);
}

#[tokio::test]
async fn uptime_ticks_while_running() {
    let (orchestrator, _factory) = setup();
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.get_status().uptime_ms, 0);

    tokio::time::sleep(Duration::from_millis(2300)).await;
    let uptime = orchestrator.get_status().uptime_ms;
    assert!(uptime >= 1000, "uptime {uptime}");

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.get_status().uptime_ms, 0);
}

#[tokio::test]
async fn guest_exit_moves_running_to_error() {
    let (orchestrator, factory) = setup();
    orchestrator.start().await.unwrap();

    // The simulated guest ends its connection after acknowledging shutdown.
    assert!(orchestrator.bridge().shutdown(Duration::from_secs(1)).await);
    wait_for_state(&orchestrator, SandboxState::Error).await;
    let status = orchestrator.get_status();
    assert!(status.error.unwrap().contains("channel closed"));
    assert!(!status.ready);

    orchestrator.stop().await.unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state(), SandboxState::Running);
    assert_eq!(factory.boots(), 2);
}

#[tokio::test]
async fn proxy_and_monitoring_use_the_attached_bridge() {
    let (orchestrator, factory) = setup();
    factory.sim().on_exec(
        "ps ",
        ExecReply::ok("  150 S 1.0 2048 5 deno run server.ts\n    7 S 0.0 10 5 [kthreadd]\n"),
    );
    orchestrator.start().await.unwrap();

    let resp = orchestrator
        .bridge()
        .proxy(ProxyRequest {
            method: "GET".into(),
            path: "/rest/v1/todos".into(),
            headers: Default::default(),
            body: None,
        })
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "/rest/v1/todos");

    let target = orchestrator.get_status().sandbox_id.unwrap().to_string();
    assert_eq!(orchestrator.monitor().targets(), vec![target.clone()]);
    let processes = orchestrator.monitor().get_processes(&target).await;
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].pid, 150);

    orchestrator.monitor().start_monitoring(Duration::from_secs(60));
    orchestrator.stop().await.unwrap();
    assert!(!orchestrator.monitor().is_monitoring());
    assert!(orchestrator.monitor().targets().is_empty());
}
