//! Hub tests: link backpressure, dispatch into the engine and provider
//! lifecycle, driven through real threads.

use super::*;
use crate::config::DaemonConfig;
use crate::Daemon;
use flowdivert::testing::MemorySocket;
use flowdivert::{ConnectOptions, FlowPolicy, FlowRecord, FlowRequest, NoopObserver, Registry};
use flowdivert_wire::message::GROUP_FLAG_NO_APP_MAP;
use flowdivert_wire::{ConnectResult, FlowId, FlowType, GroupInit, Message, MessageType, Target};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn daemon_with_link(capacity: usize) -> Daemon {
    let mut config = DaemonConfig::default();
    config.global.channels = ChannelConfig {
        provider_link_capacity: capacity,
        dispatcher_capacity: 256,
    };
    Daemon::start(&config, Arc::new(NoopObserver)).unwrap()
}

/// Attach a provider that admits every application and wait until the
/// engine has applied its GROUP_INIT.
fn init_provider(daemon: &Daemon) -> ProviderHandle {
    let provider = daemon.attach_provider(GroupOwner::Kernel).unwrap();
    let init = Message::GroupInit(GroupInit {
        key: Some(Bytes::from_static(b"hub secret")),
        flags: Some(GROUP_FLAG_NO_APP_MAP),
        order: Some(1),
        log_level: None,
    });
    provider.send_message(FlowId::GROUP, &init).unwrap();

    let unit = provider.unit();
    let engine = Arc::clone(daemon.engine());
    assert!(eventually(|| engine
        .registry()
        .get(unit)
        .map_or(false, |g| g.flags() & GROUP_FLAG_NO_APP_MAP != 0)));
    provider
}

fn connect_flow(daemon: &Daemon, unit: ControlUnit) -> (Arc<MemorySocket>, Arc<FlowRecord>) {
    let socket = MemorySocket::new(FlowType::Stream);
    let policy = FlowPolicy {
        control_unit: Some(unit),
        aggregate_mask: 0,
    };
    let flow = daemon.engine().create_flow(
        Arc::downgrade(&socket),
        FlowRequest::new(FlowType::Stream, policy),
    );
    let target = Target::Address("10.0.0.1:443".parse().unwrap());
    daemon
        .engine()
        .connect(&flow, target, ConnectOptions::default())
        .unwrap();
    (socket, flow)
}

mod link_tests {
    use super::*;

    #[test]
    fn test_send_to_unknown_unit_is_disconnected() {
        let (hub, _events) = Hub::new(&ChannelConfig::default());
        assert_eq!(
            hub.send(ControlUnit(7), Bytes::from_static(b"x")),
            Err(ChannelError::Disconnected(ControlUnit(7)))
        );
    }

    #[test]
    fn test_full_link_reports_drain_once() {
        let config = ChannelConfig {
            provider_link_capacity: 1,
            dispatcher_capacity: 16,
        };
        let (hub, events) = Hub::new(&config);
        let engine = Engine::new(
            Default::default(),
            Arc::new(Registry::new()),
            Arc::clone(&hub) as Arc<dyn ControlChannel>,
        );
        let provider = hub.attach(&engine, GroupOwner::Kernel).unwrap();
        let unit = provider.unit();

        assert_eq!(hub.send(unit, Bytes::from_static(b"one")), Ok(()));
        assert_eq!(
            hub.send(unit, Bytes::from_static(b"two")),
            Err(ChannelError::WouldBlock)
        );
        assert_eq!(provider.pending(), 1);

        assert_eq!(provider.try_recv(), Some(Bytes::from_static(b"one")));
        assert!(matches!(events.try_recv(), Ok(HubEvent::Drained(u)) if u == unit));

        // Reads of a link that was never full stay quiet.
        assert_eq!(hub.send(unit, Bytes::from_static(b"three")), Ok(()));
        assert_eq!(provider.try_recv(), Some(Bytes::from_static(b"three")));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_unregister_closes_link() {
        let (hub, _events) = Hub::new(&ChannelConfig::default());
        let engine = Engine::new(
            Default::default(),
            Arc::new(Registry::new()),
            Arc::clone(&hub) as Arc<dyn ControlChannel>,
        );
        let provider = hub.attach(&engine, GroupOwner::Process(42)).unwrap();
        assert!(provider.unit().is_in_process());
        assert_eq!(hub.provider_count(), 1);

        assert!(hub.unregister(provider.unit()));
        assert!(!hub.unregister(provider.unit()));
        assert_eq!(
            hub.send(provider.unit(), Bytes::new()),
            Err(ChannelError::Disconnected(provider.unit()))
        );
    }
}

mod dispatch_tests {
    use super::*;

    #[test]
    fn test_connect_round_trip() {
        let daemon = daemon_with_link(16);
        let provider = init_provider(&daemon);
        let (socket, flow) = connect_flow(&daemon, provider.unit());

        let frame = provider.recv_frame(WAIT).unwrap().unwrap();
        assert_eq!(frame.header.kind, MessageType::Connect);
        assert_eq!(frame.flow_id(), flow.id());

        let accept = Message::ConnectResult(ConnectResult {
            error_code: 0,
            space_available: Some(1024),
            ..Default::default()
        });
        provider.send_message(flow.id(), &accept).unwrap();

        assert!(eventually(|| flow.is_connected()));
        assert!(socket.state().connected);
        daemon.shutdown();
    }

    #[test]
    fn test_full_link_delivers_in_issue_order() {
        let daemon = daemon_with_link(2);
        let provider = init_provider(&daemon);

        let flows: Vec<_> = (0..6)
            .map(|_| connect_flow(&daemon, provider.unit()))
            .collect();
        assert_eq!(provider.pending(), 2);

        let received: Vec<FlowId> = (0..flows.len())
            .map(|_| {
                let frame = provider.recv_frame(WAIT).unwrap().unwrap();
                assert_eq!(frame.header.kind, MessageType::Connect);
                frame.flow_id()
            })
            .collect();
        let issued: Vec<FlowId> = flows.iter().map(|(_, f)| f.id()).collect();
        assert_eq!(received, issued);
        daemon.shutdown();
    }

    #[test]
    fn test_malformed_message_does_not_stop_dispatch() {
        let daemon = daemon_with_link(16);
        let provider = daemon.attach_provider(GroupOwner::Kernel).unwrap();
        provider.send(Bytes::from_static(&[0xff, 0x00])).unwrap();
        drop(provider);

        // The dispatcher is still serving.
        let provider = init_provider(&daemon);
        assert!(daemon.engine().registry().get(provider.unit()).is_some());
        daemon.shutdown();
    }

    #[test]
    fn test_dropped_provider_resets_flows() {
        let daemon = daemon_with_link(16);
        let provider = init_provider(&daemon);
        let unit = provider.unit();
        let (socket, flow) = connect_flow(&daemon, unit);
        assert!(provider.recv_timeout(WAIT).is_some());

        drop(provider);

        let engine = Arc::clone(daemon.engine());
        assert!(eventually(|| engine.registry().get(unit).is_none()));
        assert!(eventually(|| socket.state().disconnected.is_some()));
        assert_eq!(flow.group(), None);
        assert_eq!(daemon.hub().provider_count(), 0);
        daemon.shutdown();
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let daemon = daemon_with_link(16);
        let provider = init_provider(&daemon);
        daemon.shutdown();

        let result = provider.send_message(FlowId::GROUP, &Message::FlowStatesRequest);
        assert!(matches!(result, Err(HubError::Closed)));
    }
}
